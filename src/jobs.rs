//! Job worker: claims leased jobs from the `jobs` table and drives bundles
//! through processing and publishing.

use crate::db::{self, JobLease};
use crate::error::PipelineError;
use crate::lifecycle;
use crate::model::{BundleStatus, JobKind};
use crate::services::Services;
use crate::{publish, reconcile, scheduler, source};
use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Extra lease time beyond the job budget before another worker may take over.
const LEASE_GRACE_SECS: u64 = 60;

/// Claim and run one due job. Returns `false` when nothing was due.
///
/// Bundle-level failures are recorded on the bundle and the job is done.
/// Infrastructure failures (database) leave the job for a backed-off retry.
#[instrument(skip_all)]
pub async fn process_next_job(services: &Services) -> Result<bool> {
    let pool = &services.pool;
    let app = &services.config.app;
    let lease_secs = (app.job_timeout_seconds + LEASE_GRACE_SECS) as i64;
    let Some(job) = db::claim_next_job(pool, lease_secs).await? else {
        return Ok(false);
    };

    let budget = Duration::from_secs(app.job_timeout_seconds);
    match tokio::time::timeout(budget, handle(services, &job)).await {
        Ok(Ok(())) => {
            db::delete_job(pool, job.id).await?;
            info!(id = job.id, kind = job.kind.as_str(), bundle_id = job.bundle_id, "job succeeded");
        }
        Ok(Err(err)) => {
            warn!(
                ?err,
                id = job.id,
                kind = job.kind.as_str(),
                bundle_id = job.bundle_id,
                attempt = job.attempt,
                "job failed; backoff"
            );
            db::backoff_job_with_cap(pool, job.id, job.attempt, app.max_backoff_seconds as i64)
                .await?;
        }
        Err(_) => {
            let err = PipelineError::Internal(anyhow!(
                "job {} exceeded its {}s budget",
                job.kind.as_str(),
                app.job_timeout_seconds
            ));
            lifecycle::fail(pool, job.bundle_id, &err).await?;
            db::delete_job(pool, job.id).await?;
            if job.kind == JobKind::ProcessBundle {
                remove_work_dirs(services, job.bundle_id).await;
            }
        }
    }
    Ok(true)
}

fn work_dir_prefix(bundle_id: i64) -> String {
    format!("bundle-{}-", bundle_id)
}

/// Remove every work dir of `bundle_id`; a timed-out attempt never cleans up its own.
async fn remove_work_dirs(services: &Services, bundle_id: i64) {
    let root = services.config.app.work_dir();
    let prefix = work_dir_prefix(bundle_id);
    let mut entries = match tokio::fs::read_dir(&root).await {
        Ok(entries) => entries,
        Err(err) => {
            warn!(bundle_id, %err, "failed to list work dirs");
            return;
        }
    };
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!(bundle_id, %err, "failed to list work dirs");
                break;
            }
        };
        if !entry.file_name().to_string_lossy().starts_with(&prefix) {
            continue;
        }
        if let Err(err) = tokio::fs::remove_dir_all(entry.path()).await {
            warn!(bundle_id, %err, path = %entry.path().display(), "failed to remove work dir");
        }
    }
}

/// Run due jobs until none is left.
pub async fn run_until_idle(services: &Services) -> Result<usize> {
    let mut count = 0;
    while process_next_job(services).await? {
        count += 1;
    }
    Ok(count)
}

async fn handle(services: &Services, job: &JobLease) -> Result<(), PipelineError> {
    match job.kind {
        JobKind::ProcessBundle => process_bundle(services, job.bundle_id).await,
        JobKind::PublishBundle => publish_bundle(services, job.bundle_id).await,
    }
}

#[instrument(skip(services))]
async fn process_bundle(services: &Services, bundle_id: i64) -> Result<(), PipelineError> {
    let pool = &services.pool;
    let Some(bundle) = db::fetch_bundle(pool, bundle_id).await? else {
        warn!(bundle_id, "process job for unknown bundle");
        return Ok(());
    };
    if bundle.status != BundleStatus::Processing {
        info!(bundle_id, status = %bundle.status, "bundle not processing; skipping");
        return Ok(());
    }
    let (articles, images) = db::count_staged(pool, bundle_id).await?;
    if articles + images > 0 {
        let err = PipelineError::Internal(anyhow!(
            "processing was interrupted after staging changes; requeue the bundle"
        ));
        return lifecycle::fail(pool, bundle_id, &err).await;
    }

    // Unique per attempt: a worker whose lease expired may still be writing its own copy.
    let work_dir = services
        .config
        .app
        .work_dir()
        .join(format!("{}{}", work_dir_prefix(bundle_id), Uuid::new_v4()));
    let outcome = async {
        services.source.download(&bundle.source_id, &work_dir).await?;
        source::expand_archives(&work_dir, services.config.bundle_source.max_archive_depth)
            .await?;
        reconcile::run(services, &bundle, &work_dir).await
    }
    .await;
    if let Err(err) = tokio::fs::remove_dir_all(&work_dir).await {
        warn!(bundle_id, %err, "failed to remove work dir");
    }

    match outcome {
        Ok(summary) => {
            if db::transition_bundle(pool, bundle_id, BundleStatus::Processing, BundleStatus::Draft)
                .await?
            {
                db::append_bundle_log(pool, bundle_id, "info", "ready for review").await?;
                info!(bundle_id, staged = summary.staged(), "bundle ready for review");
            } else {
                warn!(bundle_id, "bundle left processing while it was reconciled");
            }
            Ok(())
        }
        Err(err) => lifecycle::fail(pool, bundle_id, &err).await,
    }
}

#[instrument(skip(services))]
async fn publish_bundle(services: &Services, bundle_id: i64) -> Result<(), PipelineError> {
    let pool = &services.pool;
    let Some(bundle) = db::fetch_bundle(pool, bundle_id).await? else {
        warn!(bundle_id, "publish job for unknown bundle");
        return Ok(());
    };
    match bundle.status {
        BundleStatus::PublishWait => {
            if !db::transition_bundle(
                pool,
                bundle_id,
                BundleStatus::PublishWait,
                BundleStatus::Publishing,
            )
            .await?
            {
                info!(bundle_id, "bundle moved on before publishing; skipping");
                return Ok(());
            }
        }
        BundleStatus::Publishing => warn!(bundle_id, "resuming interrupted publish"),
        other => {
            info!(bundle_id, status = %other, "bundle not awaiting publish; skipping");
            return Ok(());
        }
    }

    match publish::run(services, &bundle).await {
        Ok(_) => {
            if db::transition_bundle(
                pool,
                bundle_id,
                BundleStatus::Publishing,
                BundleStatus::Published,
            )
            .await?
            {
                info!(bundle_id, "bundle published");
            }
            scheduler::admit(pool).await?;
            Ok(())
        }
        Err(err) => lifecycle::fail(pool, bundle_id, &err).await,
    }
}
