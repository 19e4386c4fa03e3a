use super::model::{Admission, JobLease, NewArticle};
use crate::model::{
    Article, Bundle, BundleLog, BundleStatus, Docset, Image, JobKind, StagedStatus, WebhookEvent,
    WebhookStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Transaction};
use sqlx::{Sqlite, SqlitePool};
use tracing::{instrument, warn};

pub type Pool = SqlitePool;

const BUNDLE_COLUMNS: &str = "id, source_id, docset_id, status, error_kind, error_message, \
                              index_slug, queued_at, processed_at, published_at";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let pool = SqlitePool::connect(&normalized).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);

    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };

    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = format!("sqlite://{expanded_path}");
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    } else {
        rebuilt.push_str("?mode=rwc");
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Webhook events
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_webhook_event(pool: &Pool, body: &str) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO webhook_events (body, status, created_at) VALUES (?, ?, ?) RETURNING id",
    )
    .bind(body)
    .bind(WebhookStatus::New.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

/// Settle a webhook event exactly once; later calls leave it untouched.
#[instrument(skip_all)]
pub async fn resolve_webhook_event(
    pool: &Pool,
    id: i64,
    status: WebhookStatus,
    bundle_id: Option<i64>,
) -> Result<()> {
    sqlx::query("UPDATE webhook_events SET status = ?, bundle_id = ? WHERE id = ? AND status = 'new'")
        .bind(status.as_str())
        .bind(bundle_id)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn fetch_webhook_event(pool: &Pool, id: i64) -> Result<Option<WebhookEvent>> {
    let row = sqlx::query("SELECT id, body, status, bundle_id FROM webhook_events WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let status: String = row.get("status");
    Ok(Some(WebhookEvent {
        id: row.get("id"),
        body: row.get("body"),
        status: WebhookStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("webhook event {} has unknown status {}", id, status))?,
        bundle_id: row.try_get::<Option<i64>, _>("bundle_id")?,
    }))
}

// ---------------------------------------------------------------------------
// Docsets
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn get_or_create_docset(pool: &Pool, docset_id: &str) -> Result<Docset> {
    sqlx::query(
        "INSERT INTO docsets (docset_id, display_name, created_at) VALUES (?, ?, ?) \
         ON CONFLICT(docset_id) DO NOTHING",
    )
    .bind(docset_id)
    .bind(docset_id)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    fetch_docset(pool, docset_id)
        .await?
        .ok_or_else(|| anyhow!("docset {} vanished after insert", docset_id))
}

pub async fn fetch_docset(pool: &Pool, docset_id: &str) -> Result<Option<Docset>> {
    let row = sqlx::query(
        "SELECT id, docset_id, display_name, index_article_remote_id FROM docsets WHERE docset_id = ?",
    )
    .bind(docset_id)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|row| Docset {
        id: row.get("id"),
        docset_id: row.get("docset_id"),
        display_name: row.get("display_name"),
        index_article_remote_id: row
            .try_get::<Option<String>, _>("index_article_remote_id")
            .ok()
            .flatten()
            .filter(|s| !s.trim().is_empty()),
    }))
}

pub async fn set_docset_display_name(pool: &Pool, docset_id: &str, name: &str) -> Result<()> {
    sqlx::query("UPDATE docsets SET display_name = ? WHERE docset_id = ?")
        .bind(name)
        .bind(docset_id)
        .execute(pool)
        .await
        .context("failed to persist docset display name")?;
    Ok(())
}

pub async fn set_docset_index_article(pool: &Pool, docset_id: &str, remote_id: &str) -> Result<()> {
    sqlx::query("UPDATE docsets SET index_article_remote_id = ? WHERE docset_id = ?")
        .bind(remote_id)
        .bind(docset_id)
        .execute(pool)
        .await
        .context("failed to persist docset index article")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Bundles
// ---------------------------------------------------------------------------

fn bundle_from_row(row: &SqliteRow) -> Result<Bundle> {
    let id: i64 = row.get("id");
    let status: String = row.get("status");
    Ok(Bundle {
        id,
        source_id: row.get("source_id"),
        docset_id: row.get("docset_id"),
        status: BundleStatus::parse_state(&status)
            .ok_or_else(|| anyhow!("bundle {} has unknown status {}", id, status))?,
        error_kind: row.try_get::<Option<String>, _>("error_kind")?,
        error_message: row.try_get::<Option<String>, _>("error_message")?,
        index_slug: row.try_get::<Option<String>, _>("index_slug")?,
        queued_at: row.try_get::<Option<DateTime<Utc>>, _>("queued_at")?,
        processed_at: row.try_get::<Option<DateTime<Utc>>, _>("processed_at")?,
        published_at: row.try_get::<Option<DateTime<Utc>>, _>("published_at")?,
    })
}

/// Create a bundle for `source_id` and move it `new -> queued` in one transaction.
/// Returns `None` when a non-terminal bundle for the same export already exists.
#[instrument(skip_all)]
pub async fn create_queued_bundle(
    pool: &Pool,
    source_id: &str,
    docset_id: &str,
) -> Result<Option<i64>> {
    let mut tx = pool.begin().await?;
    let now = Utc::now();
    let bundle_id: Option<i64> = sqlx::query_scalar(
        "INSERT INTO bundles (source_id, docset_id, status, created_at) \
         SELECT ?, ?, 'new', ? \
         WHERE NOT EXISTS (SELECT 1 FROM bundles WHERE source_id = ? \
                           AND status NOT IN ('published', 'rejected', 'error')) \
         RETURNING id",
    )
    .bind(source_id)
    .bind(docset_id)
    .bind(now)
    .bind(source_id)
    .fetch_optional(&mut *tx)
    .await?;
    let Some(bundle_id) = bundle_id else {
        return Ok(None);
    };
    sqlx::query("UPDATE bundles SET status = 'queued', queued_at = ? WHERE id = ? AND status = 'new'")
        .bind(now)
        .bind(bundle_id)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(Some(bundle_id))
}

pub async fn fetch_bundle(pool: &Pool, id: i64) -> Result<Option<Bundle>> {
    let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE id = ?");
    let row = sqlx::query(&sql).bind(id).fetch_optional(pool).await?;
    row.as_ref().map(bundle_from_row).transpose()
}

pub async fn list_bundles(pool: &Pool, limit: i64) -> Result<Vec<Bundle>> {
    let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles ORDER BY id DESC LIMIT ?");
    let rows = sqlx::query(&sql).bind(limit).fetch_all(pool).await?;
    rows.iter().map(bundle_from_row).collect()
}

pub async fn list_bundles_for_docset(pool: &Pool, docset_id: &str) -> Result<Vec<Bundle>> {
    let sql = format!("SELECT {BUNDLE_COLUMNS} FROM bundles WHERE docset_id = ? ORDER BY id ASC");
    let rows = sqlx::query(&sql).bind(docset_id).fetch_all(pool).await?;
    rows.iter().map(bundle_from_row).collect()
}

pub async fn count_live_bundles(pool: &Pool, docset_id: &str) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM bundles WHERE docset_id = ? \
         AND status IN ('processing', 'draft', 'publish_wait', 'publishing')",
    )
    .bind(docset_id)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

/// Compare-and-set the bundle status. Returns false if the bundle was not in `from`.
#[instrument(skip_all, fields(bundle_id = id, %from, %to))]
pub async fn transition_bundle(
    pool: &Pool,
    id: i64,
    from: BundleStatus,
    to: BundleStatus,
) -> Result<bool> {
    let stamp_column = match to {
        BundleStatus::Queued => Some("queued_at"),
        BundleStatus::Draft => Some("processed_at"),
        BundleStatus::Rejected if from == BundleStatus::Processing => Some("processed_at"),
        BundleStatus::Published => Some("published_at"),
        _ => None,
    };
    let result = match stamp_column {
        Some(column) => {
            let sql =
                format!("UPDATE bundles SET status = ?, {column} = ? WHERE id = ? AND status = ?");
            sqlx::query(&sql)
                .bind(to.as_str())
                .bind(Utc::now())
                .bind(id)
                .bind(from.as_str())
                .execute(pool)
                .await?
        }
        None => {
            sqlx::query("UPDATE bundles SET status = ? WHERE id = ? AND status = ?")
                .bind(to.as_str())
                .bind(id)
                .bind(from.as_str())
                .execute(pool)
                .await?
        }
    };
    Ok(result.rows_affected() == 1)
}

/// Compare-and-set the status and enqueue a job for the bundle in one transaction.
#[instrument(skip_all, fields(bundle_id = id, %from, %to))]
pub async fn transition_bundle_with_job(
    pool: &Pool,
    id: i64,
    from: BundleStatus,
    to: BundleStatus,
    kind: JobKind,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let result = sqlx::query("UPDATE bundles SET status = ? WHERE id = ? AND status = ?")
        .bind(to.as_str())
        .bind(id)
        .bind(from.as_str())
        .execute(&mut *tx)
        .await?;
    if result.rows_affected() != 1 {
        return Ok(false);
    }
    enqueue_job_tx(&mut tx, kind, id, Utc::now()).await?;
    tx.commit().await?;
    Ok(true)
}

/// Move a non-terminal bundle into `error`, persisting the error kind and message.
#[instrument(skip_all, fields(bundle_id = id, kind = %kind))]
pub async fn fail_bundle(pool: &Pool, id: i64, kind: &str, message: &str) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE bundles SET status = 'error', error_kind = ?, error_message = ?, \
         processed_at = COALESCE(processed_at, ?) \
         WHERE id = ? AND status NOT IN ('published', 'rejected', 'error')",
    )
    .bind(kind)
    .bind(message)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn set_bundle_index_slug(pool: &Pool, id: i64, slug: &str) -> Result<()> {
    sqlx::query("UPDATE bundles SET index_slug = ? WHERE id = ?")
        .bind(slug)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to persist bundle index slug")?;
    Ok(())
}

/// Docsets with at least one queued bundle, the longest-waiting first.
pub async fn queued_docsets(pool: &Pool) -> Result<Vec<String>> {
    let ids: Vec<String> = sqlx::query_scalar(
        "SELECT docset_id FROM bundles WHERE status = 'queued' \
         GROUP BY docset_id ORDER BY MIN(queued_at) ASC",
    )
    .fetch_all(pool)
    .await?;
    Ok(ids)
}

/// Promote the oldest queued bundle of `docset_id` to `processing` if the docset is free,
/// enqueueing its processing job in the same transaction.
///
/// The conditional update is a single statement, so two workers can never both see the
/// docset as free; the partial unique index on live bundles backs it up.
#[instrument(skip_all, fields(docset_id = %docset_id))]
pub async fn admit_next_for_docset(pool: &Pool, docset_id: &str) -> Result<Admission> {
    let mut tx = pool.begin().await?;
    let admitted = sqlx::query_scalar::<_, i64>(
        "UPDATE bundles SET status = 'processing' \
         WHERE id = (SELECT id FROM bundles WHERE docset_id = ? AND status = 'queued' \
                     ORDER BY queued_at ASC, id ASC LIMIT 1) \
         AND NOT EXISTS (SELECT 1 FROM bundles WHERE docset_id = ? \
                         AND status IN ('processing', 'draft', 'publish_wait', 'publishing')) \
         RETURNING id",
    )
    .bind(docset_id)
    .bind(docset_id)
    .fetch_optional(&mut *tx)
    .await;

    let admitted = match admitted {
        Ok(admitted) => admitted,
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            warn!(docset_id, error = %db_err, "live bundle index refused admission");
            return Ok(Admission::Conflict);
        }
        Err(err) => return Err(err.into()),
    };
    let Some(bundle_id) = admitted else {
        return Ok(Admission::Idle);
    };

    enqueue_job_tx(&mut tx, JobKind::ProcessBundle, bundle_id, Utc::now()).await?;
    tx.commit().await?;
    Ok(Admission::Admitted(bundle_id))
}

// ---------------------------------------------------------------------------
// Staged articles and images
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn insert_article(pool: &Pool, article: &NewArticle<'_>) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO articles (bundle_id, remote_article_id, remote_version_id, status, title, url_slug, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(article.bundle_id)
    .bind(article.remote_article_id)
    .bind(article.remote_version_id)
    .bind(article.status.as_str())
    .bind(article.title)
    .bind(article.url_slug)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn list_articles(pool: &Pool, bundle_id: i64) -> Result<Vec<Article>> {
    let rows = sqlx::query(
        "SELECT id, bundle_id, remote_article_id, remote_version_id, status, title, url_slug \
         FROM articles WHERE bundle_id = ? ORDER BY url_slug ASC, id ASC",
    )
    .bind(bundle_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let status: String = row.get("status");
            Ok(Article {
                id,
                bundle_id: row.get("bundle_id"),
                remote_article_id: row.get("remote_article_id"),
                remote_version_id: row.get("remote_version_id"),
                status: StagedStatus::parse_state(&status)
                    .ok_or_else(|| anyhow!("article {} has unknown status {}", id, status))?,
                title: row.get("title"),
                url_slug: row.get("url_slug"),
            })
        })
        .collect()
}

#[instrument(skip_all)]
pub async fn insert_image(
    pool: &Pool,
    bundle_id: i64,
    relative_path: &str,
    status: StagedStatus,
) -> Result<i64> {
    let id: i64 = sqlx::query(
        "INSERT INTO images (bundle_id, relative_path, status, created_at) VALUES (?, ?, ?, ?) RETURNING id",
    )
    .bind(bundle_id)
    .bind(relative_path)
    .bind(status.as_str())
    .bind(Utc::now())
    .fetch_one(pool)
    .await?
    .get("id");
    Ok(id)
}

pub async fn list_images(pool: &Pool, bundle_id: i64) -> Result<Vec<Image>> {
    let rows = sqlx::query(
        "SELECT id, bundle_id, relative_path, status FROM images \
         WHERE bundle_id = ? ORDER BY relative_path ASC, id ASC",
    )
    .bind(bundle_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let status: String = row.get("status");
            Ok(Image {
                id,
                bundle_id: row.get("bundle_id"),
                relative_path: row.get("relative_path"),
                status: StagedStatus::parse_state(&status)
                    .ok_or_else(|| anyhow!("image {} has unknown status {}", id, status))?,
            })
        })
        .collect()
}

/// Number of staged (article, image) records for a bundle.
pub async fn count_staged(pool: &Pool, bundle_id: i64) -> Result<(i64, i64)> {
    let articles: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM articles WHERE bundle_id = ?")
        .bind(bundle_id)
        .fetch_one(pool)
        .await?;
    let images: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM images WHERE bundle_id = ?")
        .bind(bundle_id)
        .fetch_one(pool)
        .await?;
    Ok((articles, images))
}

// ---------------------------------------------------------------------------
// Bundle logs
// ---------------------------------------------------------------------------

pub async fn append_bundle_log(pool: &Pool, bundle_id: i64, level: &str, message: &str) -> Result<()> {
    sqlx::query("INSERT INTO bundle_logs (bundle_id, level, message, created_at) VALUES (?, ?, ?, ?)")
        .bind(bundle_id)
        .bind(level)
        .bind(message)
        .bind(Utc::now())
        .execute(pool)
        .await
        .context("failed to append bundle log")?;
    Ok(())
}

pub async fn list_bundle_logs(pool: &Pool, bundle_id: i64) -> Result<Vec<BundleLog>> {
    let rows = sqlx::query(
        "SELECT level, message, created_at FROM bundle_logs WHERE bundle_id = ? ORDER BY id ASC",
    )
    .bind(bundle_id)
    .fetch_all(pool)
    .await?;
    rows.into_iter()
        .map(|row| {
            Ok(BundleLog {
                level: row.get("level"),
                message: row.get("message"),
                created_at: row.try_get("created_at")?,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Jobs
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn enqueue_job(
    pool: &Pool,
    kind: JobKind,
    bundle_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let mut tx = pool.begin().await?;
    let id = enqueue_job_tx(&mut tx, kind, bundle_id, due_at).await?;
    tx.commit().await?;
    Ok(id)
}

async fn enqueue_job_tx(
    tx: &mut Transaction<'_, Sqlite>,
    kind: JobKind,
    bundle_id: i64,
    due_at: DateTime<Utc>,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO jobs (kind, bundle_id, attempt, due_at, created_at) VALUES (?, ?, 0, ?, ?) RETURNING id",
    )
    .bind(kind.as_str())
    .bind(bundle_id)
    .bind(due_at)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;
    Ok(rec.get("id"))
}

/// Lease the next due job for `lease_secs`. Expired leases are claimable again.
#[instrument(skip_all)]
pub async fn claim_next_job(pool: &Pool, lease_secs: i64) -> Result<Option<JobLease>> {
    let row = sqlx::query(
        "UPDATE jobs SET locked_until = datetime('now', ? || ' seconds') \
         WHERE id = (SELECT id FROM jobs \
                     WHERE datetime(due_at) <= CURRENT_TIMESTAMP \
                     AND (locked_until IS NULL OR datetime(locked_until) <= CURRENT_TIMESTAMP) \
                     ORDER BY datetime(due_at) ASC, id ASC LIMIT 1) \
         RETURNING id, kind, bundle_id, attempt",
    )
    .bind(lease_secs)
    .fetch_optional(pool)
    .await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let id: i64 = row.get("id");
    let kind: String = row.get("kind");
    Ok(Some(JobLease {
        id,
        kind: JobKind::parse_kind(&kind)
            .ok_or_else(|| anyhow!("job {} has unknown kind {}", id, kind))?,
        bundle_id: row.get("bundle_id"),
        attempt: row.get("attempt"),
    }))
}

#[instrument(skip_all)]
pub async fn delete_job(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query("DELETE FROM jobs WHERE id = ?")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Exponential backoff: 5s * 2^attempt, capped at `max_cap_secs` (or uncapped when <= 0).
#[instrument(skip_all)]
pub async fn backoff_job_with_cap(
    pool: &Pool,
    id: i64,
    attempt: i32,
    max_cap_secs: i64,
) -> Result<()> {
    let secs = (5_i64) * (1_i64 << attempt.clamp(0, 10));
    let cap = if max_cap_secs <= 0 { secs } else { max_cap_secs };
    let secs = secs.min(cap);
    sqlx::query(
        "UPDATE jobs SET attempt = ?, locked_until = NULL, due_at = datetime('now', ? || ' seconds') WHERE id = ?",
    )
    .bind(attempt + 1)
    .bind(secs)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn count_pending_jobs(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM jobs")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    #[test]
    fn memory_urls_pass_through() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }

    #[test]
    fn file_urls_gain_create_mode() {
        let td = tempfile::tempdir().unwrap();
        let path = td.path().join("nested").join("db.sqlite");
        let url = prepare_sqlite_url(&format!("sqlite://{}", path.display()));
        assert_eq!(url, format!("sqlite://{}?mode=rwc", path.display()));
        assert!(path.parent().unwrap().exists());
    }

    #[tokio::test]
    async fn duplicate_export_is_not_queued_twice() {
        let pool = setup_pool().await;
        get_or_create_docset(&pool, "ds-1").await.unwrap();
        let first = create_queued_bundle(&pool, "export-1", "ds-1").await.unwrap();
        assert!(first.is_some());
        let second = create_queued_bundle(&pool, "export-1", "ds-1").await.unwrap();
        assert!(second.is_none());

        let bundle = fetch_bundle(&pool, first.unwrap()).await.unwrap().unwrap();
        assert_eq!(bundle.status, BundleStatus::Queued);
        assert!(bundle.queued_at.is_some());
    }

    #[tokio::test]
    async fn admission_takes_oldest_and_blocks_docset() {
        let pool = setup_pool().await;
        get_or_create_docset(&pool, "ds-1").await.unwrap();
        let a = create_queued_bundle(&pool, "export-a", "ds-1").await.unwrap().unwrap();
        let b = create_queued_bundle(&pool, "export-b", "ds-1").await.unwrap().unwrap();

        assert_eq!(
            admit_next_for_docset(&pool, "ds-1").await.unwrap(),
            Admission::Admitted(a)
        );
        assert_eq!(admit_next_for_docset(&pool, "ds-1").await.unwrap(), Admission::Idle);
        assert_eq!(count_live_bundles(&pool, "ds-1").await.unwrap(), 1);

        let job = claim_next_job(&pool, 60).await.unwrap().unwrap();
        assert_eq!(job.kind, JobKind::ProcessBundle);
        assert_eq!(job.bundle_id, a);

        assert!(fail_bundle(&pool, a, "internal", "boom").await.unwrap());
        assert_eq!(
            admit_next_for_docset(&pool, "ds-1").await.unwrap(),
            Admission::Admitted(b)
        );
    }

    #[tokio::test]
    async fn unique_index_refuses_second_live_bundle() {
        let pool = setup_pool().await;
        get_or_create_docset(&pool, "ds-1").await.unwrap();
        let a = create_queued_bundle(&pool, "export-a", "ds-1").await.unwrap().unwrap();
        let b = create_queued_bundle(&pool, "export-b", "ds-1").await.unwrap().unwrap();
        assert!(transition_bundle(&pool, a, BundleStatus::Queued, BundleStatus::Processing)
            .await
            .unwrap());
        let err = transition_bundle(&pool, b, BundleStatus::Queued, BundleStatus::Processing)
            .await
            .unwrap_err();
        assert!(err.to_string().to_lowercase().contains("unique"));
    }

    #[tokio::test]
    async fn transition_is_compare_and_set() {
        let pool = setup_pool().await;
        get_or_create_docset(&pool, "ds-1").await.unwrap();
        let a = create_queued_bundle(&pool, "export-a", "ds-1").await.unwrap().unwrap();
        assert!(!transition_bundle(&pool, a, BundleStatus::Draft, BundleStatus::PublishWait)
            .await
            .unwrap());
        assert!(fail_bundle(&pool, a, "validation", "bad").await.unwrap());
        assert!(!fail_bundle(&pool, a, "validation", "again").await.unwrap());
        let bundle = fetch_bundle(&pool, a).await.unwrap().unwrap();
        assert_eq!(bundle.error_message.as_deref(), Some("bad"));
    }

    #[tokio::test]
    async fn job_backoff_and_lease() {
        let pool = setup_pool().await;
        get_or_create_docset(&pool, "ds-1").await.unwrap();
        let a = create_queued_bundle(&pool, "export-a", "ds-1").await.unwrap().unwrap();
        enqueue_job(&pool, JobKind::PublishBundle, a, Utc::now()).await.unwrap();

        let job = claim_next_job(&pool, 600).await.unwrap().unwrap();
        assert!(claim_next_job(&pool, 600).await.unwrap().is_none());

        backoff_job_with_cap(&pool, job.id, job.attempt, 60).await.unwrap();
        assert!(claim_next_job(&pool, 600).await.unwrap().is_none());
        let attempt: i32 = sqlx::query_scalar("SELECT attempt FROM jobs WHERE id = ?")
            .bind(job.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(attempt, 1);

        delete_job(&pool, job.id).await.unwrap();
        assert_eq!(count_pending_jobs(&pool).await.unwrap(), 0);
    }
}
