//! Bundle lifecycle entry points: webhook ingestion, review decisions, requeue.

use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::{Bundle, BundleStatus, JobKind, WebhookEvent, WebhookStatus};
use crate::scheduler;
use crate::storage;
use anyhow::anyhow;
use serde::Deserialize;
use tracing::{error, info, instrument, warn};

const EXPORT_COMPLETE: &str = "export-complete";
const PUBLISH_SUCCESS: &str = "success";

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    event_id: String,
    event_data: WebhookEventData,
    resource_id: String,
}

#[derive(Debug, Deserialize)]
struct WebhookEventData {
    #[serde(rename = "publish-result")]
    publish_result: String,
    #[serde(rename = "output-uuid")]
    output_uuid: String,
}

/// Parsed notification that an export finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEvent {
    pub event_kind: String,
    pub publish_result: String,
    pub export_id: String,
    pub docset_id: String,
}

impl ExportEvent {
    pub fn parse(body: &str) -> Result<Self, serde_json::Error> {
        let payload: WebhookPayload = serde_json::from_str(body)?;
        Ok(Self {
            event_kind: payload.event_id,
            publish_result: payload.event_data.publish_result,
            export_id: payload.event_data.output_uuid,
            docset_id: payload.resource_id,
        })
    }

    pub fn is_successful_export(&self) -> bool {
        self.event_kind == EXPORT_COMPLETE
            && self.publish_result == PUBLISH_SUCCESS
            && !self.export_id.trim().is_empty()
            && storage::is_valid_docset_id(&self.docset_id)
    }
}

async fn load_bundle(pool: &Pool, bundle_id: i64) -> Result<Bundle, PipelineError> {
    db::fetch_bundle(pool, bundle_id)
        .await?
        .ok_or_else(|| PipelineError::Internal(anyhow!("bundle {} not found", bundle_id)))
}

async fn load_event(pool: &Pool, event_id: i64) -> Result<WebhookEvent, PipelineError> {
    db::fetch_webhook_event(pool, event_id)
        .await?
        .ok_or_else(|| PipelineError::Internal(anyhow!("webhook event {} not found", event_id)))
}

/// Record a webhook and, if it announces a successful export, queue a bundle for it.
#[instrument(skip_all)]
pub async fn ingest_webhook(pool: &Pool, body: &str) -> Result<WebhookEvent, PipelineError> {
    let event_id = db::insert_webhook_event(pool, body).await?;

    let event = match ExportEvent::parse(body) {
        Ok(event) if event.is_successful_export() => event,
        Ok(event) => {
            info!(event_id, kind = %event.event_kind, result = %event.publish_result, "webhook ignored");
            db::resolve_webhook_event(pool, event_id, WebhookStatus::Rejected, None).await?;
            return load_event(pool, event_id).await;
        }
        Err(err) => {
            warn!(event_id, %err, "malformed webhook body");
            db::resolve_webhook_event(pool, event_id, WebhookStatus::Rejected, None).await?;
            return load_event(pool, event_id).await;
        }
    };

    db::get_or_create_docset(pool, &event.docset_id).await?;
    let Some(bundle_id) = db::create_queued_bundle(pool, &event.export_id, &event.docset_id).await?
    else {
        info!(event_id, export_id = %event.export_id, "export already has a pending bundle");
        db::resolve_webhook_event(pool, event_id, WebhookStatus::Rejected, None).await?;
        return load_event(pool, event_id).await;
    };

    db::resolve_webhook_event(pool, event_id, WebhookStatus::Accepted, Some(bundle_id)).await?;
    db::append_bundle_log(
        pool,
        bundle_id,
        "info",
        &format!("queued from export {}", event.export_id),
    )
    .await?;
    info!(event_id, bundle_id, docset_id = %event.docset_id, "bundle queued");
    scheduler::admit(pool).await?;
    load_event(pool, event_id).await
}

/// Reviewer approval: `draft -> publish_wait` and schedule the publish job.
#[instrument(skip(pool))]
pub async fn approve(pool: &Pool, bundle_id: i64) -> Result<(), PipelineError> {
    let bundle = load_bundle(pool, bundle_id).await?;
    let moved = db::transition_bundle_with_job(
        pool,
        bundle_id,
        BundleStatus::Draft,
        BundleStatus::PublishWait,
        JobKind::PublishBundle,
    )
    .await?;
    if !moved {
        return Err(PipelineError::IllegalTransition {
            bundle_id,
            from: bundle.status,
            to: BundleStatus::PublishWait,
        });
    }
    db::append_bundle_log(pool, bundle_id, "info", "approved for publishing").await?;
    info!(bundle_id, "bundle approved");
    Ok(())
}

/// Reviewer rejection: `draft -> rejected`, freeing the docset.
#[instrument(skip(pool))]
pub async fn reject(pool: &Pool, bundle_id: i64) -> Result<(), PipelineError> {
    let bundle = load_bundle(pool, bundle_id).await?;
    if !db::transition_bundle(pool, bundle_id, BundleStatus::Draft, BundleStatus::Rejected).await? {
        return Err(PipelineError::IllegalTransition {
            bundle_id,
            from: bundle.status,
            to: BundleStatus::Rejected,
        });
    }
    db::append_bundle_log(pool, bundle_id, "info", "rejected by reviewer").await?;
    info!(bundle_id, "bundle rejected");
    scheduler::admit(pool).await?;
    Ok(())
}

/// Create a fresh queued bundle for the same export as a terminal one.
#[instrument(skip(pool))]
pub async fn requeue(pool: &Pool, bundle_id: i64) -> Result<i64, PipelineError> {
    let bundle = load_bundle(pool, bundle_id).await?;
    if !bundle.status.is_terminal() {
        return Err(PipelineError::IllegalTransition {
            bundle_id,
            from: bundle.status,
            to: BundleStatus::Queued,
        });
    }
    let new_id = db::create_queued_bundle(pool, &bundle.source_id, &bundle.docset_id)
        .await?
        .ok_or_else(|| {
            PipelineError::Internal(anyhow!(
                "export {} already has a pending bundle",
                bundle.source_id
            ))
        })?;
    db::append_bundle_log(
        pool,
        new_id,
        "info",
        &format!("requeued from bundle {}", bundle_id),
    )
    .await?;
    info!(bundle_id, new_id, "bundle requeued");
    scheduler::admit(pool).await?;
    Ok(new_id)
}

/// Move a bundle into `error` with the failure's kind and message, then let the
/// next queued bundle in.
pub async fn fail(pool: &Pool, bundle_id: i64, err: &PipelineError) -> Result<(), PipelineError> {
    let message = err.to_string();
    if db::fail_bundle(pool, bundle_id, err.kind(), &message).await? {
        error!(bundle_id, kind = err.kind(), %message, "bundle failed");
        db::append_bundle_log(pool, bundle_id, "error", &message).await?;
    }
    scheduler::admit(pool).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_export_event() {
        let body = r#"{"event_id":"export-complete","event_data":{"publish-result":"success","output-uuid":"exp-1"},"resource_id":"ds-1"}"#;
        let event = ExportEvent::parse(body).unwrap();
        assert_eq!(event.export_id, "exp-1");
        assert_eq!(event.docset_id, "ds-1");
        assert!(event.is_successful_export());
    }

    #[test]
    fn failed_exports_are_not_accepted() {
        let body = r#"{"event_id":"export-complete","event_data":{"publish-result":"failure","output-uuid":"exp-1"},"resource_id":"ds-1"}"#;
        assert!(!ExportEvent::parse(body).unwrap().is_successful_export());
        let body = r#"{"event_id":"dita-ot-publish-complete","event_data":{"publish-result":"success","output-uuid":"exp-1"},"resource_id":"ds-1"}"#;
        assert!(!ExportEvent::parse(body).unwrap().is_successful_export());
    }

    #[test]
    fn nested_docset_ids_are_not_accepted() {
        for docset in ["ds/sub", "../ds", ""] {
            let body = format!(
                r#"{{"event_id":"export-complete","event_data":{{"publish-result":"success","output-uuid":"exp-1"}},"resource_id":"{}"}}"#,
                docset
            );
            assert!(!ExportEvent::parse(&body).unwrap().is_successful_export(), "{}", docset);
        }
    }
}
