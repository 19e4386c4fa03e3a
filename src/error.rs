//! Error taxonomy for the bundle pipeline.
//!
//! Every fatal error moves the bundle into `error` and persists `kind()` next to the
//! message, so operators can tell a validation failure from "nothing to do" from a
//! remote outage.

use crate::model::BundleStatus;
use std::fmt;
use thiserror::Error;

/// Remote system that produced a [`RemoteError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteService {
    KnowledgeBase,
    ObjectStore,
    BundleSource,
}

impl fmt::Display for RemoteService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemoteService::KnowledgeBase => "knowledge base",
            RemoteService::ObjectStore => "object store",
            RemoteService::BundleSource => "bundle source",
        })
    }
}

/// Non-success response (or transport failure) from one of the remote services.
#[derive(Debug, Error)]
#[error("{service} {operation} failed for {remote_id}{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
pub struct RemoteError {
    pub service: RemoteService,
    pub operation: &'static str,
    pub remote_id: String,
    pub status: Option<u16>,
    pub message: String,
}

impl RemoteError {
    pub fn new(
        service: RemoteService,
        operation: &'static str,
        remote_id: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            service,
            operation,
            remote_id: remote_id.into(),
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bundle failed validation:\n{}", .problems.join("\n"))]
    Validation { problems: Vec<String> },

    #[error("no changes found in bundle")]
    NoChange,

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error("scheduling invariant violated for docset {docset_id}: {message}")]
    SchedulingInvariant { docset_id: String, message: String },

    #[error("bundle {bundle_id} cannot move from {from} to {to}")]
    IllegalTransition {
        bundle_id: i64,
        from: BundleStatus,
        to: BundleStatus,
    },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn validation(problems: Vec<String>) -> Self {
        PipelineError::Validation { problems }
    }

    /// Stable label persisted in `bundles.error_kind`.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Validation { .. } => "validation",
            PipelineError::NoChange => "no_change",
            PipelineError::Remote(_) => "remote",
            PipelineError::SchedulingInvariant { .. } => "scheduling",
            PipelineError::IllegalTransition { .. } | PipelineError::Internal(_) => "internal",
        }
    }
}

impl From<sqlx::Error> for PipelineError {
    fn from(err: sqlx::Error) -> Self {
        PipelineError::Internal(err.into())
    }
}

impl From<std::io::Error> for PipelineError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Internal(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_error_message_names_operation_and_id() {
        let err = RemoteError::new(RemoteService::KnowledgeBase, "publish", "ka0-1", "boom")
            .with_status(500);
        assert_eq!(
            err.to_string(),
            "knowledge base publish failed for ka0-1 (status 500): boom"
        );
    }

    #[test]
    fn kinds_keep_no_change_apart_from_validation() {
        assert_eq!(PipelineError::NoChange.kind(), "no_change");
        assert_eq!(
            PipelineError::validation(vec!["bad tag".into()]).kind(),
            "validation"
        );
        let remote: PipelineError =
            RemoteError::new(RemoteService::ObjectStore, "put", "k", "down").into();
        assert_eq!(remote.kind(), "remote");
    }

    #[test]
    fn validation_message_lists_every_problem() {
        let err = PipelineError::validation(vec!["a.html: one".into(), "b.html: two".into()]);
        let text = err.to_string();
        assert!(text.contains("a.html: one"));
        assert!(text.contains("b.html: two"));
    }
}
