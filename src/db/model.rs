//! Row slices used by repositories and the job worker.
//!
//! Keep these structs focused on the data moved by queries. Business logic
//! should live in higher layers.

use crate::model::{JobKind, StagedStatus};

/// A claimed job. The lease expires on its own if the worker dies mid-run.
#[derive(Debug, Clone)]
pub struct JobLease {
    pub id: i64,
    pub kind: JobKind,
    pub bundle_id: i64,
    pub attempt: i32,
}

/// Outcome of one admission attempt for a docset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted(i64),
    /// Nothing queued, or another bundle already holds the docset.
    Idle,
    /// The unique live-bundle index refused the update.
    Conflict,
}

/// Staged article row to insert.
#[derive(Debug, Clone)]
pub struct NewArticle<'a> {
    pub bundle_id: i64,
    pub remote_article_id: &'a str,
    pub remote_version_id: &'a str,
    pub status: StagedStatus,
    pub title: &'a str,
    pub url_slug: &'a str,
}
