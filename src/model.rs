use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one import/export cycle for a docset.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BundleStatus {
    New,
    Queued,
    Processing,
    Draft,
    PublishWait,
    Publishing,
    Published,
    Rejected,
    Error,
}

impl BundleStatus {
    /// Statuses that hold the docset: only one bundle per docset may be in one of these.
    pub const LIVE: [BundleStatus; 4] = [
        BundleStatus::Processing,
        BundleStatus::Draft,
        BundleStatus::PublishWait,
        BundleStatus::Publishing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BundleStatus::New => "new",
            BundleStatus::Queued => "queued",
            BundleStatus::Processing => "processing",
            BundleStatus::Draft => "draft",
            BundleStatus::PublishWait => "publish_wait",
            BundleStatus::Publishing => "publishing",
            BundleStatus::Published => "published",
            BundleStatus::Rejected => "rejected",
            BundleStatus::Error => "error",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "new" => Some(BundleStatus::New),
            "queued" => Some(BundleStatus::Queued),
            "processing" => Some(BundleStatus::Processing),
            "draft" => Some(BundleStatus::Draft),
            "publish_wait" => Some(BundleStatus::PublishWait),
            "publishing" => Some(BundleStatus::Publishing),
            "published" => Some(BundleStatus::Published),
            "rejected" => Some(BundleStatus::Rejected),
            "error" => Some(BundleStatus::Error),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        Self::LIVE.contains(self)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BundleStatus::Published | BundleStatus::Rejected | BundleStatus::Error
        )
    }

    /// Legal edges of the bundle state machine. Any non-terminal state may fail into `Error`.
    pub fn can_transition_to(&self, next: BundleStatus) -> bool {
        use BundleStatus::*;
        if next == Error {
            return !self.is_terminal();
        }
        matches!(
            (self, next),
            (New, Queued)
                | (Queued, Processing)
                | (Processing, Draft)
                | (Processing, Rejected)
                | (Draft, PublishWait)
                | (Draft, Rejected)
                | (PublishWait, Publishing)
                | (Publishing, Published)
        )
    }
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of change staged for an article or image.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StagedStatus {
    New,
    Changed,
    Deleted,
}

impl StagedStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StagedStatus::New => "new",
            StagedStatus::Changed => "changed",
            StagedStatus::Deleted => "deleted",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "new" => Some(StagedStatus::New),
            "changed" => Some(StagedStatus::Changed),
            "deleted" => Some(StagedStatus::Deleted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WebhookStatus {
    New,
    Accepted,
    Rejected,
}

impl WebhookStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookStatus::New => "new",
            WebhookStatus::Accepted => "accepted",
            WebhookStatus::Rejected => "rejected",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "new" => Some(WebhookStatus::New),
            "accepted" => Some(WebhookStatus::Accepted),
            "rejected" => Some(WebhookStatus::Rejected),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum JobKind {
    ProcessBundle,
    PublishBundle,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::ProcessBundle => "process_bundle",
            JobKind::PublishBundle => "publish_bundle",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "process_bundle" => Some(JobKind::ProcessBundle),
            "publish_bundle" => Some(JobKind::PublishBundle),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Docset {
    pub id: i64,
    pub docset_id: String,
    pub display_name: String,
    pub index_article_remote_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bundle {
    pub id: i64,
    pub source_id: String,
    pub docset_id: String,
    pub status: BundleStatus,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
    pub index_slug: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub bundle_id: i64,
    pub remote_article_id: String,
    pub remote_version_id: String,
    pub status: StagedStatus,
    pub title: String,
    pub url_slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Image {
    pub id: i64,
    pub bundle_id: i64,
    pub relative_path: String,
    pub status: StagedStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub id: i64,
    pub body: String,
    pub status: WebhookStatus,
    pub bundle_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BundleLog {
    pub level: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
