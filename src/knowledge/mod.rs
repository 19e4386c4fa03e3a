//! Knowledge base access.
//!
//! [`KnowledgeObjectClient`] is the raw remote interface, built once for a
//! concrete article type. [`KnowledgeClient`] scopes it to one docset for the
//! length of one reconciliation or publish run and caches listings.

use crate::error::{RemoteError, RemoteService};
use crate::scrub::ArticleFields;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, instrument};

pub mod cache;
pub mod model;
pub mod rest;

pub use cache::ArticleCache;
pub use rest::RestKnowledgeBase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PublishState {
    Draft,
    Online,
    Archived,
}

impl PublishState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishState::Draft => "Draft",
            PublishState::Online => "Online",
            PublishState::Archived => "Archived",
        }
    }

    pub fn parse_state(s: &str) -> Option<Self> {
        match s {
            "Draft" => Some(PublishState::Draft),
            "Online" => Some(PublishState::Online),
            "Archived" => Some(PublishState::Archived),
            _ => None,
        }
    }
}

impl fmt::Display for PublishState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One article version as stored remotely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnowledgeRecord {
    /// Stable id shared by every version of the article.
    pub article_id: String,
    pub version_id: String,
    pub publish_state: PublishState,
    pub fields: ArticleFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordRef {
    pub article_id: String,
    pub version_id: String,
}

#[async_trait]
pub trait KnowledgeObjectClient: Send + Sync {
    async fn list(
        &self,
        docset_id: &str,
        state: PublishState,
    ) -> Result<Vec<KnowledgeRecord>, RemoteError>;

    async fn fetch(&self, version_id: &str) -> Result<Option<KnowledgeRecord>, RemoteError>;

    /// Create a brand new article; its first version is a draft.
    async fn create(&self, docset_id: &str, fields: &ArticleFields)
        -> Result<RecordRef, RemoteError>;

    /// Open a draft version of a published article and return its version id.
    async fn create_draft_from(&self, article_id: &str) -> Result<String, RemoteError>;

    async fn update(&self, version_id: &str, fields: &ArticleFields) -> Result<(), RemoteError>;

    async fn delete(&self, version_id: &str) -> Result<(), RemoteError>;

    async fn set_publish_state(
        &self,
        version_id: &str,
        state: PublishState,
    ) -> Result<(), RemoteError>;
}

/// Docset-scoped view of the knowledge base with a private listing cache.
pub struct KnowledgeClient {
    backend: Arc<dyn KnowledgeObjectClient>,
    docset_id: String,
    cache: ArticleCache,
    draft_base_url: String,
    public_base_url: String,
}

impl KnowledgeClient {
    pub fn new(
        backend: Arc<dyn KnowledgeObjectClient>,
        docset_id: &str,
        draft_base_url: String,
        public_base_url: String,
    ) -> Self {
        Self {
            backend,
            docset_id: docset_id.to_string(),
            cache: ArticleCache::new(),
            draft_base_url,
            public_base_url,
        }
    }

    pub fn docset_id(&self) -> &str {
        &self.docset_id
    }

    pub fn cache(&self) -> &ArticleCache {
        &self.cache
    }

    pub async fn list_all(&self, state: PublishState) -> Result<Vec<KnowledgeRecord>, RemoteError> {
        if let Some(records) = self.cache.get(&self.docset_id, state).await {
            return Ok(records);
        }
        let records = self.backend.list(&self.docset_id, state).await?;
        debug!(docset_id = %self.docset_id, %state, count = records.len(), "article listing cached");
        self.cache.put(&self.docset_id, state, records.clone()).await;
        Ok(records)
    }

    /// Case-insensitive lookup by url slug.
    pub async fn find_by_url_slug(
        &self,
        slug: &str,
        state: PublishState,
    ) -> Result<Option<KnowledgeRecord>, RemoteError> {
        Ok(self
            .list_all(state)
            .await?
            .into_iter()
            .find(|r| r.fields.url_slug.eq_ignore_ascii_case(slug)))
    }

    pub async fn create(&self, fields: &ArticleFields) -> Result<RecordRef, RemoteError> {
        let created = self.backend.create(&self.docset_id, fields).await;
        self.cache.invalidate(&self.docset_id).await;
        created
    }

    pub async fn create_draft_from(&self, article_id: &str) -> Result<String, RemoteError> {
        let created = self.backend.create_draft_from(article_id).await;
        self.cache.invalidate(&self.docset_id).await;
        created
    }

    pub async fn update_draft(&self, version_id: &str, fields: &ArticleFields) -> Result<(), RemoteError> {
        let updated = self.backend.update(version_id, fields).await;
        self.cache.invalidate(&self.docset_id).await;
        updated
    }

    pub async fn delete(&self, version_id: &str) -> Result<(), RemoteError> {
        let deleted = self.backend.delete(version_id).await;
        self.cache.invalidate(&self.docset_id).await;
        deleted
    }

    pub async fn archive(&self, version_id: &str) -> Result<(), RemoteError> {
        let archived = self
            .backend
            .set_publish_state(version_id, PublishState::Archived)
            .await;
        self.cache.invalidate(&self.docset_id).await;
        archived
    }

    /// Point the draft body at production assets, then put the version online.
    #[instrument(skip_all, fields(docset_id = %self.docset_id, version_id = %version_id))]
    pub async fn publish(&self, version_id: &str) -> Result<(), RemoteError> {
        let record = self.backend.fetch(version_id).await?.ok_or_else(|| {
            RemoteError::new(
                RemoteService::KnowledgeBase,
                "publish",
                version_id,
                "draft version not found",
            )
        })?;

        let body = record
            .fields
            .body
            .replace(&self.draft_base_url, &self.public_base_url);
        if body.contains(&self.draft_base_url) {
            return Err(RemoteError::new(
                RemoteService::KnowledgeBase,
                "publish",
                version_id,
                "draft asset reference survived rewriting",
            ));
        }
        let result = async {
            if body != record.fields.body {
                let fields = ArticleFields {
                    body,
                    ..record.fields.clone()
                };
                self.backend.update(version_id, &fields).await?;
            }
            self.backend
                .set_publish_state(version_id, PublishState::Online)
                .await
        }
        .await;
        self.cache.invalidate(&self.docset_id).await;
        if result.is_ok() {
            info!(slug = %record.fields.url_slug, "article published");
        }
        result
    }
}
