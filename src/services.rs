use crate::config::Config;
use crate::db::Pool;
use crate::knowledge::{self, KnowledgeClient, KnowledgeObjectClient};
use crate::source::{self, BundleSource};
use crate::storage::{self, KeyLayout, ObjectStore};
use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;

/// Everything a job needs: the database plus the three remote systems.
#[derive(Clone)]
pub struct Services {
    pub pool: Pool,
    pub config: Arc<Config>,
    pub knowledge: Arc<dyn KnowledgeObjectClient>,
    pub objects: Arc<dyn ObjectStore>,
    pub source: Arc<dyn BundleSource>,
}

impl Services {
    /// Wire the real remote backends from configuration.
    pub fn from_config(pool: Pool, config: Config) -> Result<Self> {
        let timeout = Duration::from_secs(config.app.request_timeout_seconds);
        let knowledge = Arc::new(knowledge::RestKnowledgeBase::from_config(
            &config.knowledge,
            timeout,
        )?);
        let objects = storage::from_config(&config.object_store, timeout)?;
        let source = source::from_config(&config.bundle_source, timeout)?;
        Ok(Self {
            pool,
            config: Arc::new(config),
            knowledge,
            objects,
            source,
        })
    }

    pub fn layout(&self, docset_id: &str) -> KeyLayout {
        KeyLayout::new(&self.config.object_store, docset_id)
    }

    /// A fresh docset-scoped client; its cache lives as long as the returned value.
    pub fn knowledge_client(&self, docset_id: &str) -> KnowledgeClient {
        let layout = self.layout(docset_id);
        KnowledgeClient::new(
            self.knowledge.clone(),
            docset_id,
            layout.draft_base_url(self.objects.as_ref()),
            layout.public_base_url(self.objects.as_ref()),
        )
    }
}
