use super::{KnowledgeRecord, PublishState};
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Read-through cache of article listings keyed by (docset, publish state).
///
/// Owned by one [`super::KnowledgeClient`]; never shared between executions.
#[derive(Debug, Default)]
pub struct ArticleCache {
    entries: Mutex<HashMap<(String, PublishState), Vec<KnowledgeRecord>>>,
}

impl ArticleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, docset_id: &str, state: PublishState) -> Option<Vec<KnowledgeRecord>> {
        self.entries
            .lock()
            .await
            .get(&(docset_id.to_string(), state))
            .cloned()
    }

    pub async fn put(&self, docset_id: &str, state: PublishState, records: Vec<KnowledgeRecord>) {
        self.entries
            .lock()
            .await
            .insert((docset_id.to_string(), state), records);
    }

    /// Drop every publish state cached for `docset_id`.
    pub async fn invalidate(&self, docset_id: &str) {
        self.entries.lock().await.retain(|(d, _), _| d != docset_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }
}
