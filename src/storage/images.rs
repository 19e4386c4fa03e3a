use super::{content_type, KeyLayout, ObjectStore};
use crate::db::{self, Pool};
use crate::error::PipelineError;
use crate::model::{Image, StagedStatus};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageOutcome {
    Unchanged,
    Staged(StagedStatus),
}

/// Stages image changes for one bundle of one docset.
pub struct ImageStore<'a> {
    pool: &'a Pool,
    objects: &'a dyn ObjectStore,
    layout: KeyLayout,
    bundle_id: i64,
}

impl<'a> ImageStore<'a> {
    pub fn new(pool: &'a Pool, objects: &'a dyn ObjectStore, layout: KeyLayout, bundle_id: i64) -> Self {
        Self {
            pool,
            objects,
            layout,
            bundle_id,
        }
    }

    pub fn layout(&self) -> &KeyLayout {
        &self.layout
    }

    /// Compare a local image with production and stage it in the draft area if it differs.
    #[instrument(skip_all, fields(bundle_id = self.bundle_id, relative_path = %relative_path))]
    pub async fn process_image(
        &self,
        local_path: &Path,
        relative_path: &str,
    ) -> Result<ImageOutcome, PipelineError> {
        let local = tokio::fs::read(local_path).await?;
        let status = match self.objects.get(&self.layout.public_key(relative_path)).await? {
            None => StagedStatus::New,
            Some(live) if live != local => StagedStatus::Changed,
            Some(_) => {
                debug!(relative_path, "image unchanged");
                return Ok(ImageOutcome::Unchanged);
            }
        };
        self.objects
            .put(
                &self.layout.draft_key(relative_path),
                local,
                content_type(local_path),
            )
            .await?;
        db::insert_image(self.pool, self.bundle_id, relative_path, status).await?;
        info!(relative_path, status = status.as_str(), "image staged");
        Ok(ImageOutcome::Staged(status))
    }

    /// Upload to the draft area without staging a record, so previews resolve.
    pub async fn stage_preview(&self, local_path: &Path, relative_path: &str) -> Result<(), PipelineError> {
        let local = tokio::fs::read(local_path).await?;
        self.objects
            .put(
                &self.layout.draft_key(relative_path),
                local,
                content_type(local_path),
            )
            .await?;
        Ok(())
    }

    /// Stage every production image of the docset that is not in `live_paths` as deleted.
    #[instrument(skip_all, fields(bundle_id = self.bundle_id))]
    pub async fn record_deletable(&self, live_paths: &BTreeSet<String>) -> Result<usize, PipelineError> {
        let mut count = 0;
        for key in self.objects.list(self.layout.public_root()).await? {
            let Some(relative_path) = self.layout.relative_from_public(&key) else {
                continue;
            };
            if live_paths.contains(relative_path) {
                continue;
            }
            db::insert_image(self.pool, self.bundle_id, relative_path, StagedStatus::Deleted).await?;
            self.objects
                .delete(&self.layout.draft_key(relative_path))
                .await?;
            count += 1;
        }
        if count > 0 {
            info!(count, "images staged for deletion");
        }
        Ok(count)
    }

    /// Apply one staged image to production.
    pub async fn promote(&self, image: &Image) -> Result<(), PipelineError> {
        let public_key = self.layout.public_key(&image.relative_path);
        match image.status {
            StagedStatus::New | StagedStatus::Changed => {
                self.objects
                    .copy(&self.layout.draft_key(&image.relative_path), &public_key)
                    .await?
            }
            StagedStatus::Deleted => self.objects.delete(&public_key).await?,
        }
        Ok(())
    }

    /// Remove every draft object of the docset.
    pub async fn clear_drafts(&self) -> Result<usize, PipelineError> {
        let keys = self.objects.list(self.layout.draft_root()).await?;
        for key in &keys {
            self.objects.delete(key).await?;
        }
        Ok(keys.len())
    }
}
