//! Promote an approved bundle's staged diff to production.

use crate::db;
use crate::error::PipelineError;
use crate::knowledge::PublishState;
use crate::model::{Bundle, StagedStatus};
use crate::services::Services;
use crate::storage::ImageStore;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishSummary {
    pub articles_published: usize,
    pub articles_archived: usize,
    pub images_promoted: usize,
    pub images_removed: usize,
    pub drafts_cleared: usize,
}

/// Apply the recorded diff. Images go first so published bodies never point at
/// production assets that do not exist yet.
#[instrument(skip_all, fields(bundle_id = bundle.id, docset_id = %bundle.docset_id))]
pub async fn run(services: &Services, bundle: &Bundle) -> Result<PublishSummary, PipelineError> {
    let pool = &services.pool;
    let mut summary = PublishSummary::default();
    let layout = services.layout(&bundle.docset_id);
    let images = ImageStore::new(pool, services.objects.as_ref(), layout, bundle.id);
    let kb = services.knowledge_client(&bundle.docset_id);

    for image in db::list_images(pool, bundle.id).await? {
        images.promote(&image).await?;
        match image.status {
            StagedStatus::Deleted => summary.images_removed += 1,
            _ => summary.images_promoted += 1,
        }
    }

    for article in db::list_articles(pool, bundle.id).await? {
        match article.status {
            StagedStatus::New | StagedStatus::Changed => {
                kb.publish(&article.remote_version_id).await?;
                summary.articles_published += 1;
            }
            StagedStatus::Deleted => {
                if let Some(draft) = kb
                    .find_by_url_slug(&article.url_slug, PublishState::Draft)
                    .await?
                {
                    kb.delete(&draft.version_id).await?;
                }
                kb.archive(&article.remote_version_id).await?;
                summary.articles_archived += 1;
            }
        }
    }

    summary.drafts_cleared = images.clear_drafts().await?;

    if let Some(slug) = &bundle.index_slug {
        match kb.find_by_url_slug(slug, PublishState::Online).await? {
            Some(record) => {
                db::set_docset_index_article(pool, &bundle.docset_id, &record.article_id).await?
            }
            None => warn!(slug = %slug, "index article not online after publish"),
        }
    }

    db::append_bundle_log(
        pool,
        bundle.id,
        "info",
        &format!(
            "published {} articles, archived {}; promoted {} images, removed {}",
            summary.articles_published,
            summary.articles_archived,
            summary.images_promoted,
            summary.images_removed
        ),
    )
    .await?;
    info!(?summary, "bundle promoted");
    Ok(summary)
}
