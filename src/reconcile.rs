//! Diff a downloaded bundle against the knowledge base and object store,
//! staging every difference as a draft.

use crate::db::{self, NewArticle};
use crate::error::PipelineError;
use crate::knowledge::{KnowledgeClient, PublishState};
use crate::model::{Bundle, StagedStatus};
use crate::scrub::{glob_to_regex, ParsedDocument, Scrubber};
use crate::services::Services;
use crate::source::walk_files;
use crate::storage::{ImageOutcome, ImageStore};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::path::Path;
use tracing::{info, instrument, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub articles_new: usize,
    pub articles_changed: usize,
    pub articles_deleted: usize,
    pub articles_unchanged: usize,
    pub images_staged: usize,
    pub images_deleted: usize,
    /// Documents dropped for problems in lenient mode.
    pub excluded: usize,
    pub index_slug: Option<String>,
}

impl ReconcileSummary {
    pub fn staged(&self) -> usize {
        self.articles_new
            + self.articles_changed
            + self.articles_deleted
            + self.images_staged
            + self.images_deleted
    }
}

fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    Some(
        rel.components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Documents and image files of the bundle, as bundle-relative paths.
struct Inventory {
    documents: Vec<String>,
    images: BTreeSet<String>,
}

fn take_inventory(services: &Services, root: &Path) -> Result<Inventory, PipelineError> {
    let scrub = &services.config.scrub;
    let skip: Vec<Regex> = scrub
        .skip_files
        .iter()
        .map(|p| glob_to_regex(p))
        .collect::<anyhow::Result<_>>()?;
    let mut documents = Vec::new();
    let mut images = BTreeSet::new();
    for path in walk_files(root)? {
        let Some(rel) = relative_path(root, &path) else {
            continue;
        };
        if has_extension(&path, &scrub.html_extensions) {
            let name = rel.rsplit('/').next().unwrap_or(&rel);
            if skip.iter().any(|re| re.is_match(name) || re.is_match(&rel)) {
                continue;
            }
            documents.push(rel);
        } else if has_extension(&path, &scrub.image_extensions) {
            images.insert(rel);
        }
    }
    Ok(Inventory { documents, images })
}

/// Reconcile the bundle unpacked under `root`. Staged records are written as it goes.
#[instrument(skip_all, fields(bundle_id = bundle.id, docset_id = %bundle.docset_id))]
pub async fn run(
    services: &Services,
    bundle: &Bundle,
    root: &Path,
) -> Result<ReconcileSummary, PipelineError> {
    let cfg = &services.config;
    let pool = &services.pool;
    let mut summary = ReconcileSummary::default();

    // 1. enumerate
    let inventory = take_inventory(services, root)?;
    if inventory.documents.is_empty() {
        return Err(PipelineError::validation(vec![
            "bundle contains no documents".to_string(),
        ]));
    }

    // 2. scrub
    let scrubber = Scrubber::new(&cfg.scrub, vec![services.objects.public_url("")])?;
    let mut usable: Vec<ParsedDocument> = Vec::new();
    let mut problems: Vec<String> = Vec::new();
    let mut protected_slugs: HashSet<String> = HashSet::new();
    for rel in &inventory.documents {
        let bytes = tokio::fs::read(root.join(rel)).await?;
        let Ok(html) = String::from_utf8(bytes) else {
            problems.push(format!("{}: not valid UTF-8", rel));
            continue;
        };
        let scrubbed = scrubber.scrub(&html, rel);
        let mut doc_problems = scrubbed.problems;
        if let Some(doc) = &scrubbed.document {
            for image in &doc.images {
                if !inventory.images.contains(image) && !root.join(image).is_file() {
                    doc_problems.push(format!("{}: image {} not found in bundle", rel, image));
                }
            }
        }
        if doc_problems.is_empty() {
            if let Some(doc) = scrubbed.document {
                usable.push(doc);
            }
        } else {
            if let Some(slug) = scrubbed.url_slug {
                protected_slugs.insert(slug.to_lowercase());
            }
            problems.extend(doc_problems);
        }
    }
    if !problems.is_empty() {
        if cfg.scrub.strict || usable.is_empty() {
            return Err(PipelineError::validation(problems));
        }
        summary.excluded = inventory.documents.len() - usable.len();
        for problem in &problems {
            warn!(problem = %problem, "document excluded");
            db::append_bundle_log(pool, bundle.id, "warn", &format!("excluded: {}", problem)).await?;
        }
    }

    // 3. slug map
    let mut by_slug: BTreeMap<String, ParsedDocument> = BTreeMap::new();
    let mut duplicates = Vec::new();
    for doc in usable {
        let key = doc.fields.url_slug.to_lowercase();
        if let Some(existing) = by_slug.get(&key) {
            duplicates.push(format!(
                "url slug {} used by both {} and {}",
                doc.fields.url_slug, existing.path, doc.path
            ));
            continue;
        }
        by_slug.insert(key, doc);
    }
    if !duplicates.is_empty() {
        return Err(PipelineError::validation(duplicates));
    }

    let index_doc = by_slug
        .values()
        .min_by(|a, b| a.depth().cmp(&b.depth()).then_with(|| a.path.cmp(&b.path)));
    if let Some(doc) = index_doc {
        db::set_bundle_index_slug(pool, bundle.id, &doc.fields.url_slug).await?;
        db::set_docset_display_name(pool, &bundle.docset_id, &doc.fields.title).await?;
        summary.index_slug = Some(doc.fields.url_slug.clone());
    }

    let layout = services.layout(&bundle.docset_id);
    let draft_base = layout.draft_base_url(services.objects.as_ref());
    let public_base = layout.public_base_url(services.objects.as_ref());
    let kb: KnowledgeClient = services.knowledge_client(&bundle.docset_id);
    let images = ImageStore::new(pool, services.objects.as_ref(), layout, bundle.id);

    // 4. deletions
    for record in kb.list_all(PublishState::Online).await? {
        let key = record.fields.url_slug.to_lowercase();
        if by_slug.contains_key(&key) || protected_slugs.contains(&key) {
            continue;
        }
        db::insert_article(
            pool,
            &NewArticle {
                bundle_id: bundle.id,
                remote_article_id: &record.article_id,
                remote_version_id: &record.version_id,
                status: StagedStatus::Deleted,
                title: &record.fields.title,
                url_slug: &record.fields.url_slug,
            },
        )
        .await?;
        summary.articles_deleted += 1;
    }

    // 5. new and changed documents
    let placeholder = scrubber.placeholder();
    let mut processed_images: BTreeSet<String> = BTreeSet::new();
    let mut staged_images: BTreeSet<String> = BTreeSet::new();
    let mut preview_images: BTreeSet<String> = BTreeSet::new();
    for doc in by_slug.values() {
        let slug = &doc.fields.url_slug;
        let draft_fields = doc.fields.rendered(placeholder, &draft_base);
        let draft = kb.find_by_url_slug(slug, PublishState::Draft).await?;
        let published = kb.find_by_url_slug(slug, PublishState::Online).await?;

        let staged = match (draft, published) {
            (Some(draft), published) => {
                kb.update_draft(&draft.version_id, &draft_fields).await?;
                let status = if published.is_some() {
                    StagedStatus::Changed
                } else {
                    StagedStatus::New
                };
                Some((draft.article_id, draft.version_id, status))
            }
            (None, None) => {
                let created = kb.create(&draft_fields).await?;
                Some((created.article_id, created.version_id, StagedStatus::New))
            }
            (None, Some(published)) => {
                let production = doc.fields.rendered(placeholder, &public_base);
                if production == published.fields && !cfg.reconcile.force_republish {
                    summary.articles_unchanged += 1;
                    None
                } else {
                    let version_id = kb.create_draft_from(&published.article_id).await?;
                    kb.update_draft(&version_id, &draft_fields).await?;
                    Some((published.article_id, version_id, StagedStatus::Changed))
                }
            }
        };

        if let Some((article_id, version_id, status)) = staged {
            db::insert_article(
                pool,
                &NewArticle {
                    bundle_id: bundle.id,
                    remote_article_id: &article_id,
                    remote_version_id: &version_id,
                    status,
                    title: &doc.fields.title,
                    url_slug: slug,
                },
            )
            .await?;
            match status {
                StagedStatus::New => summary.articles_new += 1,
                _ => summary.articles_changed += 1,
            }
            info!(slug = %slug, status = status.as_str(), "article staged");
            preview_images.extend(doc.images.iter().cloned());
        }

        for image in &doc.images {
            if !processed_images.insert(image.clone()) {
                continue;
            }
            if let ImageOutcome::Staged(_) = images.process_image(&root.join(image), image).await? {
                staged_images.insert(image.clone());
                summary.images_staged += 1;
            }
        }
    }

    // 6. previews
    for image in preview_images.difference(&staged_images) {
        images.stage_preview(&root.join(image), image).await?;
    }

    // 7. image deletions
    summary.images_deleted = images.record_deletable(&inventory.images).await?;

    // 8. nothing to review
    let (staged_articles, staged_image_rows) = db::count_staged(pool, bundle.id).await?;
    if staged_articles == 0 && staged_image_rows == 0 {
        return Err(PipelineError::NoChange);
    }

    db::append_bundle_log(
        pool,
        bundle.id,
        "info",
        &format!(
            "staged {} new, {} changed, {} deleted articles; {} images staged, {} images deleted; {} unchanged",
            summary.articles_new,
            summary.articles_changed,
            summary.articles_deleted,
            summary.images_staged,
            summary.images_deleted,
            summary.articles_unchanged,
        ),
    )
    .await?;
    info!(staged = summary.staged(), "reconciliation complete");
    Ok(summary)
}
