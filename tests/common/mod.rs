#![allow(dead_code)]

use async_trait::async_trait;
use docset_publisher::config::{self, Config, ObjectStoreBackend};
use docset_publisher::db::{self, Pool};
use docset_publisher::error::{RemoteError, RemoteService};
use docset_publisher::knowledge::{KnowledgeObjectClient, KnowledgeRecord, PublishState, RecordRef};
use docset_publisher::model::{Bundle, WebhookEvent};
use docset_publisher::scrub::ArticleFields;
use docset_publisher::services::Services;
use docset_publisher::source::DirectoryBundleSource;
use docset_publisher::storage::LocalObjectStore;
use docset_publisher::{jobs, lifecycle};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

pub const DOCSET: &str = "ds-1";

pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

#[derive(Debug, Clone)]
struct StoredRecord {
    docset_id: String,
    record: KnowledgeRecord,
}

/// In-memory knowledge base that records every call.
#[derive(Default)]
pub struct FakeKnowledgeBase {
    records: Mutex<BTreeMap<String, StoredRecord>>,
    next_id: Mutex<u32>,
    calls: Mutex<Vec<String>>,
    fail_operation: Mutex<Option<&'static str>>,
}

impl FakeKnowledgeBase {
    pub async fn calls(&self) -> Vec<String> {
        self.calls.lock().await.clone()
    }

    pub async fn fail_on(&self, operation: Option<&'static str>) {
        *self.fail_operation.lock().await = operation;
    }

    pub async fn records(&self, state: PublishState) -> Vec<KnowledgeRecord> {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| r.record.publish_state == state)
            .map(|r| r.record.clone())
            .collect()
    }

    pub async fn slugs(&self, state: PublishState) -> Vec<String> {
        let mut slugs: Vec<String> = self
            .records(state)
            .await
            .into_iter()
            .map(|r| r.fields.url_slug)
            .collect();
        slugs.sort();
        slugs
    }

    async fn enter(&self, operation: &'static str, remote_id: &str) -> Result<(), RemoteError> {
        self.calls
            .lock()
            .await
            .push(format!("{} {}", operation, remote_id));
        if *self.fail_operation.lock().await == Some(operation) {
            return Err(
                RemoteError::new(RemoteService::KnowledgeBase, operation, remote_id, "injected")
                    .with_status(500),
            );
        }
        Ok(())
    }

    async fn next_id(&self, prefix: &str) -> String {
        let mut n = self.next_id.lock().await;
        *n += 1;
        format!("{}{}", prefix, n)
    }
}

#[async_trait]
impl KnowledgeObjectClient for FakeKnowledgeBase {
    async fn list(
        &self,
        docset_id: &str,
        state: PublishState,
    ) -> Result<Vec<KnowledgeRecord>, RemoteError> {
        self.enter("list", docset_id).await?;
        Ok(self
            .records
            .lock()
            .await
            .values()
            .filter(|r| r.docset_id == docset_id && r.record.publish_state == state)
            .map(|r| r.record.clone())
            .collect())
    }

    async fn fetch(&self, version_id: &str) -> Result<Option<KnowledgeRecord>, RemoteError> {
        self.enter("fetch", version_id).await?;
        Ok(self
            .records
            .lock()
            .await
            .get(version_id)
            .map(|r| r.record.clone()))
    }

    async fn create(
        &self,
        docset_id: &str,
        fields: &ArticleFields,
    ) -> Result<RecordRef, RemoteError> {
        self.enter("create", &fields.url_slug).await?;
        let article_id = self.next_id("ka").await;
        let version_id = self.next_id("kv").await;
        self.records.lock().await.insert(
            version_id.clone(),
            StoredRecord {
                docset_id: docset_id.to_string(),
                record: KnowledgeRecord {
                    article_id: article_id.clone(),
                    version_id: version_id.clone(),
                    publish_state: PublishState::Draft,
                    fields: fields.clone(),
                },
            },
        );
        Ok(RecordRef {
            article_id,
            version_id,
        })
    }

    async fn create_draft_from(&self, article_id: &str) -> Result<String, RemoteError> {
        self.enter("create_draft", article_id).await?;
        let version_id = self.next_id("kv").await;
        let mut records = self.records.lock().await;
        let online = records
            .values()
            .find(|r| {
                r.record.article_id == article_id && r.record.publish_state == PublishState::Online
            })
            .cloned()
            .ok_or_else(|| {
                RemoteError::new(
                    RemoteService::KnowledgeBase,
                    "create_draft",
                    article_id,
                    "no online version",
                )
                .with_status(404)
            })?;
        let mut draft = online;
        draft.record.version_id = version_id.clone();
        draft.record.publish_state = PublishState::Draft;
        records.insert(version_id.clone(), draft);
        Ok(version_id)
    }

    async fn update(&self, version_id: &str, fields: &ArticleFields) -> Result<(), RemoteError> {
        self.enter("update", version_id).await?;
        let mut records = self.records.lock().await;
        match records.get_mut(version_id) {
            Some(r) if r.record.publish_state == PublishState::Draft => {
                r.record.fields = fields.clone();
                Ok(())
            }
            _ => Err(RemoteError::new(
                RemoteService::KnowledgeBase,
                "update",
                version_id,
                "not an editable draft",
            )
            .with_status(400)),
        }
    }

    async fn delete(&self, version_id: &str) -> Result<(), RemoteError> {
        self.enter("delete", version_id).await?;
        self.records.lock().await.remove(version_id);
        Ok(())
    }

    async fn set_publish_state(
        &self,
        version_id: &str,
        state: PublishState,
    ) -> Result<(), RemoteError> {
        let operation = match state {
            PublishState::Online => "publish",
            PublishState::Archived => "archive",
            PublishState::Draft => "unpublish",
        };
        self.enter(operation, version_id).await?;
        let mut records = self.records.lock().await;
        let article_id = records
            .get(version_id)
            .map(|r| r.record.article_id.clone())
            .ok_or_else(|| {
                RemoteError::new(RemoteService::KnowledgeBase, operation, version_id, "missing")
                    .with_status(404)
            })?;
        if state == PublishState::Online {
            for r in records.values_mut() {
                if r.record.article_id == article_id
                    && r.record.publish_state == PublishState::Online
                {
                    r.record.publish_state = PublishState::Archived;
                }
            }
        }
        if let Some(r) = records.get_mut(version_id) {
            r.record.publish_state = state;
        }
        Ok(())
    }
}

pub fn test_config(root: &std::path::Path) -> Config {
    let mut cfg: Config = serde_yaml::from_str(config::example()).unwrap();
    cfg.app.data_dir = root.join("data").to_string_lossy().to_string();
    cfg.object_store.backend = ObjectStoreBackend::Local;
    cfg.object_store.location = root.join("store").to_string_lossy().to_string();
    cfg.bundle_source.base_url = format!("file://{}", root.join("exports").display());
    cfg
}

pub struct Harness {
    pub services: Services,
    pub kb: Arc<FakeKnowledgeBase>,
    pub store: Arc<LocalObjectStore>,
    pub exports: PathBuf,
    _dir: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    pub async fn with_config(tweak: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = test_config(dir.path());
        tweak(&mut cfg);
        cfg.ensure_dirs().unwrap();
        let exports = dir.path().join("exports");
        std::fs::create_dir_all(&exports).unwrap();

        let kb = Arc::new(FakeKnowledgeBase::default());
        let store = Arc::new(LocalObjectStore::new(
            &cfg.object_store.location,
            &cfg.object_store.public_base_url,
        ));
        let services = Services {
            pool: setup_pool().await,
            config: Arc::new(cfg),
            knowledge: kb.clone(),
            objects: store.clone(),
            source: Arc::new(DirectoryBundleSource::new(&exports)),
        };
        Self {
            services,
            kb,
            store,
            exports,
            _dir: dir,
        }
    }

    /// Same database, knowledge base and store, different configuration.
    pub fn reconfigured(&self, tweak: impl FnOnce(&mut Config)) -> Services {
        let mut cfg = (*self.services.config).clone();
        tweak(&mut cfg);
        Services {
            config: Arc::new(cfg),
            ..self.services.clone()
        }
    }

    pub fn pool(&self) -> &Pool {
        &self.services.pool
    }

    /// Write `{export_id}.zip`, wrapped in a second zip the way the source sometimes does.
    pub fn write_export(&self, export_id: &str, files: &[(&str, Vec<u8>)]) {
        let inner = zip_bytes(files);
        let outer = zip_bytes(&[("export.zip", inner)]);
        std::fs::write(self.exports.join(format!("{}.zip", export_id)), outer).unwrap();
    }

    pub async fn webhook(&self, export_id: &str, docset_id: &str) -> WebhookEvent {
        lifecycle::ingest_webhook(self.pool(), &webhook_body(export_id, docset_id))
            .await
            .unwrap()
    }

    pub async fn drain(&self) -> usize {
        jobs::run_until_idle(&self.services).await.unwrap()
    }

    pub async fn bundle(&self, id: i64) -> Bundle {
        db::fetch_bundle(self.pool(), id).await.unwrap().unwrap()
    }
}

pub fn webhook_body(export_id: &str, docset_id: &str) -> String {
    format!(
        r#"{{"event_id":"export-complete","event_data":{{"publish-result":"success","output-uuid":"{}"}},"resource_id":"{}"}}"#,
        export_id, docset_id
    )
}

pub fn zip_bytes(files: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut buf = std::io::Cursor::new(Vec::new());
    {
        let mut w = zip::ZipWriter::new(&mut buf);
        for (name, data) in files {
            w.start_file(*name, zip::write::FileOptions::default())
                .unwrap();
            w.write_all(data).unwrap();
        }
        w.finish().unwrap();
    }
    buf.into_inner()
}

pub fn article(slug: &str, title: &str, body: &str) -> Vec<u8> {
    format!(
        r#"<html><head>
<title>{title}</title>
<meta name="UrlName" content="{slug}">
<meta name="description" content="About {title}">
<meta name="is-visible-in-app" content="true">
<meta name="is-visible-in-csp" content="true">
<meta name="is-visible-in-pkb" content="false">
<meta name="is-visible-in-prm" content="false">
<meta name="article-author" content="Docs Team">
</head><body><div class="article-body">{body}</div></body></html>"#
    )
    .into_bytes()
}

pub const LOGO: &[u8] = b"\x89PNG logo bytes";

/// Three documents and one image.
pub fn bundle_a() -> Vec<(&'static str, Vec<u8>)> {
    vec![
        (
            "overview.html",
            article(
                "overview",
                "Product Overview",
                r#"<h1>Overview</h1><img src="images/logo.png" alt="logo"><a href="guide/install.html">install</a>"#,
            ),
        ),
        (
            "guide/install.html",
            article("install", "Installing", "<p>Run the installer.</p>"),
        ),
        (
            "guide/usage.html",
            article("usage", "Using It", "<p>Click things.</p>"),
        ),
        ("images/logo.png", LOGO.to_vec()),
        ("index.html", b"<html><body>generated</body></html>".to_vec()),
    ]
}
