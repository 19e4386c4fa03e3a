//! Configuration loader and validator for the docset publisher.
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub bundle_source: BundleSourceConfig,
    pub knowledge: Knowledge,
    pub object_store: ObjectStoreConfig,
    pub scrub: Scrub,
    #[serde(default)]
    pub reconcile: Reconcile,
}

/// Worker-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub poll_interval_ms: u64,
    pub max_backoff_seconds: u64,
    /// Wall-clock budget for one job; a bundle whose job overruns it moves to `error`.
    pub job_timeout_seconds: u64,
    /// Timeout applied to every remote HTTP call.
    pub request_timeout_seconds: u64,
}

/// Authoring tool export endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BundleSourceConfig {
    pub base_url: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_max_archive_depth")]
    pub max_archive_depth: usize,
}

/// Knowledge base API settings and article field mapping.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Knowledge {
    pub instance_url: String,
    pub access_token: String,
    pub api_version: String,
    pub article_type: String,
    #[serde(default = "default_language")]
    pub language: String,
    pub fields: KnowledgeFields,
}

/// Remote field names for each mapped article attribute.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KnowledgeFields {
    pub docset: String,
    pub body: String,
    pub author: String,
    pub author_override: String,
    pub visible_in_app: String,
    pub visible_in_csp: String,
    pub visible_in_pkb: String,
    pub visible_in_prm: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ObjectStoreBackend {
    Http,
    Local,
}

/// Object store holding draft and production images.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ObjectStoreConfig {
    pub backend: ObjectStoreBackend,
    /// Bucket endpoint for `http`, root directory for `local`.
    pub location: String,
    /// Public URL prefix objects are served from.
    pub public_base_url: String,
    #[serde(default)]
    pub token: Option<String>,
    pub draft_prefix: String,
    pub public_prefix: String,
}

/// Allow-lists and document layout used by the scrubber.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scrub {
    /// Tag name -> attributes allowed on it.
    pub allowed_tags: BTreeMap<String, Vec<String>>,
    /// Exact URLs or glob patterns (`*`, `?`) links may point to.
    #[serde(default)]
    pub allowed_urls: Vec<String>,
    #[serde(default)]
    pub skip_files: Vec<String>,
    pub body_class: String,
    pub image_placeholder: String,
    pub author_meta: String,
    pub author_override_meta: String,
    #[serde(default)]
    pub max_links: Option<usize>,
    #[serde(default = "default_html_extensions")]
    pub html_extensions: Vec<String>,
    #[serde(default = "default_image_extensions")]
    pub image_extensions: Vec<String>,
    /// Abort the whole bundle on any document problem (otherwise only the document is dropped).
    #[serde(default = "default_strict")]
    pub strict: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reconcile {
    #[serde(default)]
    pub force_republish: bool,
}

fn default_max_archive_depth() -> usize {
    4
}

fn default_language() -> String {
    "en_US".into()
}

fn default_html_extensions() -> Vec<String> {
    vec!["html".into(), "htm".into()]
}

fn default_image_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif", "svg", "webp"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_strict() -> bool {
    true
}

impl App {
    /// `data_dir` with a leading `~/` expanded.
    pub fn resolved_data_dir(&self) -> String {
        if let Some(rest) = self.data_dir.strip_prefix("~/") {
            if let Ok(home) = std::env::var("HOME") {
                return format!("{}/{}", home.trim_end_matches('/'), rest);
            }
        }
        self.data_dir.clone()
    }

    /// Scratch directory bundles are downloaded and expanded into.
    pub fn work_dir(&self) -> PathBuf {
        Path::new(&self.resolved_data_dir()).join("bundles")
    }
}

impl Config {
    /// `DATABASE_URL` if set, otherwise a SQLite file inside `app.data_dir`.
    pub fn database_url(&self) -> String {
        std::env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!("sqlite://{}/publisher.db", self.app.resolved_data_dir())
        })
    }

    /// Ensure required directories exist (creates `app.data_dir` and the work dir if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(self.app.work_dir())
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
pub fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("app.poll_interval_ms must be > 0"));
    }
    if cfg.app.job_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.job_timeout_seconds must be > 0"));
    }
    if cfg.app.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid("app.request_timeout_seconds must be > 0"));
    }

    if cfg.bundle_source.base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("bundle_source.base_url must be non-empty"));
    }
    if cfg.bundle_source.max_archive_depth == 0 {
        return Err(ConfigError::Invalid("bundle_source.max_archive_depth must be > 0"));
    }

    let kb = &cfg.knowledge;
    if kb.instance_url.trim().is_empty() {
        return Err(ConfigError::Invalid("knowledge.instance_url must be non-empty"));
    }
    if kb.access_token.trim().is_empty() {
        return Err(ConfigError::Invalid("knowledge.access_token must be non-empty"));
    }
    if kb.api_version.trim().is_empty() {
        return Err(ConfigError::Invalid("knowledge.api_version must be non-empty"));
    }
    if kb.article_type.trim().is_empty() {
        return Err(ConfigError::Invalid("knowledge.article_type must be non-empty"));
    }
    let f = &kb.fields;
    for field in [
        &f.docset,
        &f.body,
        &f.author,
        &f.author_override,
        &f.visible_in_app,
        &f.visible_in_csp,
        &f.visible_in_pkb,
        &f.visible_in_prm,
    ] {
        if field.trim().is_empty() {
            return Err(ConfigError::Invalid("knowledge.fields.* must all be non-empty"));
        }
    }

    let os = &cfg.object_store;
    if os.location.trim().is_empty() {
        return Err(ConfigError::Invalid("object_store.location must be non-empty"));
    }
    if os.public_base_url.trim().is_empty() {
        return Err(ConfigError::Invalid("object_store.public_base_url must be non-empty"));
    }
    if os.draft_prefix.trim().is_empty() || os.public_prefix.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "object_store.draft_prefix and object_store.public_prefix must be non-empty",
        ));
    }
    if os.draft_prefix.starts_with(&os.public_prefix) || os.public_prefix.starts_with(&os.draft_prefix)
    {
        return Err(ConfigError::Invalid(
            "object_store.draft_prefix and object_store.public_prefix must not overlap",
        ));
    }

    let s = &cfg.scrub;
    if s.allowed_tags.is_empty() {
        return Err(ConfigError::Invalid("scrub.allowed_tags must be non-empty"));
    }
    if s.body_class.trim().is_empty() {
        return Err(ConfigError::Invalid("scrub.body_class must be non-empty"));
    }
    if s.image_placeholder.trim().is_empty() {
        return Err(ConfigError::Invalid("scrub.image_placeholder must be non-empty"));
    }
    if s.author_meta.trim().is_empty() || s.author_override_meta.trim().is_empty() {
        return Err(ConfigError::Invalid(
            "scrub.author_meta and scrub.author_override_meta must be non-empty",
        ));
    }
    if s.html_extensions.is_empty() {
        return Err(ConfigError::Invalid("scrub.html_extensions must be non-empty"));
    }

    Ok(())
}

/// Returns a complete example configuration.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  poll_interval_ms: 500
  max_backoff_seconds: 300
  job_timeout_seconds: 1800
  request_timeout_seconds: 60

bundle_source:
  base_url: "https://authoring.example.com"
  username: "publisher"
  password: "CHANGEME"
  max_archive_depth: 4

knowledge:
  instance_url: "https://kb.example.com"
  access_token: "YOUR_KNOWLEDGE_BASE_TOKEN"
  api_version: "41.0"
  article_type: "Resource__kav"
  language: "en_US"
  fields:
    docset: "Docset_Id__c"
    body: "ArticleBody__c"
    author: "ArticleAuthor__c"
    author_override: "ArticleAuthorOverride__c"
    visible_in_app: "IsVisibleInApp"
    visible_in_csp: "IsVisibleInCsp"
    visible_in_pkb: "IsVisibleInPkb"
    visible_in_prm: "IsVisibleInPrm"

object_store:
  backend: http
  location: "https://objects.example.com/docs-images"
  public_base_url: "https://objects.example.com/docs-images/"
  draft_prefix: "draft/"
  public_prefix: "public/"

scrub:
  allowed_tags:
    a: [href]
    body: []
    br: []
    div: [class]
    h1: []
    h2: []
    h3: []
    head: []
    html: []
    img: [src, alt]
    li: []
    meta: [content, name]
    p: []
    title: []
    ul: []
  allowed_urls:
    - "https://help.example.com/*"
  skip_files:
    - "index.html"
  body_class: "article-body"
  image_placeholder: "{{images}}/"
  author_meta: "article-author"
  author_override_meta: "article-author-override"
  max_links: 100
  strict: true

reconcile:
  force_republish: false
"#
}
