use crate::config::{ObjectStoreBackend, ObjectStoreConfig};
use crate::error::RemoteError;
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub mod http;
pub mod images;
pub mod local;

pub use http::HttpObjectStore;
pub use images::{ImageOutcome, ImageStore};
pub use local::LocalObjectStore;

/// Flat key/value blob storage holding draft and production images.
///
/// `get` returns `None` for a missing key; `delete` of a missing key succeeds.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError>;

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), RemoteError>;

    /// Server-side copy; the bytes never leave the store.
    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError>;

    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// Every key starting with `prefix`, sorted.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError>;

    /// URL a browser fetches `key` from.
    fn public_url(&self, key: &str) -> String;
}

/// Build the configured backend.
pub fn from_config(cfg: &ObjectStoreConfig, timeout: Duration) -> Result<Arc<dyn ObjectStore>> {
    Ok(match cfg.backend {
        ObjectStoreBackend::Http => Arc::new(HttpObjectStore::new(cfg, timeout)?),
        ObjectStoreBackend::Local => Arc::new(LocalObjectStore::new(
            &cfg.location,
            &cfg.public_base_url,
        )),
    })
}

/// Key layout for one docset. Draft and production keys never share a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyLayout {
    draft_root: String,
    public_root: String,
}

/// Whether `docset_id` can be used as a single key segment.
///
/// A `/` or `..` would let one docset's prefix contain another's.
pub fn is_valid_docset_id(docset_id: &str) -> bool {
    !docset_id.trim().is_empty()
        && !docset_id.contains(['/', '\\'])
        && !docset_id.contains("..")
        && !docset_id.chars().any(char::is_control)
}

impl KeyLayout {
    pub fn new(cfg: &ObjectStoreConfig, docset_id: &str) -> Self {
        debug_assert!(
            is_valid_docset_id(docset_id),
            "docset id {:?} is not a single key segment",
            docset_id
        );
        Self {
            draft_root: format!("{}{}/", cfg.draft_prefix, docset_id),
            public_root: format!("{}{}/", cfg.public_prefix, docset_id),
        }
    }

    pub fn draft_key(&self, relative_path: &str) -> String {
        format!("{}{}", self.draft_root, relative_path)
    }

    pub fn public_key(&self, relative_path: &str) -> String {
        format!("{}{}", self.public_root, relative_path)
    }

    pub fn draft_root(&self) -> &str {
        &self.draft_root
    }

    pub fn public_root(&self) -> &str {
        &self.public_root
    }

    /// Bundle-relative path of a production key under this docset.
    pub fn relative_from_public<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.public_root.as_str())
            .filter(|rest| !rest.is_empty())
    }

    pub fn relative_from_draft<'a>(&self, key: &'a str) -> Option<&'a str> {
        key.strip_prefix(self.draft_root.as_str())
            .filter(|rest| !rest.is_empty())
    }

    /// Public URL prefix of the draft area, used to render preview bodies.
    pub fn draft_base_url(&self, store: &dyn ObjectStore) -> String {
        store.public_url(&self.draft_root)
    }

    pub fn public_base_url(&self, store: &dyn ObjectStore) -> String {
        store.public_url(&self.public_root)
    }
}

pub fn content_type(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|s| s.to_ascii_lowercase())
    {
        Some(ext) if ext == "jpg" || ext == "jpeg" => "image/jpeg",
        Some(ext) if ext == "png" => "image/png",
        Some(ext) if ext == "gif" => "image/gif",
        Some(ext) if ext == "svg" => "image/svg+xml",
        Some(ext) if ext == "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

/// Join a base URL and a key, making sure exactly one `/` separates them.
pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn layout() -> KeyLayout {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        KeyLayout::new(&cfg.object_store, "ds-1")
    }

    #[test]
    fn draft_and_public_keys_are_disjoint() {
        let l = layout();
        assert_eq!(l.draft_key("img/a.png"), "draft/ds-1/img/a.png");
        assert_eq!(l.public_key("img/a.png"), "public/ds-1/img/a.png");
        assert_eq!(l.relative_from_public("public/ds-1/img/a.png"), Some("img/a.png"));
        assert_eq!(l.relative_from_public("draft/ds-1/img/a.png"), None);
        assert_eq!(l.relative_from_public("public/ds-10/a.png"), None);
    }

    #[test]
    fn docset_ids_must_be_one_segment() {
        assert!(is_valid_docset_id("ds-1"));
        assert!(is_valid_docset_id("0a1b.c2"));
        for bad in ["", "  ", "ds/sub", "ds\\sub", "..", "a..b", "ds\n1", "ds\u{0}"] {
            assert!(!is_valid_docset_id(bad), "{:?}", bad);
        }
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "not a single key segment")]
    fn layout_refuses_nested_docset_id() {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        KeyLayout::new(&cfg.object_store, "ds/sub");
    }

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type(Path::new("a/B.PNG")), "image/png");
        assert_eq!(content_type(Path::new("x.svg")), "image/svg+xml");
        assert_eq!(content_type(Path::new("x.bin")), "application/octet-stream");
    }

    #[test]
    fn join_url_normalizes_slashes() {
        assert_eq!(join_url("https://h/b/", "/k"), "https://h/b/k");
        assert_eq!(join_url("https://h/b", "k/x"), "https://h/b/k/x");
    }
}
