//! Object store backed by a local directory tree.

use super::{join_url, ObjectStore};
use crate::error::{RemoteError, RemoteService};
use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;

#[derive(Debug, Clone)]
pub struct LocalObjectStore {
    root: PathBuf,
    public_base_url: String,
}

impl LocalObjectStore {
    pub fn new(root: impl AsRef<Path>, public_base_url: &str) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            public_base_url: public_base_url.to_string(),
        }
    }

    fn path_for(&self, operation: &'static str, key: &str) -> Result<PathBuf, RemoteError> {
        if key.split('/').any(|s| s == ".." || s == ".") || key.starts_with('/') {
            return Err(err(operation, key, "key must be a plain relative path"));
        }
        Ok(self.root.join(key))
    }
}

fn err(operation: &'static str, key: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteService::ObjectStore, operation, key, message)
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let path = self.path_for("get", key)?;
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(err("get", key, e.to_string())),
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, _content_type: &str) -> Result<(), RemoteError> {
        let path = self.path_for("put", key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| err("put", key, e.to_string()))?;
        }
        fs::write(&path, bytes)
            .await
            .map_err(|e| err("put", key, e.to_string()))
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let src = self.path_for("copy", from)?;
        let dst = self.path_for("copy", to)?;
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| err("copy", to, e.to_string()))?;
        }
        fs::copy(&src, &dst)
            .await
            .map(|_| ())
            .map_err(|e| err("copy", from, e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let path = self.path_for("delete", key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(err("delete", key, e.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut keys = Vec::new();
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(err("list", prefix, e.to_string())),
            };
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| err("list", prefix, e.to_string()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| err("list", prefix, e.to_string()))?;
                if file_type.is_dir() {
                    stack.push(path);
                    continue;
                }
                let Ok(rel) = path.strip_prefix(&self.root) else {
                    continue;
                };
                let key = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if key.starts_with(prefix) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_copy_list_delete() {
        let td = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(td.path(), "https://cdn.example.com/");
        assert!(store.get("draft/ds/a.png").await.unwrap().is_none());

        store
            .put("draft/ds/a.png", b"abc".to_vec(), "image/png")
            .await
            .unwrap();
        store.copy("draft/ds/a.png", "public/ds/a.png").await.unwrap();
        assert_eq!(
            store.get("public/ds/a.png").await.unwrap().as_deref(),
            Some(&b"abc"[..])
        );
        assert_eq!(
            store.list("public/").await.unwrap(),
            vec!["public/ds/a.png".to_string()]
        );

        store.delete("public/ds/a.png").await.unwrap();
        store.delete("public/ds/a.png").await.unwrap();
        assert!(store.list("public/").await.unwrap().is_empty());
        assert_eq!(
            store.public_url("public/ds/a.png"),
            "https://cdn.example.com/public/ds/a.png"
        );
    }

    #[tokio::test]
    async fn rejects_escaping_keys() {
        let td = tempfile::tempdir().unwrap();
        let store = LocalObjectStore::new(td.path(), "https://cdn.example.com/");
        assert!(store.get("../etc/passwd").await.is_err());
    }
}
