//! Fetching exports from the authoring tool and unpacking them.

use crate::config::BundleSourceConfig;
use crate::error::{PipelineError, RemoteError, RemoteService};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Name the downloaded export is stored under inside the bundle directory.
pub const ARCHIVE_NAME: &str = "bundle.zip";

#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Store the export `source_id` as `dest/bundle.zip`. Repeating a download overwrites it.
    async fn download(&self, source_id: &str, dest: &Path) -> Result<PathBuf, RemoteError>;
}

pub fn from_config(cfg: &BundleSourceConfig, timeout: Duration) -> Result<Arc<dyn BundleSource>> {
    if let Some(dir) = cfg.base_url.strip_prefix("file://") {
        return Ok(Arc::new(DirectoryBundleSource::new(dir)));
    }
    Ok(Arc::new(HttpBundleSource::new(cfg, timeout)?))
}

fn err(operation: &'static str, source_id: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteService::BundleSource, operation, source_id, message)
}

#[derive(Debug, Clone)]
pub struct HttpBundleSource {
    http: Client,
    base_url: String,
    username: String,
    password: String,
}

impl HttpBundleSource {
    pub fn new(cfg: &BundleSourceConfig, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("docset-publisher/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build bundle source HTTP client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }

    fn bundle_url(&self, source_id: &str) -> String {
        format!("{}/rest/all-files/{}/bundle", self.base_url, source_id)
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn download(&self, source_id: &str, dest: &Path) -> Result<PathBuf, RemoteError> {
        let res = self
            .http
            .get(self.bundle_url(source_id))
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|e| err("download", source_id, e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(err("download", source_id, body).with_status(status.as_u16()));
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| err("download", source_id, e.to_string()))?;
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| err("download", source_id, e.to_string()))?;
        let path = dest.join(ARCHIVE_NAME);
        tokio::fs::write(&path, &bytes)
            .await
            .map_err(|e| err("download", source_id, e.to_string()))?;
        info!(source_id, size = bytes.len(), "bundle downloaded");
        Ok(path)
    }
}

/// Reads `{root}/{source_id}.zip`; used for local runs and tests.
#[derive(Debug, Clone)]
pub struct DirectoryBundleSource {
    root: PathBuf,
}

impl DirectoryBundleSource {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl BundleSource for DirectoryBundleSource {
    async fn download(&self, source_id: &str, dest: &Path) -> Result<PathBuf, RemoteError> {
        let src = self.root.join(format!("{}.zip", source_id));
        tokio::fs::create_dir_all(dest)
            .await
            .map_err(|e| err("download", source_id, e.to_string()))?;
        let path = dest.join(ARCHIVE_NAME);
        tokio::fs::copy(&src, &path)
            .await
            .map_err(|e| err("download", source_id, format!("{}: {}", src.display(), e)))?;
        Ok(path)
    }
}

fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

/// Every file under `root`, found without recursion.
pub fn walk_files(root: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];
    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                dirs.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

/// Expand every zip archive under `root` in place, including archives found
/// inside archives, up to `max_depth` levels. Expanded archives are removed.
pub async fn expand_archives(root: &Path, max_depth: usize) -> Result<usize, PipelineError> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || expand_archives_blocking(&root, max_depth))
        .await
        .map_err(|e| PipelineError::Internal(anyhow!("archive expansion panicked: {}", e)))?
}

fn expand_archives_blocking(root: &Path, max_depth: usize) -> Result<usize, PipelineError> {
    let mut worklist: Vec<(PathBuf, usize)> = walk_files(root)?
        .into_iter()
        .filter(|p| is_archive(p))
        .map(|p| (p, 1))
        .collect();
    let mut expanded = 0;

    while let Some((archive_path, depth)) = worklist.pop() {
        if depth > max_depth {
            return Err(PipelineError::validation(vec![format!(
                "{}: archives nested deeper than {} levels",
                archive_path.display(),
                max_depth
            )]));
        }
        let target = archive_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| root.to_path_buf());
        // Moved aside so an entry with the archive's own name can be extracted next to it.
        let reading = target.join(format!(".{}.expanding", Uuid::new_v4()));
        std::fs::rename(&archive_path, &reading)?;
        let file = File::open(&reading)?;
        let mut archive = zip::ZipArchive::new(file).map_err(|e| {
            PipelineError::validation(vec![format!("{}: {}", archive_path.display(), e)])
        })?;
        let nested: Vec<PathBuf> = archive
            .file_names()
            .map(|name| target.join(name))
            .filter(|p| is_archive(p))
            .collect();
        archive.extract(&target).map_err(|e| {
            PipelineError::validation(vec![format!("{}: {}", archive_path.display(), e)])
        })?;
        drop(archive);
        std::fs::remove_file(&reading)?;
        debug!(archive = %archive_path.display(), depth, nested = nested.len(), "archive expanded");
        expanded += 1;
        worklist.extend(
            nested
                .into_iter()
                .filter(|p| p.exists())
                .map(|p| (p, depth + 1)),
        );
    }
    Ok(expanded)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    fn zip_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            for (name, data) in entries {
                w.start_file(*name, FileOptions::default()).unwrap();
                w.write_all(data).unwrap();
            }
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    #[tokio::test]
    async fn expands_double_wrapped_archive() {
        let td = tempfile::tempdir().unwrap();
        let inner = zip_bytes(&[("guide/a.html", b"<html></html>"), ("img/x.png", b"px")]);
        let outer = zip_bytes(&[("inner.zip", &inner)]);
        std::fs::write(td.path().join(ARCHIVE_NAME), outer).unwrap();

        let n = expand_archives(td.path(), 4).await.unwrap();
        assert_eq!(n, 2);
        assert!(td.path().join("guide/a.html").exists());
        assert!(td.path().join("img/x.png").exists());
        assert!(!td.path().join("inner.zip").exists());
        assert!(!td.path().join(ARCHIVE_NAME).exists());
    }

    #[tokio::test]
    async fn inner_archive_named_like_the_download_is_expanded() {
        let td = tempfile::tempdir().unwrap();
        let inner = zip_bytes(&[("guide/a.html", b"<html></html>")]);
        let outer = zip_bytes(&[(ARCHIVE_NAME, &inner)]);
        std::fs::write(td.path().join(ARCHIVE_NAME), outer).unwrap();

        let n = expand_archives(td.path(), 4).await.unwrap();
        assert_eq!(n, 2);
        assert!(td.path().join("guide/a.html").exists());
        assert_eq!(walk_files(td.path()).unwrap(), vec![td.path().join("guide/a.html")]);
    }

    #[tokio::test]
    async fn nesting_beyond_limit_is_rejected() {
        let td = tempfile::tempdir().unwrap();
        let l3 = zip_bytes(&[("a.html", b"x")]);
        let l2 = zip_bytes(&[("l3.zip", &l3)]);
        let l1 = zip_bytes(&[("l2.zip", &l2)]);
        std::fs::write(td.path().join(ARCHIVE_NAME), l1).unwrap();

        let err = expand_archives(td.path(), 2).await.unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn directory_source_copies_export() {
        let td = tempfile::tempdir().unwrap();
        std::fs::write(td.path().join("exp-1.zip"), b"zip").unwrap();
        let source = DirectoryBundleSource::new(td.path());
        let dest = td.path().join("work");
        let path = source.download("exp-1", &dest).await.unwrap();
        assert_eq!(path, dest.join(ARCHIVE_NAME));

        let missing = source.download("exp-2", &dest).await.unwrap_err();
        assert_eq!(missing.service, RemoteService::BundleSource);
    }
}
