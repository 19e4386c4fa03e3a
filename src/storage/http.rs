//! S3-style object store over plain HTTP (path-style addressing).

use super::{join_url, ObjectStore};
use crate::config::ObjectStoreConfig;
use crate::error::{RemoteError, RemoteService};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use std::fmt;
use std::time::Duration;
use tracing::debug;

static KEY: Lazy<Regex> = Lazy::new(|| Regex::new(r"<Key>([^<]*)</Key>").expect("valid regex"));
static NEXT_TOKEN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<NextContinuationToken>([^<]*)</NextContinuationToken>").expect("valid regex")
});

#[derive(Clone)]
pub struct HttpObjectStore {
    http: Client,
    bucket_url: Url,
    public_base_url: String,
    token: Option<String>,
}

impl fmt::Debug for HttpObjectStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpObjectStore")
            .field("bucket_url", &self.bucket_url)
            .finish_non_exhaustive()
    }
}

impl HttpObjectStore {
    pub fn new(cfg: &ObjectStoreConfig, timeout: Duration) -> Result<Self> {
        let bucket_url = Url::parse(&cfg.location).context("invalid object_store.location")?;
        if bucket_url.cannot_be_a_base() {
            return Err(anyhow!("object_store.location must be a hierarchical URL"));
        }
        let http = Client::builder()
            .user_agent("docset-publisher/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build object store HTTP client")?;
        Ok(Self {
            http,
            bucket_url,
            public_base_url: cfg.public_base_url.clone(),
            token: cfg.token.clone(),
        })
    }

    fn object_url(&self, key: &str) -> Result<Url, RemoteError> {
        let mut url = self.bucket_url.clone();
        url.path_segments_mut()
            .map_err(|_| err("address", key, "bucket URL cannot carry a path"))?
            .pop_if_empty()
            .extend(key.split('/'));
        Ok(url)
    }

    fn authorize(&self, req: RequestBuilder) -> RequestBuilder {
        match &self.token {
            Some(token) => req.header("Authorization", format!("Bearer {}", token)),
            None => req,
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        key: &str,
        req: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        self.authorize(req)
            .send()
            .await
            .map_err(|e| err(operation, key, e.to_string()))
    }
}

fn err(operation: &'static str, key: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteService::ObjectStore, operation, key, message)
}

async fn status_err(operation: &'static str, key: &str, res: Response) -> RemoteError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    err(operation, key, body).with_status(status.as_u16())
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RemoteError> {
        let url = self.object_url(key)?;
        let res = self.send("get", key, self.http.get(url)).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !res.status().is_success() {
            return Err(status_err("get", key, res).await);
        }
        let bytes = res
            .bytes()
            .await
            .map_err(|e| err("get", key, e.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }

    async fn put(&self, key: &str, bytes: Vec<u8>, content_type: &str) -> Result<(), RemoteError> {
        let url = self.object_url(key)?;
        debug!(key, size = bytes.len(), "uploading object");
        let req = self
            .http
            .put(url)
            .header("Content-Type", content_type)
            .body(bytes);
        let res = self.send("put", key, req).await?;
        if !res.status().is_success() {
            return Err(status_err("put", key, res).await);
        }
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> Result<(), RemoteError> {
        let url = self.object_url(to)?;
        let source = self.object_url(from)?;
        let req = self
            .http
            .put(url)
            .header("x-amz-copy-source", source.path());
        let res = self.send("copy", from, req).await?;
        if !res.status().is_success() {
            return Err(status_err("copy", from, res).await);
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        let url = self.object_url(key)?;
        let res = self.send("delete", key, self.http.delete(url)).await?;
        if res.status() == StatusCode::NOT_FOUND || res.status().is_success() {
            return Ok(());
        }
        Err(status_err("delete", key, res).await)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, RemoteError> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;
        loop {
            let mut url = self.bucket_url.clone();
            {
                let mut q = url.query_pairs_mut();
                q.append_pair("list-type", "2").append_pair("prefix", prefix);
                if let Some(t) = &token {
                    q.append_pair("continuation-token", t);
                }
            }
            let res = self.send("list", prefix, self.http.get(url)).await?;
            if !res.status().is_success() {
                return Err(status_err("list", prefix, res).await);
            }
            let body = res
                .text()
                .await
                .map_err(|e| err("list", prefix, e.to_string()))?;
            let (page, next) = parse_list_page(&body);
            keys.extend(page);
            match next {
                Some(next) => token = Some(next),
                None => break,
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

fn unescape_xml(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Keys and continuation token of one `ListObjectsV2` response page.
fn parse_list_page(body: &str) -> (Vec<String>, Option<String>) {
    let keys = KEY
        .captures_iter(body)
        .map(|c| unescape_xml(&c[1]))
        .collect();
    let next = NEXT_TOKEN
        .captures(body)
        .map(|c| unescape_xml(&c[1]))
        .filter(|t| !t.is_empty());
    (keys, next)
}
