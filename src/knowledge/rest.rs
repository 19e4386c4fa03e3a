//! REST backend for a Salesforce-style knowledge base.

use super::model::{CreateResponse, QueryResponse};
use super::{KnowledgeObjectClient, KnowledgeRecord, PublishState, RecordRef};
use crate::config::{Knowledge, KnowledgeFields};
use crate::error::{RemoteError, RemoteService};
use crate::scrub::ArticleFields;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Clone)]
pub struct RestKnowledgeBase {
    http: Client,
    instance_url: String,
    api_version: String,
    token: String,
    article_type: String,
    language: String,
    fields: KnowledgeFields,
}

impl fmt::Debug for RestKnowledgeBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestKnowledgeBase")
            .field("instance_url", &self.instance_url)
            .field("article_type", &self.article_type)
            .finish_non_exhaustive()
    }
}

fn err(operation: &'static str, remote_id: &str, message: impl Into<String>) -> RemoteError {
    RemoteError::new(RemoteService::KnowledgeBase, operation, remote_id, message)
}

/// Quote a value for a SOQL string literal.
fn soql_quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

impl RestKnowledgeBase {
    pub fn from_config(cfg: &Knowledge, timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .user_agent("docset-publisher/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build knowledge base HTTP client")?;
        Ok(Self {
            http,
            instance_url: cfg.instance_url.trim_end_matches('/').to_string(),
            api_version: cfg.api_version.clone(),
            token: cfg.access_token.clone(),
            article_type: cfg.article_type.clone(),
            language: cfg.language.clone(),
            fields: cfg.fields.clone(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/services/data/v{}/{}",
            self.instance_url,
            self.api_version,
            path.trim_start_matches('/')
        )
    }

    fn sobject_url(&self, id: Option<&str>) -> String {
        match id {
            Some(id) => self.api_url(&format!("sobjects/{}/{}", self.article_type, id)),
            None => self.api_url(&format!("sobjects/{}", self.article_type)),
        }
    }

    async fn send(
        &self,
        operation: &'static str,
        remote_id: &str,
        req: RequestBuilder,
    ) -> Result<Response, RemoteError> {
        req.header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| err(operation, remote_id, e.to_string()))
    }

    async fn expect_success(
        operation: &'static str,
        remote_id: &str,
        res: Response,
    ) -> Result<Response, RemoteError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        warn!(operation, remote_id, %status, "knowledge base error: {}", body);
        Err(err(operation, remote_id, body).with_status(status.as_u16()))
    }

    async fn json<T: DeserializeOwned>(
        operation: &'static str,
        remote_id: &str,
        res: Response,
    ) -> Result<T, RemoteError> {
        let res = Self::expect_success(operation, remote_id, res).await?;
        res.json::<T>()
            .await
            .map_err(|e| err(operation, remote_id, format!("invalid response JSON: {}", e)))
    }

    fn select_columns(&self) -> String {
        let f = &self.fields;
        [
            "Id",
            "KnowledgeArticleId",
            "PublishStatus",
            "Title",
            "UrlName",
            "Summary",
            f.body.as_str(),
            f.author.as_str(),
            f.author_override.as_str(),
            f.visible_in_app.as_str(),
            f.visible_in_csp.as_str(),
            f.visible_in_pkb.as_str(),
            f.visible_in_prm.as_str(),
        ]
        .join(", ")
    }

    fn fields_to_json(&self, fields: &ArticleFields) -> Map<String, Value> {
        let f = &self.fields;
        let mut body = Map::new();
        body.insert("Title".into(), json!(fields.title));
        body.insert("UrlName".into(), json!(fields.url_slug));
        body.insert("Summary".into(), json!(fields.summary));
        body.insert(f.body.clone(), json!(fields.body));
        body.insert(f.author.clone(), json!(fields.author));
        body.insert(f.author_override.clone(), json!(fields.author_override));
        body.insert(f.visible_in_app.clone(), json!(fields.is_visible_in_app));
        body.insert(f.visible_in_csp.clone(), json!(fields.is_visible_in_csp));
        body.insert(f.visible_in_pkb.clone(), json!(fields.is_visible_in_pkb));
        body.insert(f.visible_in_prm.clone(), json!(fields.is_visible_in_prm));
        body
    }

    fn record_from_json(&self, value: &Value) -> Result<KnowledgeRecord, RemoteError> {
        let f = &self.fields;
        let id = value.get("Id").and_then(Value::as_str).unwrap_or_default();
        let text = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let optional = |name: &str| {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_string)
                .filter(|s| !s.is_empty())
        };
        let flag = |name: &str| value.get(name).and_then(Value::as_bool).unwrap_or(false);
        let state = text("PublishStatus");
        let publish_state = PublishState::parse_state(&state)
            .ok_or_else(|| err("decode", id, format!("unknown publish status {:?}", state)))?;
        Ok(KnowledgeRecord {
            article_id: text("KnowledgeArticleId"),
            version_id: id.to_string(),
            publish_state,
            fields: ArticleFields {
                title: text("Title"),
                url_slug: text("UrlName"),
                summary: text("Summary"),
                is_visible_in_app: flag(&f.visible_in_app),
                is_visible_in_csp: flag(&f.visible_in_csp),
                is_visible_in_pkb: flag(&f.visible_in_pkb),
                is_visible_in_prm: flag(&f.visible_in_prm),
                author: optional(&f.author),
                author_override: optional(&f.author_override),
                body: text(&f.body),
            },
        })
    }

    fn list_query(&self, docset_id: &str, state: PublishState) -> String {
        format!(
            "SELECT {} FROM {} WHERE PublishStatus = {} AND Language = {} AND {} = {}",
            self.select_columns(),
            self.article_type,
            soql_quote(state.as_str()),
            soql_quote(&self.language),
            self.fields.docset,
            soql_quote(docset_id),
        )
    }
}

#[async_trait]
impl KnowledgeObjectClient for RestKnowledgeBase {
    async fn list(
        &self,
        docset_id: &str,
        state: PublishState,
    ) -> Result<Vec<KnowledgeRecord>, RemoteError> {
        let query = self.list_query(docset_id, state);
        let mut req = self.http.get(self.api_url("query")).query(&[("q", query)]);
        let mut records = Vec::new();
        loop {
            let res = self.send("list", docset_id, req).await?;
            let page: QueryResponse = Self::json("list", docset_id, res).await?;
            for value in &page.records {
                records.push(self.record_from_json(value)?);
            }
            match page.next_records_url {
                Some(next) if !page.done => {
                    req = self.http.get(format!("{}{}", self.instance_url, next));
                }
                _ => break,
            }
        }
        debug!(docset_id, %state, count = records.len(), "listed articles");
        Ok(records)
    }

    async fn fetch(&self, version_id: &str) -> Result<Option<KnowledgeRecord>, RemoteError> {
        let req = self
            .http
            .get(self.sobject_url(Some(version_id)))
            .query(&[("fields", self.select_columns())]);
        let res = self.send("fetch", version_id, req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let value: Value = Self::json("fetch", version_id, res).await?;
        self.record_from_json(&value).map(Some)
    }

    async fn create(
        &self,
        docset_id: &str,
        fields: &ArticleFields,
    ) -> Result<RecordRef, RemoteError> {
        let mut body = self.fields_to_json(fields);
        body.insert("Language".into(), json!(self.language));
        body.insert(self.fields.docset.clone(), json!(docset_id));
        let req = self.http.post(self.sobject_url(None)).json(&body);
        let res = self.send("create", &fields.url_slug, req).await?;
        let created: CreateResponse = Self::json("create", &fields.url_slug, res).await?;

        let req = self
            .http
            .get(self.sobject_url(Some(&created.id)))
            .query(&[("fields", "KnowledgeArticleId")]);
        let res = self.send("create", &created.id, req).await?;
        let value: Value = Self::json("create", &created.id, res).await?;
        let article_id = value
            .get("KnowledgeArticleId")
            .and_then(Value::as_str)
            .ok_or_else(|| err("create", &created.id, "response lacks KnowledgeArticleId"))?;
        Ok(RecordRef {
            article_id: article_id.to_string(),
            version_id: created.id,
        })
    }

    async fn create_draft_from(&self, article_id: &str) -> Result<String, RemoteError> {
        let req = self
            .http
            .post(self.api_url("knowledgeManagement/articleVersions/masterVersions"))
            .json(&json!({ "articleId": article_id }));
        let res = self.send("create_draft", article_id, req).await?;
        let created: CreateResponse = Self::json("create_draft", article_id, res).await?;
        Ok(created.id)
    }

    async fn update(&self, version_id: &str, fields: &ArticleFields) -> Result<(), RemoteError> {
        let req = self
            .http
            .patch(self.sobject_url(Some(version_id)))
            .json(&self.fields_to_json(fields));
        let res = self.send("update", version_id, req).await?;
        Self::expect_success("update", version_id, res).await?;
        Ok(())
    }

    async fn delete(&self, version_id: &str) -> Result<(), RemoteError> {
        let req = self.http.delete(self.sobject_url(Some(version_id)));
        let res = self.send("delete", version_id, req).await?;
        if res.status() == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Self::expect_success("delete", version_id, res).await?;
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
        let req = self
            .http
            .patch(self.api_url(&format!(
                "knowledgeManagement/articleVersions/masterVersions/{}",
                version_id
            )))
            .json(&json!({ "publishStatus": state.as_str() }));
        let res = self.send(operation, version_id, req).await?;
        Self::expect_success(operation, version_id, res).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn kb() -> RestKnowledgeBase {
        let cfg: Config = serde_yaml::from_str(crate::config::example()).unwrap();
        RestKnowledgeBase::from_config(&cfg.knowledge, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn soql_values_are_escaped() {
        assert_eq!(soql_quote("it's"), r"'it\'s'");
        assert_eq!(soql_quote(r"a\b"), r"'a\\b'");
    }

    #[test]
    fn list_query_is_docset_scoped() {
        let q = kb().list_query("ds-1", PublishState::Online);
        assert!(q.starts_with("SELECT Id, KnowledgeArticleId, PublishStatus"));
        assert!(q.contains("FROM Resource__kav"));
        assert!(q.ends_with("PublishStatus = 'Online' AND Language = 'en_US' AND Docset_Id__c = 'ds-1'"));
    }

    #[test]
    fn decodes_record_fields() {
        let value = json!({
            "Id": "ka1",
            "KnowledgeArticleId": "kA0",
            "PublishStatus": "Draft",
            "Title": "Intro",
            "UrlName": "intro",
            "Summary": "s",
            "ArticleBody__c": "<div></div>",
            "ArticleAuthor__c": "Docs",
            "ArticleAuthorOverride__c": null,
            "IsVisibleInApp": true,
            "IsVisibleInCsp": false,
            "IsVisibleInPkb": true,
            "IsVisibleInPrm": false
        });
        let record = kb().record_from_json(&value).unwrap();
        assert_eq!(record.article_id, "kA0");
        assert_eq!(record.publish_state, PublishState::Draft);
        assert_eq!(record.fields.author.as_deref(), Some("Docs"));
        assert_eq!(record.fields.author_override, None);
        assert!(record.fields.is_visible_in_app);
        assert!(!record.fields.is_visible_in_csp);
    }

    #[test]
    fn encodes_mapped_field_names() {
        let record = kb()
            .record_from_json(&json!({"Id": "1", "PublishStatus": "Online", "Title": "T"}))
            .unwrap();
        let body = kb().fields_to_json(&record.fields);
        assert_eq!(body["Title"], json!("T"));
        assert!(body.contains_key("ArticleBody__c"));
        assert!(body.contains_key("IsVisibleInPrm"));
    }
}
