use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Deserialize)]
pub struct QueryResponse {
    #[serde(default)]
    pub records: Vec<Value>,
    #[serde(default)]
    pub done: bool,
    #[serde(rename = "nextRecordsUrl")]
    pub next_records_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CreateResponse {
    pub id: String,
}
