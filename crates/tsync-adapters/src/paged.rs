use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;
use tsync_core::{FetchWindow, Record};
use tsync_storage::{FetchRequest, HttpFetcher};
use uuid::Uuid;

use crate::{AdapterError, SourceFetcher};

fn default_page_size() -> usize {
    1000
}

fn default_first_page() -> usize {
    1
}

fn default_max_pages() -> usize {
    10_000
}

fn default_entity_param() -> String {
    "Symbol".to_string()
}

fn default_start_param() -> String {
    "StartDate".to_string()
}

fn default_end_param() -> String {
    "EndDate".to_string()
}

fn default_page_index_param() -> String {
    "PageIndex".to_string()
}

fn default_page_size_param() -> String {
    "PageSize".to_string()
}

fn default_date_format() -> String {
    "%d/%m/%Y".to_string()
}

fn default_rows_pointer() -> String {
    "/Data".to_string()
}

/// The `source` block of a dataset registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PagedSourceConfig {
    pub url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_first_page")]
    pub first_page: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
    #[serde(default = "default_entity_param")]
    pub entity_param: String,
    #[serde(default = "default_start_param")]
    pub start_param: String,
    #[serde(default = "default_end_param")]
    pub end_param: String,
    #[serde(default = "default_page_index_param")]
    pub page_index_param: String,
    #[serde(default = "default_page_size_param")]
    pub page_size_param: String,
    /// chrono format used for the start/end query values.
    #[serde(default = "default_date_format")]
    pub date_format: String,
    /// JSON pointer to the rows array inside each page.
    #[serde(default = "default_rows_pointer")]
    pub rows_pointer: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub extra_query: BTreeMap<String, String>,
    #[serde(default)]
    pub page_delay_ms: u64,
}

impl PagedSourceConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            page_size: default_page_size(),
            first_page: default_first_page(),
            max_pages: default_max_pages(),
            entity_param: default_entity_param(),
            start_param: default_start_param(),
            end_param: default_end_param(),
            page_index_param: default_page_index_param(),
            page_size_param: default_page_size_param(),
            date_format: default_date_format(),
            rows_pointer: default_rows_pointer(),
            headers: BTreeMap::new(),
            extra_query: BTreeMap::new(),
            page_delay_ms: 0,
        }
    }
}

/// Range fetcher for endpoints that page through `(symbol, start, end)` queries.
#[derive(Debug, Clone)]
pub struct PagedJsonFetcher {
    source_id: String,
    run_id: Uuid,
    config: PagedSourceConfig,
    headers: Vec<(String, String)>,
    http: Arc<HttpFetcher>,
}

impl PagedJsonFetcher {
    pub fn new(source_id: impl Into<String>, config: PagedSourceConfig, http: Arc<HttpFetcher>) -> Self {
        let headers = config
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            source_id: source_id.into(),
            run_id: Uuid::new_v4(),
            config,
            headers,
            http,
        }
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }

    pub fn config(&self) -> &PagedSourceConfig {
        &self.config
    }

    fn page_query(&self, entity: &str, window: &FetchWindow, page: usize) -> Vec<(String, String)> {
        let c = &self.config;
        let mut query = vec![
            (c.entity_param.clone(), entity.to_string()),
            (c.start_param.clone(), window.from.format(&c.date_format).to_string()),
            (c.end_param.clone(), window.to.format(&c.date_format).to_string()),
            (c.page_index_param.clone(), page.to_string()),
            (c.page_size_param.clone(), c.page_size.to_string()),
        ];
        query.extend(c.extra_query.iter().map(|(k, v)| (k.clone(), v.clone())));
        query
    }

    /// Rows of one page. An absent or null rows value is an empty page.
    fn page_rows(&self, entity: &str, body: &[u8]) -> Result<Vec<JsonValue>, AdapterError> {
        let json: JsonValue = serde_json::from_slice(body).map_err(|err| AdapterError::Malformed {
            entity: entity.to_string(),
            message: format!("invalid json: {err}"),
        })?;
        match json.pointer(&self.config.rows_pointer) {
            None | Some(JsonValue::Null) => Ok(Vec::new()),
            Some(JsonValue::Array(rows)) => Ok(rows.clone()),
            Some(other) => Err(AdapterError::Malformed {
                entity: entity.to_string(),
                message: format!(
                    "expected an array at `{}`, found {}",
                    self.config.rows_pointer,
                    json_kind(other)
                ),
            }),
        }
    }
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

#[async_trait]
impl SourceFetcher for PagedJsonFetcher {
    async fn fetch(&self, entity: &str, window: &FetchWindow) -> Result<Vec<Record>, AdapterError> {
        let mut records = Vec::new();
        let last_page = self.config.first_page.saturating_add(self.config.max_pages.max(1));

        for page in self.config.first_page..last_page {
            if page > self.config.first_page && self.config.page_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.page_delay_ms)).await;
            }

            let query = self.page_query(entity, window, page);
            let response = self
                .http
                .get(
                    self.run_id,
                    FetchRequest {
                        source_id: &self.source_id,
                        url: &self.config.url,
                        query: &query,
                        headers: &self.headers,
                    },
                )
                .await?;

            let rows = self.page_rows(entity, &response.body)?;
            let count = rows.len();
            debug!(source_id = %self.source_id, entity, page, rows = count, "fetched page");
            records.extend(rows.iter().map(|row| Record::from_json_object(entity, row)));

            if count < self.config.page_size {
                break;
            }
        }

        Ok(records)
    }
}
