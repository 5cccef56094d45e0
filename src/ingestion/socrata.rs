//! Socrata (NYC Open Data) page source

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::ingestion::connector::{PageRequest, PageSource, RawRecord, SourceError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::info;

const APP_TOKEN_HEADER: &str = "X-App-Token";

/// Paginated SODA endpoint, e.g. `.../resource/usep-8jbt.json`.
pub struct SocrataSource {
    client: reqwest::Client,
    resource_url: String,
    metadata_url: String,
    app_token: Option<String>,
}

impl SocrataSource {
    pub fn new(config: &PipelineConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| PipelineError::Config(format!("cannot build HTTP client: {}", e)))?;

        if config.app_token.is_some() {
            info!("Using app token for higher rate limits");
        }

        Ok(Self {
            client,
            resource_url: config.resource_url(),
            metadata_url: metadata_url(&config.base_url, &config.dataset_id),
            app_token: config.app_token.clone(),
        })
    }

    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.app_token {
            Some(token) => builder.header(APP_TOKEN_HEADER, token),
            None => builder,
        }
    }

    /// Dataset metadata (name, last update, columns) from the views API.
    pub async fn dataset_info(&self) -> std::result::Result<DatasetInfo, SourceError> {
        let response = self
            .authorize(self.client.get(&self.metadata_url))
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_body(response).await?;
        serde_json::from_str(&body).map_err(|e| SourceError::Decode(e.to_string()))
    }
}

/// SoQL query parameters for one page.
///
/// Ordering by `sale_date` then the row id keeps offsets stable across pages.
pub fn soql_params(request: &PageRequest) -> Vec<(String, String)> {
    let mut params = vec![
        ("$limit".to_string(), request.limit.to_string()),
        ("$offset".to_string(), request.offset.to_string()),
        ("$order".to_string(), "sale_date ASC, :id ASC".to_string()),
    ];

    let mut clauses = Vec::new();
    if let Some(start) = request.start_date {
        clauses.push(format!("sale_date >= '{}'", start.format("%Y-%m-%d")));
    }
    if let Some(end) = request.end_date {
        clauses.push(format!("sale_date <= '{}'", end.format("%Y-%m-%d")));
    }
    if !clauses.is_empty() {
        params.push(("$where".to_string(), clauses.join(" AND ")));
    }
    params
}

fn metadata_url(base_url: &str, dataset_id: &str) -> String {
    let base = base_url.trim_end_matches('/');
    let root = base.strip_suffix("/resource").unwrap_or(base);
    format!("{}/api/views/{}.json", root, dataset_id)
}

fn transport_error(err: reqwest::Error) -> SourceError {
    SourceError::Transport {
        timeout: err.is_timeout(),
        message: err.to_string(),
    }
}

async fn read_body(response: reqwest::Response) -> std::result::Result<String, SourceError> {
    let status = response.status();
    let body = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(SourceError::Status {
            status: status.as_u16(),
            body: body.chars().take(512).collect(),
        });
    }
    Ok(body)
}

/// Parse a page body: a JSON array of objects.
pub fn parse_page(body: &str) -> std::result::Result<Vec<RawRecord>, SourceError> {
    let value: Value = serde_json::from_str(body).map_err(|e| SourceError::Decode(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        other => {
            return Err(SourceError::Decode(format!(
                "expected a JSON array, found {}",
                type_name(&other)
            )))
        }
    };

    items
        .into_iter()
        .enumerate()
        .map(|(idx, item)| match item {
            Value::Object(map) => Ok(map),
            other => Err(SourceError::Decode(format!(
                "element {} is {}, not an object",
                idx,
                type_name(&other)
            ))),
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl PageSource for SocrataSource {
    async fn fetch_page(&self, request: &PageRequest) -> std::result::Result<Vec<RawRecord>, SourceError> {
        let response = self
            .authorize(self.client.get(&self.resource_url))
            .query(&soql_params(request))
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_body(response).await?;
        parse_page(&body)
    }

    fn source_id(&self) -> &str {
        &self.resource_url
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub rows_updated_at: Option<i64>,
    #[serde(default)]
    pub columns: Vec<ColumnInfo>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnInfo {
    pub name: String,
    #[serde(default)]
    pub field_name: Option<String>,
    #[serde(default)]
    pub data_type_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn params_carry_paging_and_date_filter() {
        let request = PageRequest {
            offset: 100_000,
            limit: 50_000,
            start_date: NaiveDate::from_ymd_opt(2019, 1, 1),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31),
        };
        let params = soql_params(&request);
        let get = |k: &str| params.iter().find(|(key, _)| key == k).map(|(_, v)| v.as_str());

        assert_eq!(get("$limit"), Some("50000"));
        assert_eq!(get("$offset"), Some("100000"));
        assert_eq!(
            get("$where"),
            Some("sale_date >= '2019-01-01' AND sale_date <= '2024-12-31'")
        );
    }

    #[test]
    fn no_where_clause_without_dates() {
        let request = PageRequest {
            offset: 0,
            limit: 10,
            start_date: None,
            end_date: None,
        };
        assert!(soql_params(&request).iter().all(|(k, _)| k != "$where"));
    }

    #[test]
    fn metadata_url_uses_views_api() {
        assert_eq!(
            metadata_url("https://data.cityofnewyork.us/resource/", "usep-8jbt"),
            "https://data.cityofnewyork.us/api/views/usep-8jbt.json"
        );
    }

    #[test]
    fn non_array_body_is_a_decode_error() {
        assert!(matches!(parse_page(r#"{"error": true}"#), Err(SourceError::Decode(_))));
        assert!(matches!(parse_page("[1, 2]"), Err(SourceError::Decode(_))));
        assert!(matches!(parse_page("<html>"), Err(SourceError::Decode(_))));
        assert_eq!(parse_page(r#"[{"borough": "1"}]"#).unwrap().len(), 1);
    }

    #[test]
    fn dataset_info_tolerates_missing_fields() {
        let info: DatasetInfo = serde_json::from_str(
            r#"{"name": "Citywide Rolling Calendar Sales", "columns": [{"name": "BOROUGH", "dataTypeName": "text"}]}"#,
        )
        .unwrap();
        assert_eq!(info.columns.len(), 1);
        assert!(info.rows_updated_at.is_none());
    }
}
