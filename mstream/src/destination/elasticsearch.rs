use std::time::Duration;

use mstream_config::shared::ElasticsearchConfig;
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value, json};
use tracing::{debug, info};

use crate::destination::{
    BulkAction, BulkItemError, BulkItemResult, BulkOperation, BulkResponse, BulkUnit,
    Destination, IndexTarget, ScrollPage, StoredDocumentMeta,
};
use crate::error::{ErrorKind, MstreamResult};
use crate::{bail, mstream_error};

const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Elasticsearch cluster reached over its REST API.
///
/// Bulk metadata follows the configured API version: mapping types are only sent before 7,
/// parents are sent as `_parent` before 6, `parent` on 6 and `routing` from 7 on, and version
/// fields lose their leading underscore from 6 on.
#[derive(Debug, Clone)]
pub struct ElasticsearchDestination {
    client: Client,
    base_url: String,
    username: Option<String>,
    password: Option<SecretString>,
    api_major_version: u32,
    scroll_keep_alive: String,
}

impl ElasticsearchDestination {
    pub fn new(config: &ElasticsearchConfig) -> MstreamResult<Self> {
        let api_major_version = config
            .api_major_version()
            .map_err(|err| mstream_error!(ErrorKind::ConfigError, "Invalid api version", err))?;

        let client = Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_owned(),
            username: config.username.clone(),
            password: config.password.clone().map(Into::into),
            api_major_version,
            scroll_keep_alive: config.scroll_keep_alive.clone(),
        })
    }

    /// Checks that the cluster answers and logs its reported version.
    pub async fn ping(&self) -> MstreamResult<()> {
        let body = self.send_json(self.request(reqwest::Method::GET, "")).await?;
        let version = body
            .pointer("/version/number")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        info!(url = %self.base_url, version, "connected to elasticsearch");

        Ok(())
    }

    fn request(&self, method: reqwest::Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let request = self.client.request(method, url);

        match &self.username {
            Some(username) => request.basic_auth(
                username,
                self.password
                    .as_ref()
                    .map(|password| password.expose_secret().to_owned()),
            ),
            None => request,
        }
    }

    async fn send_json(&self, request: RequestBuilder) -> MstreamResult<Value> {
        let response = request.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            bail!(
                ErrorKind::DestinationQueryFailed,
                "Elasticsearch request failed",
                format!("{status}: {}", error_summary(&body))
            );
        }

        Ok(serde_json::from_str(&body)?)
    }

    fn search_path(&self, target: &IndexTarget) -> String {
        match (&target.doc_type, self.api_major_version < 7) {
            (Some(doc_type), true) => format!("{}/{}/_search", target.index, doc_type),
            _ => format!("{}/_search", target.index),
        }
    }

    fn action_metadata(&self, action: &BulkAction) -> Value {
        let legacy = self.api_major_version < 6;
        let mut metadata = Map::new();

        metadata.insert("_index".to_owned(), Value::from(action.index.as_str()));
        if self.api_major_version < 7
            && let Some(doc_type) = &action.doc_type
        {
            metadata.insert("_type".to_owned(), Value::from(doc_type.as_str()));
        }
        metadata.insert("_id".to_owned(), Value::from(action.id.as_str()));

        if let Some(parent) = &action.parent {
            let field = match self.api_major_version {
                0..=5 => "_parent",
                6 => "parent",
                _ => "routing",
            };
            metadata.insert(field.to_owned(), Value::from(parent.as_str()));
        }

        if let Some(version) = action.version {
            let field = if legacy { "_version" } else { "version" };
            metadata.insert(field.to_owned(), Value::from(version));
        }

        if let Some(version_type) = action.version_type {
            let field = if legacy { "_version_type" } else { "version_type" };
            metadata.insert(field.to_owned(), Value::from(version_type.as_str()));
        }

        json!({ action.operation.as_str(): metadata })
    }

    fn bulk_body(&self, units: &[BulkUnit]) -> MstreamResult<String> {
        let mut body = String::new();
        for unit in units {
            body.push_str(&serde_json::to_string(&self.action_metadata(&unit.action))?);
            body.push('\n');
            if let Some(document) = &unit.document {
                body.push_str(&serde_json::to_string(document)?);
                body.push('\n');
            }
        }

        Ok(body)
    }
}

/// Extracts `error.type` and `error.reason` from an error body, falling back to the raw body.
fn error_summary(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<Value>(body) else {
        return body.to_owned();
    };

    match value.get("error") {
        Some(Value::Object(error)) => format!(
            "{}: {}",
            error.get("type").and_then(Value::as_str).unwrap_or("unknown"),
            error.get("reason").and_then(Value::as_str).unwrap_or("")
        ),
        Some(other) => other.to_string(),
        None => body.to_owned(),
    }
}

fn parse_bulk_item(item: &Value) -> Option<BulkItemResult> {
    let (operation, result) = item.as_object()?.iter().next()?;
    let operation = match operation.as_str() {
        "delete" => BulkOperation::Delete,
        _ => BulkOperation::Index,
    };

    let error = result.get("error").map(|error| match error {
        Value::Object(error) => BulkItemError {
            error_type: error
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_owned(),
            reason: error
                .get("reason")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_owned(),
        },
        other => BulkItemError {
            error_type: "unknown".to_owned(),
            reason: other.to_string(),
        },
    });

    Some(BulkItemResult {
        operation,
        index: result
            .get("_index")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        id: result
            .get("_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        status: result
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|status| u16::try_from(status).ok())
            .unwrap_or(0),
        error,
    })
}

/// `hits.total` is a number before 7 and `{ "value": n }` from 7 on.
fn parse_total(hits: &Value) -> u64 {
    match hits.get("total") {
        Some(Value::Number(total)) => total.as_u64().unwrap_or(0),
        Some(Value::Object(total)) => total.get("value").and_then(Value::as_u64).unwrap_or(0),
        _ => 0,
    }
}

fn parse_hit(hit: &Value) -> Option<StoredDocumentMeta> {
    let id = hit.get("_id")?.as_str()?.to_owned();
    let parent = hit
        .get("_parent")
        .or_else(|| hit.get("_routing"))
        .and_then(Value::as_str)
        .map(str::to_owned);
    let version = hit.get("_version").and_then(Value::as_i64);

    Some(StoredDocumentMeta {
        id,
        parent,
        version,
    })
}

fn parse_scroll_page(body: &Value) -> ScrollPage {
    let hits = body.get("hits").cloned().unwrap_or(Value::Null);
    let documents = hits
        .get("hits")
        .and_then(Value::as_array)
        .map(|hits| hits.iter().filter_map(parse_hit).collect())
        .unwrap_or_default();

    ScrollPage {
        scroll_id: body
            .get("_scroll_id")
            .and_then(Value::as_str)
            .map(str::to_owned),
        total: parse_total(&hits),
        hits: documents,
    }
}

impl Destination for ElasticsearchDestination {
    async fn bulk(&self, units: Vec<BulkUnit>) -> MstreamResult<BulkResponse> {
        if units.is_empty() {
            return Ok(BulkResponse::default());
        }

        let body = self.bulk_body(&units)?;
        let response = self
            .send_json(
                self.request(reqwest::Method::POST, "_bulk")
                    .header(reqwest::header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
                    .body(body),
            )
            .await?;

        let items = response
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().filter_map(parse_bulk_item).collect())
            .unwrap_or_default();

        Ok(BulkResponse { items })
    }

    async fn find_document(
        &self,
        target: &IndexTarget,
        id: &str,
        with_version: bool,
    ) -> MstreamResult<Option<StoredDocumentMeta>> {
        let request = self
            .request(reqwest::Method::POST, &self.search_path(target))
            .json(&json!({
                "query": { "ids": { "values": [id] } },
                "size": 1,
                "version": with_version,
                "_source": false,
            }));

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(index = %target.index, "lookup on a missing index");
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            bail!(
                ErrorKind::DestinationQueryFailed,
                "Document lookup failed",
                format!("{status}: {}", error_summary(&body))
            );
        }

        let body: Value = response.json().await?;
        Ok(body
            .pointer("/hits/hits/0")
            .and_then(parse_hit))
    }

    async fn open_scroll(
        &self,
        target: &IndexTarget,
        page_size: usize,
        with_version: bool,
    ) -> MstreamResult<ScrollPage> {
        let path = format!(
            "{}?scroll={}",
            self.search_path(target),
            self.scroll_keep_alive
        );
        let body = self
            .send_json(self.request(reqwest::Method::POST, &path).json(&json!({
                "size": page_size,
                "version": with_version,
                "_source": false,
                "sort": ["_doc"],
                "query": { "match_all": {} },
            })))
            .await?;

        Ok(parse_scroll_page(&body))
    }

    async fn next_scroll_page(&self, scroll_id: &str) -> MstreamResult<ScrollPage> {
        let body = self
            .send_json(
                self.request(reqwest::Method::POST, "_search/scroll")
                    .json(&json!({
                        "scroll": self.scroll_keep_alive,
                        "scroll_id": scroll_id,
                    })),
            )
            .await?;

        Ok(parse_scroll_page(&body))
    }
}

#[cfg(test)]
mod tests {
    use mstream_config::shared::VersionType;

    use super::*;

    fn destination(api_version: &str) -> ElasticsearchDestination {
        ElasticsearchDestination::new(&ElasticsearchConfig {
            url: "http://localhost:9200/".to_owned(),
            username: None,
            password: None,
            api_version: api_version.to_owned(),
            request_timeout_ms: 1000,
            scroll_keep_alive: "1m".to_owned(),
        })
        .unwrap()
    }

    fn child_action() -> BulkAction {
        BulkAction {
            operation: BulkOperation::Index,
            index: "shop-orders".to_owned(),
            doc_type: Some("orders".to_owned()),
            id: "42".to_owned(),
            parent: Some("7".to_owned()),
            version: Some(1_700_000_000_000),
            version_type: Some(VersionType::External),
        }
    }

    #[test]
    fn legacy_clusters_get_underscored_metadata() {
        let metadata = destination("5.6").action_metadata(&child_action());

        assert_eq!(
            metadata,
            json!({"index": {
                "_index": "shop-orders",
                "_type": "orders",
                "_id": "42",
                "_parent": "7",
                "_version": 1_700_000_000_000_i64,
                "_version_type": "external",
            }})
        );
    }

    #[test]
    fn typeless_clusters_route_children() {
        let metadata = destination("7.10").action_metadata(&child_action());

        assert_eq!(
            metadata,
            json!({"index": {
                "_index": "shop-orders",
                "_id": "42",
                "routing": "7",
                "version": 1_700_000_000_000_i64,
                "version_type": "external",
            }})
        );
    }

    #[test]
    fn bulk_body_has_one_line_per_delete() {
        let destination = destination("7.10");
        let mut delete = child_action();
        delete.operation = BulkOperation::Delete;
        let units = vec![
            BulkUnit::index(child_action(), Map::new()),
            BulkUnit::delete(delete),
        ];

        let body = destination.bulk_body(&units).unwrap();

        assert_eq!(body.lines().count(), 3);
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn parses_item_errors_and_totals() {
        let item = json!({"index": {
            "_index": "shop", "_id": "1", "status": 400,
            "error": {"type": "routing_missing_exception", "reason": "routing is required"}
        }});
        let parsed = parse_bulk_item(&item).unwrap();
        assert!(parsed.error.unwrap().is_routing_missing());

        assert_eq!(parse_total(&json!({"total": 12})), 12);
        assert_eq!(parse_total(&json!({"total": {"value": 7, "relation": "eq"}})), 7);
    }
}
