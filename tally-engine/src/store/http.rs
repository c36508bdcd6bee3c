//! Hosted store API client
//!
//! Rate limited with a token bucket. Reads and updates are retried on
//! transient failures through [`NotionStore::send`]; creates go through
//! [`NotionStore::send_create`] and are retried only when throttled, so a
//! create the store committed before failing is never sent twice.

use super::types::{
    CollectionId, CollectionSchema, FieldMap, FieldSchema, FieldValue, Filter, Item, Page,
};
use super::{wire, RecordStore, StoreError};
use crate::retry::{retry_rejected, retry_transient};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use reqwest::Method;
use serde_json::{json, Value};
use std::num::NonZeroU32;
use std::time::Duration;
use tally_common::config::StoreSettings;
use tracing::warn;

const API_VERSION: &str = "2022-06-28";
const USER_AGENT: &str = concat!("tally-engine/", env!("CARGO_PKG_VERSION"));

/// Store client over the hosted HTTP API
pub struct NotionStore {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    rate_limiter: DefaultDirectRateLimiter,
    max_retry_wait_ms: u64,
    page_size: u32,
}

impl NotionStore {
    pub fn new(api_key: impl Into<String>, settings: &StoreSettings) -> Result<Self, StoreError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let per_second = NonZeroU32::new(settings.requests_per_second).unwrap_or(NonZeroU32::MIN);

        Ok(Self {
            http_client,
            base_url: settings.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            rate_limiter: RateLimiter::direct(Quota::per_second(per_second)),
            max_retry_wait_ms: settings.max_retry_wait_ms,
            page_size: settings.page_size.clamp(1, 100),
        })
    }

    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, StoreError> {
        let operation = format!("{} {}", method, path);
        retry_transient(&operation, self.max_retry_wait_ms, || {
            self.send_once(method.clone(), path, body)
        })
        .await
    }

    async fn send_create(&self, path: &str, body: &Value) -> Result<Value, StoreError> {
        let operation = format!("POST {}", path);
        retry_rejected(&operation, self.max_retry_wait_ms, || {
            self.send_once(Method::POST, path, Some(body))
        })
        .await
    }

    async fn send_once(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, StoreError> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        tracing::debug!(method = %method, url = %url, "Store request");

        let mut request = self
            .http_client
            .request(method, &url)
            .bearer_auth(&self.api_key)
            .header("Notion-Version", API_VERSION);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| StoreError::Network(e.to_string()))?;

        let status = response.status();

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(StoreError::RateLimited);
        }

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(path.to_string()));
        }

        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&error_text)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or(error_text);
            return Err(StoreError::Api {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| StoreError::Parse(e.to_string()))
    }
}

fn id_of(value: &Value) -> Result<String, StoreError> {
    value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| StoreError::Parse("response without id".into()))
}

/// Decode query results; a result that cannot be decoded is logged and dropped
fn results_to_items(collection_id: &str, response: &Value) -> Result<Vec<Item>, StoreError> {
    let results = response
        .get("results")
        .and_then(Value::as_array)
        .ok_or_else(|| StoreError::Parse("query response without results".into()))?;

    let mut items = Vec::with_capacity(results.len());
    for result in results {
        match wire::page_to_item(result) {
            Ok(item) => items.push(item),
            Err(e) => warn!(collection_id, error = %e, "Skipping undecodable query result"),
        }
    }
    Ok(items)
}

fn next_cursor(value: &Value) -> Option<String> {
    if value.get("has_more").and_then(Value::as_bool) == Some(false) {
        return None;
    }
    value
        .get("next_cursor")
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl RecordStore for NotionStore {
    async fn create_collection(&self, schema: &CollectionSchema) -> Result<CollectionId, StoreError> {
        let body = wire::schema_to_json(schema);
        let response = self.send_create("/databases", &body).await?;
        let id = id_of(&response)?;
        tracing::info!(collection_id = %id, title = %schema.title, "Created collection");
        Ok(id)
    }

    async fn query_collection(
        &self,
        collection_id: &str,
        filter: Option<&Filter>,
        cursor: Option<&str>,
    ) -> Result<Page, StoreError> {
        let mut body = json!({ "page_size": self.page_size });
        if let Some(filter) = filter {
            body["filter"] = wire::filter_to_json(filter);
        }
        if let Some(cursor) = cursor {
            body["start_cursor"] = json!(cursor);
        }

        let path = format!("/databases/{}/query", collection_id);
        let response = self.send(Method::POST, &path, Some(&body)).await?;

        Ok(Page {
            items: results_to_items(collection_id, &response)?,
            next_cursor: next_cursor(&response),
        })
    }

    async fn get_item(&self, item_id: &str) -> Result<Item, StoreError> {
        let path = format!("/pages/{}", item_id);
        let response = self.send(Method::GET, &path, None).await?;
        wire::page_to_item(&response)
    }

    async fn create_item(&self, collection_id: &str, fields: FieldMap) -> Result<Item, StoreError> {
        let body = json!({
            "parent": { "database_id": collection_id },
            "properties": wire::fields_to_properties(&fields),
        });
        let response = self.send_create("/pages", &body).await?;
        wire::page_to_item(&response)
    }

    async fn update_item(&self, item_id: &str, fields: FieldMap) -> Result<(), StoreError> {
        let body = json!({ "properties": wire::fields_to_properties(&fields) });
        let path = format!("/pages/{}", item_id);
        self.send(Method::PATCH, &path, Some(&body)).await?;
        Ok(())
    }

    async fn get_item_field_value(&self, item_id: &str, field_id: &str) -> Result<FieldValue, StoreError> {
        let base_path = format!("/pages/{}/properties/{}", item_id, field_id);
        let first = self.send(Method::GET, &base_path, None).await?;

        if first.get("object").and_then(Value::as_str) == Some("property_item") {
            return Ok(wire::property_to_value(&first));
        }

        // Paginated property: keep fetching until the cursor runs out
        let kind = first
            .get("property_item")
            .and_then(|p| p.get("type"))
            .and_then(Value::as_str)
            .or_else(|| {
                first
                    .get("results")
                    .and_then(Value::as_array)
                    .and_then(|r| r.first())
                    .and_then(|r| r.get("type"))
                    .and_then(Value::as_str)
            })
            .unwrap_or("")
            .to_string();

        let mut results: Vec<Value> = first
            .get("results")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();
        let mut cursor = next_cursor(&first);

        while let Some(start) = cursor {
            let path = format!("{}?start_cursor={}", base_path, start);
            let page = self.send(Method::GET, &path, None).await?;
            if let Some(more) = page.get("results").and_then(Value::as_array) {
                results.extend(more.iter().cloned());
            }
            cursor = next_cursor(&page);
        }

        Ok(wire::property_items_to_value(&kind, &results))
    }

    async fn list_collection_fields(&self, collection_id: &str) -> Result<Vec<FieldSchema>, StoreError> {
        let path = format!("/databases/{}", collection_id);
        let response = self.send(Method::GET, &path, None).await?;
        wire::database_fields(&response)
    }
}
