//! Item store collaborators.
//!
//! `JsonApiClient` talks to a JSON:API backend over HTTP. `InMemoryRepository`
//! keeps batches in process and backs the service when no backend is
//! configured, as well as the tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{SaveError, SourceError};
use crate::model::{BatchId, Item, ItemId, ItemUpdate};
use crate::session::{ItemSink, ItemSource};

pub const DEFAULT_RESOURCE: &str = "pcr-batch-item";
pub const DEFAULT_BATCH_FIELD: &str = "pcrBatch.uuid";
pub const DEFAULT_PAGE_LIMIT: u32 = 1000;

const JSON_API_MEDIA_TYPE: &str = "application/vnd.api+json";

/// Both halves of the store, for callers that hold one handle.
pub trait ItemRepository: ItemSource + ItemSink {}

impl<T: ItemSource + ItemSink + ?Sized> ItemRepository for T {}

#[derive(Debug, Deserialize)]
struct ResourceDocument {
    data: Vec<ResourceObject>,
}

#[derive(Debug, Deserialize)]
struct ResourceObject {
    id: String,
    #[serde(default)]
    attributes: ItemAttributes,
}

#[derive(Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct ItemAttributes {
    #[serde(default, skip_serializing)]
    name: Option<String>,
    #[serde(default)]
    well_row: Option<String>,
    #[serde(default)]
    well_column: Option<u32>,
}

#[derive(Debug, Serialize)]
struct OperationsDocument<'a> {
    operations: Vec<Operation<'a>>,
}

#[derive(Debug, Serialize)]
struct Operation<'a> {
    op: &'static str,
    path: &'a str,
    value: OperationValue<'a>,
}

#[derive(Debug, Serialize)]
struct OperationValue<'a> {
    id: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    attributes: ItemAttributes,
}

fn parse_items(body: &str) -> Result<Vec<Item>, SourceError> {
    let document: ResourceDocument = serde_json::from_str(body)?;
    Ok(document
        .data
        .into_iter()
        .map(|resource| Item {
            id: ItemId::new(resource.id),
            name: resource.attributes.name,
            row_coordinate: resource.attributes.well_row,
            column_coordinate: resource.attributes.well_column,
        })
        .collect())
}

fn build_operations<'a>(resource: &'a str, changes: &'a [ItemUpdate]) -> OperationsDocument<'a> {
    OperationsDocument {
        operations: changes
            .iter()
            .map(|change| Operation {
                op: "PATCH",
                path: resource,
                value: OperationValue {
                    id: change.id.as_str(),
                    kind: resource,
                    attributes: ItemAttributes {
                        name: None,
                        well_row: change.row_coordinate.clone(),
                        well_column: change.column_coordinate,
                    },
                },
            })
            .collect(),
    }
}

/// First `detail` (or `title`) of a JSON:API error document.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            let first = value.get("errors")?.get(0)?;
            first
                .get("detail")
                .or_else(|| first.get("title"))
                .and_then(|message| message.as_str())
                .map(str::to_owned)
        })
        .unwrap_or_else(|| "Unknown error".to_string())
}

/// Client for a JSON:API item store.
pub struct JsonApiClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    resource: String,
    batch_field: String,
    page_limit: u32,
}

impl JsonApiClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("plate_layout/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: None,
            resource: DEFAULT_RESOURCE.to_string(),
            batch_field: DEFAULT_BATCH_FIELD.to_string(),
            page_limit: DEFAULT_PAGE_LIMIT,
        })
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_page_limit(mut self, limit: u32) -> Self {
        self.page_limit = limit;
        self
    }

    /// Targets another resource type, e.g. material samples on a storage box.
    pub fn with_resource(mut self, resource: impl Into<String>, batch_field: impl Into<String>) -> Self {
        self.resource = resource.into();
        self.batch_field = batch_field.into();
        self
    }

    fn items_url(&self) -> String {
        format!("{}/{}", self.base_url, self.resource)
    }

    fn operations_url(&self) -> String {
        format!("{}/operations", self.base_url)
    }

    fn fetch_query(&self, batch: &BatchId) -> [(&'static str, String); 2] {
        [
            ("filter[rsql]", format!("{}=={}", self.batch_field, batch)),
            ("page[limit]", self.page_limit.to_string()),
        ]
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ItemSource for JsonApiClient {
    #[instrument(skip(self))]
    async fn fetch_items(&self, batch: &BatchId) -> Result<Vec<Item>, SourceError> {
        debug!("Fetching batch items");
        let request = self
            .http
            .get(self.items_url())
            .header("Accept", JSON_API_MEDIA_TYPE)
            .query(&self.fetch_query(batch));
        let response = self.authorize(request).send().await?;

        let status = response.status();
        let body = response.text().await?;
        if status == StatusCode::NOT_FOUND {
            return Err(SourceError::BatchNotFound(batch.clone()));
        }
        if !status.is_success() {
            return Err(SourceError::Api {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }

        let items = parse_items(&body)?;
        debug!(count = items.len(), "Fetched batch items");
        Ok(items)
    }
}

#[async_trait]
impl ItemSink for JsonApiClient {
    #[instrument(skip(self, changes), fields(changes = changes.len()))]
    async fn save(&self, batch: &BatchId, changes: &[ItemUpdate]) -> Result<(), SaveError> {
        if changes.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_vec(&build_operations(&self.resource, changes))?;

        debug!("Sending coordinate updates");
        let request = self
            .http
            .post(self.operations_url())
            .header("Content-Type", JSON_API_MEDIA_TYPE)
            .header("Accept", JSON_API_MEDIA_TYPE)
            .body(body);
        let response = self.authorize(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(SaveError::Rejected {
                status: status.as_u16(),
                message: error_message(&body),
            });
        }
        Ok(())
    }
}

/// Process-local item store.
#[derive(Debug, Default)]
pub struct InMemoryRepository {
    batches: Mutex<HashMap<BatchId, Vec<Item>>>,
    reject_saves: AtomicBool,
    saves: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads batches from a JSON object mapping batch ids to item arrays.
    pub fn from_seed_json(json: &str) -> Result<Self, serde_json::Error> {
        let batches: HashMap<BatchId, Vec<Item>> = serde_json::from_str(json)?;
        Ok(Self {
            batches: Mutex::new(batches),
            ..Self::default()
        })
    }

    /// Inserts or replaces a batch.
    pub fn insert_batch(&self, batch: BatchId, items: Vec<Item>) {
        self.lock().insert(batch, items);
    }

    pub fn items(&self, batch: &BatchId) -> Option<Vec<Item>> {
        self.lock().get(batch).cloned()
    }

    pub fn batch_count(&self) -> usize {
        self.lock().len()
    }

    /// Makes every following save fail, for exercising retry paths.
    pub fn reject_saves(&self, reject: bool) {
        self.reject_saves.store(reject, Ordering::SeqCst);
    }

    /// Number of successful non-empty saves.
    pub fn saved_batches(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BatchId, Vec<Item>>> {
        self.batches.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl ItemSource for InMemoryRepository {
    async fn fetch_items(&self, batch: &BatchId) -> Result<Vec<Item>, SourceError> {
        self.items(batch)
            .ok_or_else(|| SourceError::BatchNotFound(batch.clone()))
    }
}

#[async_trait]
impl ItemSink for InMemoryRepository {
    async fn save(&self, batch: &BatchId, changes: &[ItemUpdate]) -> Result<(), SaveError> {
        if self.reject_saves.load(Ordering::SeqCst) {
            return Err(SaveError::Rejected {
                status: 503,
                message: "store is rejecting writes".to_string(),
            });
        }

        let mut batches = self.lock();
        let items = batches
            .get_mut(batch)
            .ok_or_else(|| SaveError::BatchNotFound(batch.clone()))?;

        if let Some(unknown) = changes
            .iter()
            .find(|change| !items.iter().any(|item| item.id == change.id))
        {
            return Err(SaveError::Rejected {
                status: 404,
                message: format!("item {} is not part of batch {batch}", unknown.id),
            });
        }

        for change in changes {
            if let Some(item) = items.iter_mut().find(|item| item.id == change.id) {
                item.row_coordinate = change.row_coordinate.clone();
                item.column_coordinate = change.column_coordinate;
            }
        }
        if !changes.is_empty() {
            self.saves.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_resource_document() {
        let body = json!({
            "data": [
                { "id": "i-1", "type": "pcr-batch-item",
                  "attributes": { "wellRow": "A", "wellColumn": 3, "name": "S-1" } },
                { "id": "i-2", "type": "pcr-batch-item", "attributes": { "wellRow": null } },
                { "id": "i-3", "type": "pcr-batch-item" }
            ],
            "meta": { "totalResourceCount": 3 }
        })
        .to_string();

        let items = parse_items(&body).unwrap();
        assert_eq!(items.len(), 3);
        assert_eq!(items[0].row_coordinate.as_deref(), Some("A"));
        assert_eq!(items[0].column_coordinate, Some(3));
        assert_eq!(items[0].name.as_deref(), Some("S-1"));
        assert_eq!(items[1].row_coordinate, None);
        assert_eq!(items[2].column_coordinate, None);
    }

    #[test]
    fn rejects_document_without_data() {
        assert!(matches!(parse_items("{}"), Err(SourceError::Json(_))));
    }

    #[test]
    fn operations_carry_explicit_nulls_for_cleared_wells() {
        let changes = vec![
            ItemUpdate {
                id: "i-1".into(),
                row_coordinate: Some("B".into()),
                column_coordinate: Some(4),
            },
            ItemUpdate {
                id: "i-2".into(),
                row_coordinate: None,
                column_coordinate: None,
            },
        ];

        let value = serde_json::to_value(build_operations("pcr-batch-item", &changes)).unwrap();
        assert_eq!(
            value,
            json!({
                "operations": [
                    { "op": "PATCH", "path": "pcr-batch-item",
                      "value": { "id": "i-1", "type": "pcr-batch-item",
                                 "attributes": { "wellRow": "B", "wellColumn": 4 } } },
                    { "op": "PATCH", "path": "pcr-batch-item",
                      "value": { "id": "i-2", "type": "pcr-batch-item",
                                 "attributes": { "wellRow": null, "wellColumn": null } } }
                ]
            })
        );
    }

    #[test]
    fn error_message_prefers_detail() {
        let body = json!({ "errors": [{ "status": "422", "title": "Invalid", "detail": "well taken" }] });
        assert_eq!(error_message(&body.to_string()), "well taken");
        assert_eq!(error_message("<html>"), "Unknown error");
    }

    #[test]
    fn client_builds_urls_and_query() {
        let client = JsonApiClient::new("https://lab.example/api/", Duration::from_secs(5))
            .unwrap()
            .with_page_limit(50);
        assert_eq!(client.items_url(), "https://lab.example/api/pcr-batch-item");
        assert_eq!(client.operations_url(), "https://lab.example/api/operations");

        let query = client.fetch_query(&BatchId::new("b-7"));
        assert_eq!(query[0], ("filter[rsql]", "pcrBatch.uuid==b-7".to_string()));
        assert_eq!(query[1], ("page[limit]", "50".to_string()));
    }

    #[test]
    fn custom_resource_changes_filter_field() {
        let client = JsonApiClient::new("http://store", Duration::from_secs(5))
            .unwrap()
            .with_resource("material-sample", "storageUnit.uuid");
        let query = client.fetch_query(&BatchId::new("box"));
        assert_eq!(query[0].1, "storageUnit.uuid==box");
        assert_eq!(client.items_url(), "http://store/material-sample");
    }

    #[tokio::test]
    async fn in_memory_save_applies_updates() {
        let repo = InMemoryRepository::new();
        let batch = BatchId::new("b");
        repo.insert_batch(batch.clone(), vec![Item::placed("a", "A", 1)]);

        repo.save(
            &batch,
            &[ItemUpdate {
                id: "a".into(),
                row_coordinate: None,
                column_coordinate: None,
            }],
        )
        .await
        .unwrap();

        let items = repo.fetch_items(&batch).await.unwrap();
        assert_eq!(items[0].row_coordinate, None);
        assert_eq!(repo.saved_batches(), 1);
    }

    #[tokio::test]
    async fn in_memory_save_is_all_or_nothing() {
        let repo = InMemoryRepository::new();
        let batch = BatchId::new("b");
        repo.insert_batch(batch.clone(), vec![Item::placed("a", "A", 1)]);

        let result = repo
            .save(
                &batch,
                &[
                    ItemUpdate {
                        id: "a".into(),
                        row_coordinate: None,
                        column_coordinate: None,
                    },
                    ItemUpdate {
                        id: "ghost".into(),
                        row_coordinate: Some("B".into()),
                        column_coordinate: Some(1),
                    },
                ],
            )
            .await;

        assert!(matches!(result, Err(SaveError::Rejected { status: 404, .. })));
        assert_eq!(repo.items(&batch).unwrap()[0].row_coordinate.as_deref(), Some("A"));
    }

    #[tokio::test]
    async fn unknown_batch_is_not_found() {
        let repo = InMemoryRepository::new();
        assert!(matches!(
            repo.fetch_items(&BatchId::new("nope")).await,
            Err(SourceError::BatchNotFound(_))
        ));
    }

    #[test]
    fn seed_json_populates_batches() {
        let seed = json!({ "b-1": [{ "id": "x", "rowCoordinate": "A", "columnCoordinate": 2 }] });
        let repo = InMemoryRepository::from_seed_json(&seed.to_string()).unwrap();
        assert_eq!(repo.batch_count(), 1);
        assert_eq!(repo.items(&BatchId::new("b-1")).unwrap()[0].column_coordinate, Some(2));
    }
}
