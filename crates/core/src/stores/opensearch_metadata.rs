use super::opensearch::{backend_error, expect_success, OpenSearchClient};
use crate::models::DocumentVersion;
use crate::traits::{InsertOutcome, MetadataStore};
use crate::StoreError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const MAX_RECORDS: usize = 10_000;

pub struct OpenSearchMetadataStore {
    http: OpenSearchClient,
    index_name: String,
}

impl OpenSearchMetadataStore {
    pub fn new(http: OpenSearchClient, index_name: impl Into<String>) -> Self {
        Self {
            http,
            index_name: index_name.into(),
        }
    }

    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        self.http
            .ensure_index(
                &self.index_name,
                json!({
                    "settings": {
                        "number_of_shards": 1,
                        "number_of_replicas": 0
                    },
                    "mappings": {
                        "properties": {
                            "document_id": {"type": "keyword"},
                            "owner_id": {"type": "keyword"},
                            "file_name": {"type": "keyword"},
                            "version": {"type": "integer"},
                            "upload_timestamp": {"type": "date"},
                            "chunk_count": {"type": "integer"}
                        }
                    }
                }),
            )
            .await
    }

    async fn query(&self, filters: Vec<Value>) -> Result<Vec<DocumentVersion>, StoreError> {
        let body = json!({
            "size": MAX_RECORDS,
            "query": {"bool": {"filter": filters}},
            "sort": [{"document_id": "asc"}, {"version": "asc"}]
        });

        self.http
            .search(&self.index_name, &body)
            .await?
            .iter()
            .map(|hit| {
                let source = hit
                    .pointer("/_source")
                    .cloned()
                    .ok_or_else(|| backend_error("hit without _source"))?;
                Ok(serde_json::from_value(source)?)
            })
            .collect()
    }
}

/// Deterministic document id for the conditional-write key.
pub fn record_id(owner_id: &str, file_name: &str, version: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(owner_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(file_name.as_bytes());
    hasher.update([0u8]);
    hasher.update(version.to_le_bytes());
    format!("{:x}", hasher.finalize())
}

#[async_trait]
impl MetadataStore for OpenSearchMetadataStore {
    async fn insert_version(&self, record: &DocumentVersion) -> Result<InsertOutcome, StoreError> {
        let id = record_id(&record.owner_id, &record.file_name, record.version);
        let response = self
            .http
            .http()
            .put(
                self.http
                    .url(&format!("{}/_create/{id}?refresh=wait_for", self.index_name))?,
            )
            .json(record)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(InsertOutcome::Conflict);
        }
        expect_success(response).await?;
        Ok(InsertOutcome::Inserted)
    }

    async fn versions_by_file_name(
        &self,
        owner_id: &str,
        file_name: &str,
    ) -> Result<Vec<DocumentVersion>, StoreError> {
        self.query(vec![
            json!({"term": {"owner_id": owner_id}}),
            json!({"term": {"file_name": file_name}}),
        ])
        .await
    }

    async fn versions_by_document(
        &self,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>, StoreError> {
        self.query(vec![json!({"term": {"document_id": document_id}})])
            .await
    }

    async fn versions_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentVersion>, StoreError> {
        self.query(vec![json!({"term": {"owner_id": owner_id}})]).await
    }

    async fn get_version(
        &self,
        document_id: &str,
        version: u32,
    ) -> Result<Option<DocumentVersion>, StoreError> {
        let records = self
            .query(vec![
                json!({"term": {"document_id": document_id}}),
                json!({"term": {"version": version}}),
            ])
            .await?;
        Ok(records.into_iter().next())
    }

    async fn delete_version(&self, record: &DocumentVersion) -> Result<bool, StoreError> {
        let id = record_id(&record.owner_id, &record.file_name, record.version);
        let response = self
            .http
            .http()
            .delete(
                self.http
                    .url(&format!("{}/_doc/{id}?refresh=wait_for", self.index_name))?,
            )
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(false);
        }
        expect_success(response).await?;
        Ok(true)
    }
}
