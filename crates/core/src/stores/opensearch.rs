use crate::models::{ChunkFilter, ChunkHit, ChunkRecord, HybridQuery};
use crate::traits::SearchIndex;
use crate::StoreError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde_json::{json, Value};
use std::sync::Arc;
use url::Url;

const BACKEND: &str = "opensearch";

/// Shared HTTP plumbing for the OpenSearch-backed stores.
#[derive(Clone)]
pub struct OpenSearchClient {
    client: Arc<Client>,
    endpoint: Url,
}

impl OpenSearchClient {
    pub fn new(endpoint: &str) -> Result<Self, StoreError> {
        let mut endpoint = Url::parse(endpoint)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }

        Ok(Self {
            client: Arc::new(Client::new()),
            endpoint,
        })
    }

    pub(crate) fn http(&self) -> &Client {
        &self.client
    }

    pub(crate) fn url(&self, path: &str) -> Result<Url, StoreError> {
        Ok(self.endpoint.join(path)?)
    }

    pub(crate) async fn ensure_index(&self, index: &str, body: Value) -> Result<(), StoreError> {
        let response = self.client.head(self.url(index)?).send().await?;

        if response.status() == StatusCode::OK {
            return Ok(());
        }

        if !response.status().is_client_error() {
            return Err(backend_error(response.status().to_string()));
        }

        let response = self.client.put(self.url(index)?).json(&body).send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Request(format!(
                "index setup for {index} failed with {}",
                response.status()
            )));
        }

        Ok(())
    }

    pub(crate) async fn search(&self, index: &str, body: &Value) -> Result<Vec<Value>, StoreError> {
        let response = self
            .client
            .post(self.url(&format!("{index}/_search"))?)
            .json(body)
            .send()
            .await?;

        let response_json: Value = expect_success(response).await?.json().await?;
        Ok(response_json
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub(crate) async fn bulk(&self, operations: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        if operations.is_empty() {
            return Ok(Vec::new());
        }

        let payload: String = operations
            .into_iter()
            .map(|value| serde_json::to_string(&value))
            .collect::<Result<Vec<_>, serde_json::Error>>()?
            .join("\n")
            + "\n";

        let response = self
            .client
            .post(self.url("_bulk?refresh=wait_for")?)
            .header("Content-Type", "application/x-ndjson")
            .body(payload)
            .send()
            .await?;

        let response_json: Value = expect_success(response).await?.json().await?;
        Ok(response_json
            .pointer("/items")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

pub(crate) fn backend_error(details: impl Into<String>) -> StoreError {
    StoreError::BackendResponse {
        backend: BACKEND.to_string(),
        details: details.into(),
    }
}

pub(crate) async fn expect_success(response: Response) -> Result<Response, StoreError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(backend_error(format!("{status}: {body}")))
}

/// Chunk index with a `knn_vector` field for hybrid queries.
pub struct OpenSearchIndex {
    http: OpenSearchClient,
    index_name: String,
    dimensions: usize,
}

impl OpenSearchIndex {
    pub fn new(http: OpenSearchClient, index_name: impl Into<String>, dimensions: usize) -> Self {
        Self {
            http,
            index_name: index_name.into(),
            dimensions,
        }
    }

    pub async fn ensure_index(&self) -> Result<(), StoreError> {
        self.http
            .ensure_index(&self.index_name, index_body(self.dimensions))
            .await
    }
}

fn index_body(dimensions: usize) -> Value {
    json!({
        "settings": {
            "index": {
                "knn": true,
                "number_of_shards": 1,
                "number_of_replicas": 0
            }
        },
        "mappings": {
            "properties": {
                "chunk_key": {"type": "keyword"},
                "document_id": {"type": "keyword"},
                "owner_id": {"type": "keyword"},
                "version": {"type": "integer"},
                "sequence_index": {"type": "integer"},
                "text": {"type": "text", "analyzer": "standard"},
                "file_name": {"type": "keyword"},
                "upload_timestamp": {"type": "date"},
                "embedding": {
                    "type": "knn_vector",
                    "dimension": dimensions,
                    "method": {
                        "name": "hnsw",
                        "space_type": "cosinesimil",
                        "engine": "lucene"
                    }
                }
            }
        }
    })
}

fn build_filters(filter: &ChunkFilter) -> Vec<Value> {
    let mut predicates = vec![json!({"term": {"owner_id": filter.owner_id}})];

    if let Some(document_id) = &filter.document_id {
        predicates.push(json!({"term": {"document_id": document_id}}));
    }
    if let Some(version) = filter.version {
        predicates.push(json!({"term": {"version": version}}));
    }

    predicates
}

fn hybrid_body(query: &HybridQuery, query_vector: &[f32]) -> Value {
    let filters = build_filters(&query.filter());

    json!({
        "size": query.top_n,
        "_source": {"excludes": ["embedding"]},
        "query": {
            "bool": {
                "filter": filters,
                "should": [
                    {"match": {"text": {"query": query.text}}},
                    {
                        "knn": {
                            "embedding": {
                                "vector": query_vector,
                                "k": query.top_n,
                                "filter": {"bool": {"filter": filters}}
                            }
                        }
                    }
                ],
                "minimum_should_match": 1
            }
        }
    })
}

fn enumerate_body(filter: &ChunkFilter, after: Option<&str>, limit: usize) -> Value {
    let mut body = json!({
        "size": limit,
        "query": {"bool": {"filter": build_filters(filter)}},
        "sort": [{"chunk_key": "asc"}]
    });
    if let Some(after) = after {
        body["search_after"] = json!([after]);
    }
    body
}

fn parse_chunk(hit: &Value) -> Result<ChunkRecord, StoreError> {
    let source = hit
        .pointer("/_source")
        .cloned()
        .ok_or_else(|| backend_error("hit without _source"))?;
    Ok(serde_json::from_value(source)?)
}

fn count_results(items: &[Value], action: &str, result: &str) -> Result<usize, StoreError> {
    let mut matched = 0;
    for item in items {
        let outcome = item.pointer(&format!("/{action}/result")).and_then(Value::as_str);
        let status = item
            .pointer(&format!("/{action}/status"))
            .and_then(Value::as_u64)
            .unwrap_or_default();

        match outcome {
            Some(found) if found == result => matched += 1,
            Some("not_found") if action == "delete" => {}
            _ if status >= 300 => {
                let reason = item
                    .pointer(&format!("/{action}/error/reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("unknown bulk failure");
                return Err(backend_error(format!("bulk {action} failed: {reason}")));
            }
            _ => {}
        }
    }
    Ok(matched)
}

#[async_trait]
impl SearchIndex for OpenSearchIndex {
    async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StoreError> {
        let mut operations = Vec::with_capacity(chunks.len() * 2);
        for chunk in chunks {
            operations.push(json!({
                "index": {
                    "_index": self.index_name,
                    "_id": chunk.chunk_key,
                }
            }));
            operations.push(serde_json::to_value(chunk)?);
        }

        let items = self.http.bulk(operations).await?;
        for item in &items {
            let status = item
                .pointer("/index/status")
                .and_then(Value::as_u64)
                .unwrap_or_default();
            if status >= 300 {
                let reason = item
                    .pointer("/index/error/reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown bulk failure");
                return Err(backend_error(format!("bulk index failed: {reason}")));
            }
        }
        Ok(())
    }

    async fn delete_chunks(&self, chunk_keys: &[String]) -> Result<usize, StoreError> {
        let operations = chunk_keys
            .iter()
            .map(|key| json!({"delete": {"_index": self.index_name, "_id": key}}))
            .collect();

        let items = self.http.bulk(operations).await?;
        count_results(&items, "delete", "deleted")
    }

    async fn enumerate(
        &self,
        filter: &ChunkFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError> {
        let hits = self
            .http
            .search(&self.index_name, &enumerate_body(filter, after, limit))
            .await?;
        hits.iter().map(parse_chunk).collect()
    }

    async fn hybrid_query(
        &self,
        query: &HybridQuery,
        query_vector: &[f32],
    ) -> Result<Vec<ChunkHit>, StoreError> {
        if query_vector.len() != self.dimensions {
            return Err(StoreError::Request(format!(
                "query vector dim {} is not {}",
                query_vector.len(),
                self.dimensions
            )));
        }

        let hits = self
            .http
            .search(&self.index_name, &hybrid_body(query, query_vector))
            .await?;

        hits.iter()
            .map(|hit| {
                let score = hit.pointer("/_score").and_then(Value::as_f64).unwrap_or(0.0);
                parse_chunk(hit).map(|record| ChunkHit::from_record(&record, score))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_always_lead_with_owner() {
        let filters = build_filters(&ChunkFilter::owner("alice").document("doc-1").version(2));
        assert_eq!(filters[0], json!({"term": {"owner_id": "alice"}}));
        assert_eq!(filters.len(), 3);
    }

    #[test]
    fn hybrid_body_scopes_knn_clause_to_owner() {
        let query = HybridQuery::new("alice", "pump pressure", 4);
        let body = hybrid_body(&query, &[0.1, 0.2]);

        assert_eq!(body["size"], json!(4));
        assert_eq!(
            body.pointer("/query/bool/filter/0/term/owner_id"),
            Some(&json!("alice"))
        );
        assert_eq!(
            body.pointer("/query/bool/should/1/knn/embedding/filter/bool/filter/0/term/owner_id"),
            Some(&json!("alice"))
        );
        assert_eq!(
            body.pointer("/query/bool/should/1/knn/embedding/k"),
            Some(&json!(4))
        );
    }

    #[test]
    fn enumeration_resumes_after_cursor() {
        let body = enumerate_body(&ChunkFilter::owner("alice"), Some("doc_1_4"), 50);
        assert_eq!(body["search_after"], json!(["doc_1_4"]));
        assert!(enumerate_body(&ChunkFilter::owner("alice"), None, 50)
            .get("search_after")
            .is_none());
    }

    #[test]
    fn bulk_delete_counts_only_removed_items() {
        let items = vec![
            json!({"delete": {"_id": "a", "result": "deleted", "status": 200}}),
            json!({"delete": {"_id": "b", "result": "not_found", "status": 404}}),
        ];
        assert_eq!(count_results(&items, "delete", "deleted").unwrap(), 1);

        let failed = vec![json!({"delete": {"_id": "c", "status": 503, "error": {"reason": "shard unavailable"}}})];
        assert!(count_results(&failed, "delete", "deleted").is_err());
    }

    #[test]
    fn endpoint_without_trailing_slash_keeps_prefix() {
        let client = OpenSearchClient::new("http://localhost:9200/search").unwrap();
        assert_eq!(
            client.url("chunks/_search").unwrap().as_str(),
            "http://localhost:9200/search/chunks/_search"
        );
    }
}
