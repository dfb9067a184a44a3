use crate::chunking::ChunkingConfig;
use crate::error::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// One successful upload of a document. Authoritative record in the metadata store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentVersion {
    pub document_id: String,
    pub owner_id: String,
    pub version: u32,
    pub file_name: String,
    pub upload_timestamp: DateTime<Utc>,
    pub chunk_count: usize,
}

impl DocumentVersion {
    pub fn chunk_filter(&self) -> ChunkFilter {
        ChunkFilter::owner(&self.owner_id)
            .document(&self.document_id)
            .version(self.version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkRecord {
    pub chunk_key: String,
    pub document_id: String,
    pub owner_id: String,
    pub version: u32,
    pub sequence_index: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    pub file_name: String,
    pub upload_timestamp: DateTime<Utc>,
}

/// Equality filter over indexed chunks. The owner is never optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ChunkFilter {
    pub owner_id: String,
    pub document_id: Option<String>,
    pub version: Option<u32>,
}

impl ChunkFilter {
    pub fn owner(owner_id: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            document_id: None,
            version: None,
        }
    }

    pub fn document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn version(mut self, version: u32) -> Self {
        self.version = Some(version);
        self
    }

    pub fn matches(&self, chunk: &ChunkRecord) -> bool {
        chunk.owner_id == self.owner_id
            && self
                .document_id
                .as_ref()
                .map_or(true, |document_id| &chunk.document_id == document_id)
            && self.version.map_or(true, |version| chunk.version == version)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct HybridQuery {
    pub owner_id: String,
    pub text: String,
    pub top_n: usize,
    pub document_id: Option<String>,
    pub version: Option<u32>,
}

impl HybridQuery {
    pub fn new(owner_id: impl Into<String>, text: impl Into<String>, top_n: usize) -> Self {
        Self {
            owner_id: owner_id.into(),
            text: text.into(),
            top_n,
            document_id: None,
            version: None,
        }
    }

    pub fn filter(&self) -> ChunkFilter {
        ChunkFilter {
            owner_id: self.owner_id.clone(),
            document_id: self.document_id.clone(),
            version: self.version,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMetadata {
    pub file_name: String,
    pub chunk_sequence: usize,
    pub upload_timestamp: DateTime<Utc>,
    pub version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkHit {
    pub chunk_key: String,
    pub document_id: String,
    pub owner_id: String,
    pub text: String,
    pub score: f64,
    pub metadata: ChunkMetadata,
}

impl ChunkHit {
    pub fn from_record(record: &ChunkRecord, score: f64) -> Self {
        Self {
            chunk_key: record.chunk_key.clone(),
            document_id: record.document_id.clone(),
            owner_id: record.owner_id.clone(),
            text: record.text.clone(),
            score,
            metadata: ChunkMetadata {
                file_name: record.file_name.clone(),
                chunk_sequence: record.sequence_index,
                upload_timestamp: record.upload_timestamp,
                version: record.version,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestOutcome {
    pub version: DocumentVersion,
    pub chunk_count: usize,
    pub unembedded_chunks: usize,
    pub note: Option<String>,
}

impl IngestOutcome {
    pub fn is_degraded(&self) -> bool {
        self.unembedded_chunks > 0
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DocumentSummary {
    pub document_id: String,
    pub file_name: String,
    pub latest_version: u32,
    pub version_count: usize,
    pub upload_timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeletionReport {
    pub versions_removed: usize,
    pub chunks_removed: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct VersionGap {
    pub document_id: String,
    pub version: u32,
    pub expected_chunks: usize,
    pub indexed_chunks: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReconcileReport {
    pub versions_checked: usize,
    pub missing_chunks: Vec<VersionGap>,
    pub orphaned_chunks: Vec<String>,
    pub orphaned_chunks_removed: usize,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_chunks.is_empty() && self.orphaned_chunks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub chunking: ChunkingConfig,
    pub version_attempts: usize,
    pub embedding_concurrency: usize,
    pub call_timeout: Duration,
    pub default_top_n: usize,
    pub page_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkingConfig::default(),
            version_attempts: 3,
            embedding_concurrency: 4,
            call_timeout: Duration::from_secs(30),
            default_top_n: 5,
            page_size: 500,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        self.chunking.validate()?;

        if self.version_attempts == 0 {
            return Err(EngineError::Validation(
                "version_attempts must be at least 1".to_string(),
            ));
        }
        if self.embedding_concurrency == 0 {
            return Err(EngineError::Validation(
                "embedding_concurrency must be at least 1".to_string(),
            ));
        }
        if self.page_size == 0 {
            return Err(EngineError::Validation(
                "page_size must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}
