use crate::models::{ChunkFilter, ChunkHit, ChunkRecord, DocumentVersion, HybridQuery};
use crate::StoreError;
use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A record with the same `(owner_id, file_name, version)` already exists.
    Conflict,
}

#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Writes `record` unless one already exists for its
    /// `(owner_id, file_name, version)`.
    async fn insert_version(&self, record: &DocumentVersion) -> Result<InsertOutcome, StoreError>;

    async fn versions_by_file_name(
        &self,
        owner_id: &str,
        file_name: &str,
    ) -> Result<Vec<DocumentVersion>, StoreError>;

    /// All records of a document, whoever owns them.
    async fn versions_by_document(&self, document_id: &str)
        -> Result<Vec<DocumentVersion>, StoreError>;

    async fn versions_by_owner(&self, owner_id: &str) -> Result<Vec<DocumentVersion>, StoreError>;

    async fn get_version(
        &self,
        document_id: &str,
        version: u32,
    ) -> Result<Option<DocumentVersion>, StoreError>;

    async fn delete_version(&self, record: &DocumentVersion) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn upsert_chunks(&self, chunks: &[ChunkRecord]) -> Result<(), StoreError>;

    async fn delete_chunks(&self, chunk_keys: &[String]) -> Result<usize, StoreError>;

    /// Filter-only listing ordered by `chunk_key`, resuming after `after`.
    async fn enumerate(
        &self,
        filter: &ChunkFilter,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<ChunkRecord>, StoreError>;

    async fn hybrid_query(
        &self,
        query: &HybridQuery,
        query_vector: &[f32],
    ) -> Result<Vec<ChunkHit>, StoreError>;
}
