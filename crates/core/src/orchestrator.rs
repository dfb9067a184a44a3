use crate::embeddings::Embedder;
use crate::error::{EmbeddingError, EngineError, Result, Stage, StoreError};
use crate::models::{ChunkFilter, ChunkRecord, DocumentSummary, DocumentVersion, EngineConfig};
use crate::traits::{MetadataStore, SearchIndex};
use std::collections::BTreeMap;
use std::future::Future;
use tokio::time::timeout;

/// The metadata store is the source of truth for versions; the index is
/// derived from it and may diverge after a partial failure.
pub struct DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    pub(crate) metadata: M,
    pub(crate) index: S,
    pub(crate) embedder: E,
    pub(crate) config: EngineConfig,
}

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    pub fn new(metadata: M, index: S, embedder: E) -> Self {
        Self {
            metadata,
            index,
            embedder,
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(metadata: M, index: S, embedder: E, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            metadata,
            index,
            embedder,
            config,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn metadata(&self) -> &M {
        &self.metadata
    }

    pub fn index(&self) -> &S {
        &self.index
    }

    pub(crate) async fn bounded<T, F>(&self, stage: Stage, call: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, StoreError>>,
    {
        match timeout(self.config.call_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(EngineError::store(stage, error)),
            Err(_) => Err(EngineError::store(
                stage,
                StoreError::Timeout(self.config.call_timeout),
            )),
        }
    }

    pub(crate) async fn embed_bounded(
        &self,
        text: &str,
    ) -> std::result::Result<Vec<f32>, EmbeddingError> {
        match timeout(self.config.call_timeout, self.embedder.embed(text)).await {
            Ok(result) => result,
            Err(_) => Err(EmbeddingError::Timeout(self.config.call_timeout)),
        }
    }

    pub(crate) async fn owned_versions(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>> {
        require("owner_id", owner_id)?;
        require("document_id", document_id)?;

        let records = self
            .bounded(
                Stage::ReadMetadata,
                self.metadata.versions_by_document(document_id),
            )
            .await?;

        if records.is_empty() {
            return Err(EngineError::NotFound(format!("document {document_id}")));
        }

        let mut owned = records
            .into_iter()
            .filter(|record| record.owner_id == owner_id)
            .collect::<Vec<_>>();

        if owned.is_empty() {
            return Err(EngineError::Unauthorized(format!(
                "document {document_id} belongs to another owner"
            )));
        }

        owned.sort_by_key(|record| record.version);
        Ok(owned)
    }

    pub(crate) async fn collect_chunks(&self, filter: &ChunkFilter) -> Result<Vec<ChunkRecord>> {
        let mut collected = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .bounded(
                    Stage::EnumerateChunks,
                    self.index
                        .enumerate(filter, cursor.as_deref(), self.config.page_size),
                )
                .await?;

            let exhausted = page.len() < self.config.page_size;
            cursor = page.last().map(|chunk| chunk.chunk_key.clone());
            collected.extend(page);

            if exhausted || cursor.is_none() {
                break;
            }
        }

        Ok(collected)
    }

    /// Empty when the document has no records, including after a full delete.
    pub async fn list_versions(
        &self,
        owner_id: &str,
        document_id: &str,
    ) -> Result<Vec<DocumentVersion>> {
        match self.owned_versions(owner_id, document_id).await {
            Err(EngineError::NotFound(_)) => Ok(Vec::new()),
            listed => listed,
        }
    }

    pub async fn get_version(
        &self,
        owner_id: &str,
        document_id: &str,
        version: u32,
    ) -> Result<DocumentVersion> {
        require("owner_id", owner_id)?;
        require("document_id", document_id)?;

        let record = self
            .bounded(
                Stage::ReadMetadata,
                self.metadata.get_version(document_id, version),
            )
            .await?
            .ok_or_else(|| {
                EngineError::NotFound(format!("document {document_id} version {version}"))
            })?;

        if record.owner_id != owner_id {
            return Err(EngineError::Unauthorized(format!(
                "document {document_id} belongs to another owner"
            )));
        }

        Ok(record)
    }

    /// The record with the highest version number. Timestamps play no part.
    pub async fn latest_version(&self, owner_id: &str, document_id: &str) -> Result<DocumentVersion> {
        self.owned_versions(owner_id, document_id)
            .await?
            .into_iter()
            .max_by_key(|record| record.version)
            .ok_or_else(|| EngineError::NotFound(format!("document {document_id}")))
    }

    /// Chunks of `version`, or of the latest version when `None`, in
    /// sequence order.
    pub async fn version_chunks(
        &self,
        owner_id: &str,
        document_id: &str,
        version: Option<u32>,
    ) -> Result<Vec<ChunkRecord>> {
        let record = match version {
            Some(version) => self.get_version(owner_id, document_id, version).await?,
            None => self.latest_version(owner_id, document_id).await?,
        };

        let mut chunks = self
            .collect_chunks(&record.chunk_filter())
            .await?
            .into_iter()
            .filter(|chunk| chunk.sequence_index < record.chunk_count)
            .collect::<Vec<_>>();
        chunks.sort_by_key(|chunk| chunk.sequence_index);
        Ok(chunks)
    }

    pub async fn list_documents(&self, owner_id: &str) -> Result<Vec<DocumentSummary>> {
        require("owner_id", owner_id)?;

        let records = self
            .bounded(Stage::ReadMetadata, self.metadata.versions_by_owner(owner_id))
            .await?;

        let mut grouped = BTreeMap::<String, Vec<DocumentVersion>>::new();
        for record in records
            .into_iter()
            .filter(|record| record.owner_id == owner_id)
        {
            grouped
                .entry(record.document_id.clone())
                .or_default()
                .push(record);
        }

        let mut summaries = grouped
            .into_values()
            .filter_map(|versions| {
                let version_count = versions.len();
                versions
                    .into_iter()
                    .max_by_key(|record| record.version)
                    .map(|latest| DocumentSummary {
                        document_id: latest.document_id,
                        file_name: latest.file_name,
                        latest_version: latest.version,
                        version_count,
                        upload_timestamp: latest.upload_timestamp,
                    })
            })
            .collect::<Vec<_>>();

        summaries.sort_by(|left, right| {
            left.file_name
                .cmp(&right.file_name)
                .then(left.document_id.cmp(&right.document_id))
        });
        Ok(summaries)
    }
}

/// Rejects a blank identifier before any store is touched.
pub(crate) fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(EngineError::Validation(format!("{field} is required")));
    }
    Ok(())
}
