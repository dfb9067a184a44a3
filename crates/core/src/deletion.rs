use crate::embeddings::Embedder;
use crate::error::{EngineError, Result, Stage};
use crate::models::{ChunkFilter, DeletionReport, DocumentVersion};
use crate::orchestrator::{require, DocumentEngine};
use crate::traits::{MetadataStore, SearchIndex};
use tracing::{error, info};

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    pub async fn delete_document(&self, owner_id: &str, document_id: &str) -> Result<DeletionReport> {
        require("owner_id", owner_id)?;
        require("document_id", document_id)?;

        let records = self.deletable_versions(owner_id, document_id, None).await?;
        let filter = ChunkFilter::owner(owner_id).document(document_id);
        self.cascade(owner_id, document_id, None, records, &filter)
            .await
    }

    pub async fn delete_version(
        &self,
        owner_id: &str,
        document_id: &str,
        version: u32,
    ) -> Result<DeletionReport> {
        require("owner_id", owner_id)?;
        require("document_id", document_id)?;

        let records = self
            .deletable_versions(owner_id, document_id, Some(version))
            .await?;
        let filter = ChunkFilter::owner(owner_id)
            .document(document_id)
            .version(version);
        self.cascade(owner_id, document_id, Some(version), records, &filter)
            .await
    }

    async fn deletable_versions(
        &self,
        owner_id: &str,
        document_id: &str,
        version: Option<u32>,
    ) -> Result<Vec<DocumentVersion>> {
        let records = self
            .bounded(
                Stage::ReadMetadata,
                self.metadata.versions_by_document(document_id),
            )
            .await?
            .into_iter()
            .filter(|record| version.map_or(true, |version| record.version == version))
            .collect::<Vec<_>>();

        if !records.is_empty() && records.iter().all(|record| record.owner_id != owner_id) {
            return Err(EngineError::Unauthorized(format!(
                "document {document_id} belongs to another owner"
            )));
        }

        Ok(records
            .into_iter()
            .filter(|record| record.owner_id == owner_id)
            .collect())
    }

    // Metadata first. Chunks that outlive a failed step are removed by a retry.
    async fn cascade(
        &self,
        owner_id: &str,
        document_id: &str,
        version: Option<u32>,
        records: Vec<DocumentVersion>,
        filter: &ChunkFilter,
    ) -> Result<DeletionReport> {
        let mut report = DeletionReport::default();

        for record in &records {
            if self
                .bounded(Stage::DeleteMetadata, self.metadata.delete_version(record))
                .await?
            {
                report.versions_removed += 1;
            }
        }

        let metadata_deleted = report.versions_removed > 0;
        match self.delete_indexed(filter).await {
            Ok(removed) => report.chunks_removed = removed,
            Err(chunk_error) => {
                if metadata_deleted {
                    error!(
                        owner_id,
                        document_id,
                        version,
                        error = %chunk_error,
                        "metadata deleted but chunks remain indexed; repeat the delete to remove them"
                    );
                }
                return Err(chunk_error);
            }
        }

        if report.versions_removed == 0 && report.chunks_removed == 0 {
            let target = match version {
                Some(version) => format!("document {document_id} version {version}"),
                None => format!("document {document_id}"),
            };
            return Err(EngineError::NotFound(target));
        }

        info!(
            owner_id,
            document_id,
            version,
            versions_removed = report.versions_removed,
            chunks_removed = report.chunks_removed,
            "document deleted"
        );
        Ok(report)
    }

    pub(crate) async fn delete_indexed(&self, filter: &ChunkFilter) -> Result<usize> {
        let keys = self
            .collect_chunks(filter)
            .await
            .map_err(|enumerate_error| match enumerate_error {
                EngineError::StoreUnavailable { source, .. } => {
                    EngineError::store(Stage::DeleteChunks, source)
                }
                other => other,
            })?
            .into_iter()
            .map(|chunk| chunk.chunk_key)
            .collect::<Vec<_>>();

        let mut removed = 0;
        for batch in keys.chunks(self.config.page_size) {
            removed += self
                .bounded(Stage::DeleteChunks, self.index.delete_chunks(batch))
                .await?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::models::EngineConfig;
    use crate::stores::{InMemoryMetadataStore, InMemorySearchIndex};

    fn engine() -> DocumentEngine<InMemoryMetadataStore, InMemorySearchIndex, CharacterNgramEmbedder>
    {
        DocumentEngine::with_config(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
            EngineConfig {
                chunking: ChunkingConfig {
                    size: 2,
                    overlap: 0,
                },
                ..EngineConfig::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn deleting_a_document_removes_every_version() {
        let engine = engine();
        let first = engine.ingest("alice", "a.txt", "one two three").await.unwrap();
        engine.ingest("alice", "a.txt", "four five").await.unwrap();
        let document_id = first.version.document_id;

        let report = engine.delete_document("alice", &document_id).await.unwrap();
        assert_eq!(
            report,
            DeletionReport {
                versions_removed: 2,
                chunks_removed: 3,
            }
        );
        assert!(engine.metadata.is_empty().await);
        assert!(engine.index.is_empty().await);

        assert!(matches!(
            engine.delete_document("alice", &document_id).await,
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deleting_a_version_keeps_the_others() {
        let engine = engine();
        let first = engine.ingest("alice", "a.txt", "one two three").await.unwrap();
        engine.ingest("alice", "a.txt", "four five").await.unwrap();
        let document_id = first.version.document_id;

        let report = engine
            .delete_version("alice", &document_id, 1)
            .await
            .unwrap();
        assert_eq!(report.versions_removed, 1);
        assert_eq!(report.chunks_removed, 2);

        let remaining = engine.list_versions("alice", &document_id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].version, 2);
        assert_eq!(engine.index.len().await, 1);
    }

    #[tokio::test]
    async fn another_owner_cannot_delete() {
        let engine = engine();
        let outcome = engine.ingest("alice", "a.txt", "one two").await.unwrap();

        assert!(matches!(
            engine
                .delete_document("bob", &outcome.version.document_id)
                .await,
            Err(EngineError::Unauthorized(_))
        ));
        assert_eq!(engine.metadata.len().await, 1);
        assert_eq!(engine.index.len().await, 1);
    }

    #[tokio::test]
    async fn leftover_chunks_are_removed_on_retry() {
        let engine = engine();
        let outcome = engine.ingest("alice", "a.txt", "one two three").await.unwrap();
        engine
            .metadata
            .delete_version(&outcome.version)
            .await
            .unwrap();

        let report = engine
            .delete_document("alice", &outcome.version.document_id)
            .await
            .unwrap();
        assert_eq!(report.versions_removed, 0);
        assert_eq!(report.chunks_removed, 2);
        assert!(engine.index.is_empty().await);
    }
}
