use crate::embeddings::Embedder;
use crate::error::{EngineError, Result, Stage};
use crate::models::DocumentVersion;
use crate::orchestrator::{require, DocumentEngine};
use crate::traits::{InsertOutcome, MetadataStore, SearchIndex};
use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextVersion {
    pub document_id: Option<String>,
    pub version: u32,
}

impl NextVersion {
    pub fn from_existing(records: &[DocumentVersion]) -> Self {
        match records.iter().max_by_key(|record| record.version) {
            Some(latest) => Self {
                document_id: Some(latest.document_id.clone()),
                version: latest.version.saturating_add(1),
            },
            None => Self {
                document_id: None,
                version: 1,
            },
        }
    }
}

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    async fn read_next_version(&self, owner_id: &str, file_name: &str) -> Result<NextVersion> {
        let records = self
            .bounded(
                Stage::ResolveVersion,
                self.metadata.versions_by_file_name(owner_id, file_name),
            )
            .await?;
        Ok(NextVersion::from_existing(&records))
    }

    pub async fn resolve_next_version(&self, owner_id: &str, file_name: &str) -> Result<u32> {
        require("owner_id", owner_id)?;
        require("file_name", file_name)?;
        Ok(self.read_next_version(owner_id, file_name).await?.version)
    }

    // Insert-if-absent on (owner_id, file_name, version); a conflict re-reads.
    pub(crate) async fn claim_version(
        &self,
        owner_id: &str,
        file_name: &str,
        chunk_count: usize,
    ) -> Result<DocumentVersion> {
        let attempts = self.config.version_attempts;

        for attempt in 1..=attempts {
            let next = self.read_next_version(owner_id, file_name).await?;
            let record = DocumentVersion {
                document_id: next
                    .document_id
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
                owner_id: owner_id.to_string(),
                version: next.version,
                file_name: file_name.to_string(),
                upload_timestamp: Utc::now(),
                chunk_count,
            };

            let outcome = self
                .bounded(Stage::WriteMetadata, self.metadata.insert_version(&record))
                .await?;

            match outcome {
                InsertOutcome::Inserted => {
                    debug!(
                        owner_id,
                        file_name,
                        document_id = %record.document_id,
                        version = record.version,
                        attempt,
                        "version claimed"
                    );
                    return Ok(record);
                }
                InsertOutcome::Conflict => {
                    warn!(
                        owner_id,
                        file_name,
                        version = record.version,
                        attempt,
                        "version already taken by a concurrent upload"
                    );
                }
            }
        }

        Err(EngineError::VersionConflict {
            file_name: file_name.to_string(),
            attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::StoreError;
    use crate::models::EngineConfig;
    use crate::stores::{InMemoryMetadataStore, InMemorySearchIndex};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn record(document: &str, version: u32) -> DocumentVersion {
        DocumentVersion {
            document_id: document.to_string(),
            owner_id: "alice".to_string(),
            version,
            file_name: "a.txt".to_string(),
            upload_timestamp: Utc::now(),
            chunk_count: 0,
        }
    }

    #[test]
    fn first_upload_starts_at_one() {
        assert_eq!(
            NextVersion::from_existing(&[]),
            NextVersion {
                document_id: None,
                version: 1
            }
        );
    }

    #[test]
    fn sparse_versions_continue_from_the_maximum() {
        let next = NextVersion::from_existing(&[record("doc-1", 1), record("doc-1", 4)]);
        assert_eq!(next.version, 5);
        assert_eq!(next.document_id.as_deref(), Some("doc-1"));
    }

    #[derive(Default)]
    struct AlwaysTaken {
        reads: AtomicUsize,
    }

    #[async_trait]
    impl MetadataStore for AlwaysTaken {
        async fn insert_version(
            &self,
            _record: &DocumentVersion,
        ) -> std::result::Result<InsertOutcome, StoreError> {
            Ok(InsertOutcome::Conflict)
        }

        async fn versions_by_file_name(
            &self,
            _owner_id: &str,
            _file_name: &str,
        ) -> std::result::Result<Vec<DocumentVersion>, StoreError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn versions_by_document(
            &self,
            _document_id: &str,
        ) -> std::result::Result<Vec<DocumentVersion>, StoreError> {
            Ok(Vec::new())
        }

        async fn versions_by_owner(
            &self,
            _owner_id: &str,
        ) -> std::result::Result<Vec<DocumentVersion>, StoreError> {
            Ok(Vec::new())
        }

        async fn get_version(
            &self,
            _document_id: &str,
            _version: u32,
        ) -> std::result::Result<Option<DocumentVersion>, StoreError> {
            Ok(None)
        }

        async fn delete_version(
            &self,
            _record: &DocumentVersion,
        ) -> std::result::Result<bool, StoreError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn exhausted_retries_surface_a_conflict() {
        let engine = DocumentEngine::with_config(
            AlwaysTaken::default(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
            EngineConfig::default(),
        )
        .unwrap();

        let error = engine.claim_version("alice", "a.txt", 0).await.unwrap_err();
        assert!(matches!(
            error,
            EngineError::VersionConflict { attempts: 3, .. }
        ));
        assert_eq!(engine.metadata.reads.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn claims_reuse_the_document_id() {
        let engine = DocumentEngine::new(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
        );

        let first = engine.claim_version("alice", "a.txt", 2).await.unwrap();
        let second = engine.claim_version("alice", "a.txt", 3).await.unwrap();

        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(first.document_id, second.document_id);
        assert_eq!(engine.resolve_next_version("alice", "a.txt").await.unwrap(), 3);
        assert_eq!(engine.resolve_next_version("bob", "a.txt").await.unwrap(), 1);
    }
}
