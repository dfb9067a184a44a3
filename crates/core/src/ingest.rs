use crate::chunking::{chunk_key, chunk_words};
use crate::embeddings::Embedder;
use crate::error::{EngineError, Result, Stage};
use crate::extractor::{secure_file_name, DocumentType, Extractor};
use crate::models::{ChunkRecord, DocumentVersion, IngestOutcome};
use crate::orchestrator::{require, DocumentEngine};
use crate::traits::{MetadataStore, SearchIndex};
use futures::stream::{self, StreamExt};
use tokio::time::timeout;
use tracing::{error, info, warn};

impl<M, S, E> DocumentEngine<M, S, E>
where
    M: MetadataStore,
    S: SearchIndex,
    E: Embedder,
{
    // Metadata first, then chunks. A chunk write failure leaves a listed
    // version with nothing indexed until `reindex_version` runs.
    pub async fn ingest(&self, owner_id: &str, file_name: &str, text: &str) -> Result<IngestOutcome> {
        require("owner_id", owner_id)?;
        require("file_name", file_name)?;

        let texts = chunk_words(text, self.config.chunking)?;
        let version = self.claim_version(owner_id, file_name, texts.len()).await?;

        let (chunks, unembedded) = self.embed_chunks(&version, texts).await;
        self.write_chunks(&version, &chunks).await?;

        info!(
            owner_id,
            file_name,
            document_id = %version.document_id,
            version = version.version,
            chunk_count = chunks.len(),
            unembedded,
            "document version ingested"
        );

        Ok(outcome(version, chunks.len(), unembedded))
    }

    pub async fn ingest_bytes<X>(
        &self,
        extractor: &X,
        owner_id: &str,
        file_name: &str,
        bytes: &[u8],
    ) -> Result<IngestOutcome>
    where
        X: Extractor + ?Sized,
    {
        require("owner_id", owner_id)?;
        let file_name = secure_file_name(file_name)?;
        let document_type = DocumentType::from_file_name(&file_name)?;

        let text = match timeout(
            self.config.call_timeout,
            extractor.extract(bytes, &document_type),
        )
        .await
        {
            Ok(extracted) => extracted?,
            Err(_) => {
                return Err(EngineError::Extraction(format!(
                    "{file_name} timed out after {:?}",
                    self.config.call_timeout
                )))
            }
        };

        self.ingest(owner_id, &file_name, &text).await
    }

    /// Rewrites the chunks of an existing version. Text that does not chunk
    /// to the recorded count is rejected.
    pub async fn reindex_version(
        &self,
        owner_id: &str,
        document_id: &str,
        version: u32,
        text: &str,
    ) -> Result<IngestOutcome> {
        let record = self.get_version(owner_id, document_id, version).await?;
        let texts = chunk_words(text, self.config.chunking)?;

        if texts.len() != record.chunk_count {
            return Err(EngineError::Validation(format!(
                "text yields {} chunks but version {version} of {document_id} recorded {}",
                texts.len(),
                record.chunk_count
            )));
        }

        let (chunks, unembedded) = self.embed_chunks(&record, texts).await;
        self.write_chunks(&record, &chunks).await?;

        info!(
            owner_id,
            document_id,
            version,
            chunk_count = chunks.len(),
            unembedded,
            "document version reindexed"
        );

        Ok(outcome(record, chunks.len(), unembedded))
    }

    /// Returns the records and how many ended up without a vector.
    pub(crate) async fn embed_chunks(
        &self,
        version: &DocumentVersion,
        texts: Vec<String>,
    ) -> (Vec<ChunkRecord>, usize) {
        let pending = texts.iter().cloned().enumerate().collect::<Vec<_>>();
        let embeddings = stream::iter(pending)
            .map(move |(sequence_index, text)| async move {
                match self.embed_bounded(&text).await {
                    Ok(vector) => Some(vector),
                    Err(embedding_error) => {
                        warn!(
                            document_id = %version.document_id,
                            version = version.version,
                            sequence_index,
                            error = %embedding_error,
                            "embedding failed; chunk indexed without a vector"
                        );
                        None
                    }
                }
            })
            .buffered(self.config.embedding_concurrency)
            .collect::<Vec<_>>()
            .await;

        let unembedded = embeddings.iter().filter(|vector| vector.is_none()).count();
        let chunks = texts
            .into_iter()
            .zip(embeddings)
            .enumerate()
            .map(|(sequence_index, (text, embedding))| ChunkRecord {
                chunk_key: chunk_key(&version.document_id, version.version, sequence_index),
                document_id: version.document_id.clone(),
                owner_id: version.owner_id.clone(),
                version: version.version,
                sequence_index,
                text,
                embedding,
                file_name: version.file_name.clone(),
                upload_timestamp: version.upload_timestamp,
            })
            .collect();

        (chunks, unembedded)
    }

    pub(crate) async fn write_chunks(
        &self,
        version: &DocumentVersion,
        chunks: &[ChunkRecord],
    ) -> Result<()> {
        let mut written = 0usize;
        for batch in chunks.chunks(self.config.page_size) {
            if let Err(write_error) = self
                .bounded(Stage::IndexChunks, self.index.upsert_chunks(batch))
                .await
            {
                error!(
                    owner_id = %version.owner_id,
                    document_id = %version.document_id,
                    version = version.version,
                    written,
                    expected = chunks.len(),
                    error = %write_error,
                    "version recorded but its chunks are not fully indexed; reindex required"
                );
                return Err(write_error);
            }
            written += batch.len();
        }
        Ok(())
    }
}

fn outcome(version: DocumentVersion, chunk_count: usize, unembedded: usize) -> IngestOutcome {
    let note = (unembedded > 0).then(|| {
        format!(
            "{unembedded} of {chunk_count} chunks have no embedding and match lexical queries only"
        )
    });

    IngestOutcome {
        version,
        chunk_count,
        unembedded_chunks: unembedded,
        note,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::ChunkingConfig;
    use crate::embeddings::CharacterNgramEmbedder;
    use crate::error::{EmbeddingError, StoreError};
    use crate::extractor::LocalExtractor;
    use crate::models::{ChunkFilter, EngineConfig};
    use crate::stores::{InMemoryMetadataStore, InMemorySearchIndex};
    use crate::traits::InsertOutcome;
    use async_trait::async_trait;

    fn config(size: usize, overlap: usize) -> EngineConfig {
        EngineConfig {
            chunking: ChunkingConfig { size, overlap },
            ..EngineConfig::default()
        }
    }

    /// Fails for any text containing "poison".
    struct PickyEmbedder;

    #[async_trait]
    impl Embedder for PickyEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed(&self, text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            if text.contains("poison") {
                Err(EmbeddingError::Response("rate limited".to_string()))
            } else {
                Ok(vec![1.0, 0.0, 0.0, 0.0])
            }
        }
    }

    #[tokio::test]
    async fn embedding_failures_degrade_instead_of_failing() {
        let engine = DocumentEngine::with_config(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            PickyEmbedder,
            config(2, 0),
        )
        .unwrap();

        let outcome = engine
            .ingest("alice", "a.txt", "clean words poison pill more text")
            .await
            .unwrap();

        assert_eq!(outcome.chunk_count, 3);
        assert_eq!(outcome.unembedded_chunks, 1);
        assert!(outcome.is_degraded());
        assert!(outcome.note.is_some());

        let chunks = engine
            .version_chunks("alice", &outcome.version.document_id, None)
            .await
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].embedding.is_none());
        assert!(chunks[0].embedding.is_some());
    }

    #[tokio::test]
    async fn empty_text_still_creates_a_version() {
        let engine = DocumentEngine::new(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
        );

        let outcome = engine.ingest("alice", "blank.txt", "  \n ").await.unwrap();
        assert_eq!(outcome.chunk_count, 0);
        assert_eq!(outcome.version.version, 1);
        assert!(outcome.note.is_none());
        assert!(engine.index.is_empty().await);
    }

    struct DownMetadata;

    #[async_trait]
    impl MetadataStore for DownMetadata {
        async fn insert_version(
            &self,
            _record: &DocumentVersion,
        ) -> std::result::Result<InsertOutcome, StoreError> {
            Err(StoreError::Request("connection refused".to_string()))
        }

        async fn versions_by_file_name(
            &self,
            _owner_id: &str,
            _file_name: &str,
        ) -> std::result::Result<Vec<DocumentVersion>, StoreError> {
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
    async fn metadata_failure_writes_no_chunks() {
        let engine = DocumentEngine::new(
            DownMetadata,
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
        );

        let error = engine
            .ingest("alice", "a.txt", "some words here")
            .await
            .unwrap_err();

        assert_eq!(error.stage(), Some(Stage::WriteMetadata));
        assert!(engine.index.is_empty().await);
    }

    #[tokio::test]
    async fn uploads_are_sanitized_and_extracted() {
        let engine = DocumentEngine::new(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
        );

        let outcome = engine
            .ingest_bytes(
                &LocalExtractor::default(),
                "alice",
                "../uploads/field notes.md",
                b"# Survey\n\nsoil samples",
            )
            .await
            .unwrap();
        assert_eq!(outcome.version.file_name, "field_notes.md");

        let error = engine
            .ingest_bytes(&LocalExtractor::default(), "alice", "tool.exe", b"MZ")
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::UnsupportedType(_)));
        assert_eq!(error.stage(), Some(Stage::Extract));
    }

    #[tokio::test]
    async fn reindex_restores_missing_chunks() {
        let engine = DocumentEngine::with_config(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            CharacterNgramEmbedder::default(),
            config(2, 0),
        )
        .unwrap();

        let text = "alpha beta gamma delta";
        let outcome = engine.ingest("alice", "a.txt", text).await.unwrap();
        let document_id = outcome.version.document_id.clone();

        let keys = engine
            .index
            .enumerate(&ChunkFilter::owner("alice"), None, 10)
            .await
            .unwrap()
            .into_iter()
            .map(|chunk| chunk.chunk_key)
            .collect::<Vec<_>>();
        engine.index.delete_chunks(&keys).await.unwrap();

        let repaired = engine
            .reindex_version("alice", &document_id, 1, text)
            .await
            .unwrap();
        assert_eq!(repaired.chunk_count, 2);
        assert_eq!(engine.index.len().await, 2);

        let mismatch = engine
            .reindex_version("alice", &document_id, 1, "alpha beta gamma delta epsilon")
            .await;
        assert!(matches!(mismatch, Err(EngineError::Validation(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ingestion_runs_on_spawned_tasks() {
        let engine = std::sync::Arc::new(
            DocumentEngine::with_config(
                InMemoryMetadataStore::new(),
                InMemorySearchIndex::new(),
                CharacterNgramEmbedder::default(),
                config(2, 0),
            )
            .unwrap(),
        );

        let ingesting = std::sync::Arc::clone(&engine);
        let outcome = tokio::spawn(async move {
            ingesting
                .ingest("alice", "spawned.txt", "one two three four")
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(outcome.chunk_count, 2);

        let document_id = outcome.version.document_id.clone();
        let reindexing = std::sync::Arc::clone(&engine);
        let repaired = tokio::spawn(async move {
            reindexing
                .reindex_version("alice", &document_id, 1, "one two three four")
                .await
        })
        .await
        .unwrap()
        .unwrap();
        assert_eq!(repaired.chunk_count, 2);
    }

    struct StalledEmbedder;

    #[async_trait]
    impl Embedder for StalledEmbedder {
        fn dimensions(&self) -> usize {
            4
        }

        async fn embed(&self, _text: &str) -> std::result::Result<Vec<f32>, EmbeddingError> {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(vec![1.0, 0.0, 0.0, 0.0])
        }
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_timeouts_degrade_the_chunk() {
        let engine = DocumentEngine::with_config(
            InMemoryMetadataStore::new(),
            InMemorySearchIndex::new(),
            StalledEmbedder,
            EngineConfig {
                call_timeout: std::time::Duration::from_millis(50),
                ..config(2, 0)
            },
        )
        .unwrap();

        let outcome = engine
            .ingest("alice", "slow.txt", "one two three")
            .await
            .unwrap();

        assert_eq!(outcome.chunk_count, 2);
        assert_eq!(outcome.unembedded_chunks, 2);
        let chunks = engine
            .version_chunks("alice", &outcome.version.document_id, None)
            .await
            .unwrap();
        assert!(chunks.iter().all(|chunk| chunk.embedding.is_none()));
    }
}
