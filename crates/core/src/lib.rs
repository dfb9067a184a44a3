pub mod chunking;
pub mod deletion;
pub mod embeddings;
pub mod error;
pub mod extractor;
pub mod ingest;
pub mod models;
pub mod orchestrator;
pub mod reconcile;
pub mod retrieval;
pub mod stores;
pub mod traits;
pub mod versioning;

pub use chunking::{chunk_key, chunk_words, ChunkingConfig};
pub use embeddings::{CharacterNgramEmbedder, Embedder, HttpEmbedder, DEFAULT_EMBEDDING_DIMENSIONS};
pub use error::{EmbeddingError, EngineError, Result, Stage, StoreError};
pub use extractor::{
    discover_files, secure_file_name, DocumentType, Extractor, LayoutServiceExtractor,
    LocalExtractor,
};
pub use models::{
    ChunkFilter, ChunkHit, ChunkMetadata, ChunkRecord, DeletionReport, DocumentSummary,
    DocumentVersion, EngineConfig, HybridQuery, IngestOutcome, ReconcileReport, VersionGap,
};
pub use orchestrator::DocumentEngine;
pub use stores::{
    InMemoryMetadataStore, InMemorySearchIndex, OpenSearchClient, OpenSearchIndex,
    OpenSearchMetadataStore,
};
pub use traits::{InsertOutcome, MetadataStore, SearchIndex};
pub use versioning::NextVersion;
