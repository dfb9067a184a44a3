use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use docvault_core::{
    discover_files, CharacterNgramEmbedder, ChunkingConfig, DocumentEngine, DocumentType,
    Embedder, EngineConfig, Extractor, HttpEmbedder, HybridQuery, LayoutServiceExtractor,
    LocalExtractor, OpenSearchClient, OpenSearchIndex, OpenSearchMetadataStore,
    DEFAULT_EMBEDDING_DIMENSIONS,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

type Engine<E> = DocumentEngine<OpenSearchMetadataStore, OpenSearchIndex, E>;

#[derive(Parser)]
#[command(name = "docvault", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OpenSearch base URL
    #[arg(long, env = "DOCVAULT_OPENSEARCH_URL", default_value = "http://localhost:9200")]
    opensearch_url: String,

    /// Index holding chunk records
    #[arg(long, env = "DOCVAULT_CHUNK_INDEX", default_value = "docvault_chunks")]
    chunk_index: String,

    /// Index holding document version records
    #[arg(long, env = "DOCVAULT_METADATA_INDEX", default_value = "docvault_versions")]
    metadata_index: String,

    /// OpenAI-compatible embeddings endpoint. Hashed n-grams are used when unset.
    #[arg(long, env = "DOCVAULT_EMBEDDING_URL")]
    embedding_url: Option<String>,

    #[arg(long, env = "DOCVAULT_EMBEDDING_MODEL", default_value = "text-embedding-3-small")]
    embedding_model: String,

    #[arg(long, env = "DOCVAULT_EMBEDDING_API_KEY", hide_env_values = true)]
    embedding_api_key: Option<String>,

    #[arg(long, env = "DOCVAULT_EMBEDDING_DIMENSIONS", default_value_t = DEFAULT_EMBEDDING_DIMENSIONS)]
    embedding_dimensions: usize,

    /// Layout extraction service for office documents and images
    #[arg(long, env = "DOCVAULT_LAYOUT_URL")]
    layout_url: Option<String>,

    #[arg(long, env = "DOCVAULT_LAYOUT_API_KEY", hide_env_values = true)]
    layout_api_key: Option<String>,

    /// Words per chunk
    #[arg(long, env = "DOCVAULT_CHUNK_SIZE", default_value_t = 500)]
    chunk_size: usize,

    /// Words shared by consecutive chunks; must be smaller than the chunk size
    #[arg(long, env = "DOCVAULT_CHUNK_OVERLAP", default_value_t = 50)]
    chunk_overlap: usize,

    /// Timeout for each store, embedding, and extraction call
    #[arg(long, env = "DOCVAULT_TIMEOUT_SECS", default_value_t = 30)]
    timeout_secs: u64,

    /// Attempts at claiming a version number before giving up
    #[arg(long, env = "DOCVAULT_VERSION_ATTEMPTS", default_value_t = 3)]
    version_attempts: usize,

    /// Chunks embedded in parallel during one ingestion
    #[arg(long, env = "DOCVAULT_EMBEDDING_CONCURRENCY", default_value_t = 4)]
    embedding_concurrency: usize,
}

#[derive(Subcommand)]
enum Command {
    /// Create both indices if they do not exist.
    Setup,
    /// Ingest a file, or every supported file under a folder, as new versions.
    Ingest {
        #[arg(long)]
        owner: String,
        /// File or folder to ingest.
        #[arg(long)]
        path: PathBuf,
        /// Stored file name for a single file. Defaults to the file's own name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Hybrid lexical and vector search over the owner's chunks.
    Search {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        query: String,
        /// Results to return. Defaults to the engine's default_top_n.
        #[arg(long)]
        top_n: Option<usize>,
        /// Restrict to one document.
        #[arg(long)]
        document: Option<String>,
        /// Restrict to one version; requires --document.
        #[arg(long, requires = "document")]
        version: Option<u32>,
    },
    /// List the owner's documents with their latest version.
    Documents {
        #[arg(long)]
        owner: String,
    },
    /// List every version of a document.
    Versions {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        document: String,
    },
    /// Print the chunks of a version, the latest by default.
    Chunks {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        document: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Delete a document, or a single version of it.
    Delete {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        document: String,
        #[arg(long)]
        version: Option<u32>,
    },
    /// Compare version records with indexed chunks.
    Reconcile {
        #[arg(long)]
        owner: String,
        /// Delete chunks no version record accounts for.
        #[arg(long, default_value_t = false)]
        repair: bool,
    },
    /// Re-extract a version's source file and rewrite its chunks.
    Reindex {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        document: String,
        #[arg(long)]
        version: u32,
        #[arg(long)]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .init();

    let cli = Cli::parse();
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        "docvault boot"
    );

    match cli.embedding_url.clone() {
        Some(endpoint) => {
            let embedder = HttpEmbedder::new(
                endpoint,
                cli.embedding_model.clone(),
                cli.embedding_api_key.clone(),
                cli.embedding_dimensions,
            );
            run(cli, embedder).await
        }
        None => {
            let embedder = CharacterNgramEmbedder {
                dimensions: cli.embedding_dimensions,
            };
            run(cli, embedder).await
        }
    }
}

async fn run<E: Embedder>(cli: Cli, embedder: E) -> anyhow::Result<()> {
    let dimensions = embedder.dimensions();
    let http = OpenSearchClient::new(&cli.opensearch_url)?;
    let metadata = OpenSearchMetadataStore::new(http.clone(), cli.metadata_index.clone());
    let index = OpenSearchIndex::new(http, cli.chunk_index.clone(), dimensions);

    let config = EngineConfig {
        chunking: ChunkingConfig::new(cli.chunk_size, cli.chunk_overlap)?,
        version_attempts: cli.version_attempts,
        embedding_concurrency: cli.embedding_concurrency,
        call_timeout: Duration::from_secs(cli.timeout_secs),
        ..EngineConfig::default()
    };
    let engine = DocumentEngine::with_config(metadata, index, embedder, config)?;

    let extractor = match cli.layout_url.clone() {
        Some(endpoint) => LocalExtractor::with_layout_service(LayoutServiceExtractor::new(
            endpoint,
            cli.layout_api_key.clone(),
        )),
        None => LocalExtractor::default(),
    };

    match cli.command {
        Command::Setup => {
            engine.metadata().ensure_index().await?;
            engine.index().ensure_index().await?;
            println!(
                "indices ready: {} {} (dimensions={dimensions})",
                cli.metadata_index, cli.chunk_index
            );
        }
        Command::Ingest { owner, path, name } => {
            if path.is_dir() {
                ingest_folder(&engine, &extractor, &owner, &path).await?;
            } else {
                let file_name = match name {
                    Some(name) => name,
                    None => display_name(&path),
                };
                let bytes = tokio::fs::read(&path)
                    .await
                    .with_context(|| format!("reading {}", path.display()))?;
                let outcome = engine
                    .ingest_bytes(&extractor, &owner, &file_name, &bytes)
                    .await?;
                println!(
                    "document_id={} version={} chunks={}",
                    outcome.version.document_id, outcome.version.version, outcome.chunk_count
                );
                if let Some(note) = outcome.note {
                    println!("  note: {note}");
                }
            }
        }
        Command::Search {
            owner,
            query,
            top_n,
            document,
            version,
        } => {
            let top_n = top_n.unwrap_or(engine.config().default_top_n);
            let mut request = HybridQuery::new(owner, query, top_n);
            request.document_id = document;
            request.version = version;

            let hits = engine.search(&request).await?;
            println!("query: {}", request.text);
            for hit in hits {
                println!(
                    "score={:.4} chunk={} file={} version={} sequence={}",
                    hit.score,
                    hit.chunk_key,
                    hit.metadata.file_name,
                    hit.metadata.version,
                    hit.metadata.chunk_sequence
                );
                println!("  {}", hit.text);
            }
        }
        Command::Documents { owner } => {
            for summary in engine.list_documents(&owner).await? {
                println!(
                    "{} {} latest={} versions={} uploaded={}",
                    summary.document_id,
                    summary.file_name,
                    summary.latest_version,
                    summary.version_count,
                    summary.upload_timestamp.to_rfc3339()
                );
            }
        }
        Command::Versions { owner, document } => {
            for record in engine.list_versions(&owner, &document).await? {
                println!(
                    "version={} file={} chunks={} uploaded={}",
                    record.version,
                    record.file_name,
                    record.chunk_count,
                    record.upload_timestamp.to_rfc3339()
                );
            }
        }
        Command::Chunks {
            owner,
            document,
            version,
        } => {
            for chunk in engine.version_chunks(&owner, &document, version).await? {
                let embedded = if chunk.embedding.is_some() { "" } else { " (no vector)" };
                println!("[{}]{embedded}\n{}", chunk.sequence_index, chunk.text);
            }
        }
        Command::Delete {
            owner,
            document,
            version,
        } => {
            let report = match version {
                Some(version) => engine.delete_version(&owner, &document, version).await?,
                None => engine.delete_document(&owner, &document).await?,
            };
            println!(
                "versions_removed={} chunks_removed={}",
                report.versions_removed, report.chunks_removed
            );
        }
        Command::Reconcile { owner, repair } => {
            let report = engine.reconcile(&owner, repair).await?;
            println!("versions_checked={}", report.versions_checked);
            for gap in &report.missing_chunks {
                println!(
                    "missing: document_id={} version={} indexed={}/{}",
                    gap.document_id, gap.version, gap.indexed_chunks, gap.expected_chunks
                );
            }
            for chunk_key in &report.orphaned_chunks {
                println!("orphaned: {chunk_key}");
            }
            if repair {
                println!("orphaned_removed={}", report.orphaned_chunks_removed);
            }
            if report.is_consistent() {
                println!("consistent");
            }
        }
        Command::Reindex {
            owner,
            document,
            version,
            path,
        } => {
            let bytes = tokio::fs::read(&path)
                .await
                .with_context(|| format!("reading {}", path.display()))?;
            let document_type = DocumentType::from_file_name(&display_name(&path))?;
            let text = extractor.extract(&bytes, &document_type).await?;
            let outcome = engine
                .reindex_version(&owner, &document, version, &text)
                .await?;
            println!(
                "reindexed document_id={} version={} chunks={}",
                outcome.version.document_id, outcome.version.version, outcome.chunk_count
            );
        }
    }

    Ok(())
}

/// Ingests every supported file under `folder`, skipping files that fail.
async fn ingest_folder<E: Embedder>(
    engine: &Engine<E>,
    extractor: &LocalExtractor,
    owner: &str,
    folder: &Path,
) -> anyhow::Result<()> {
    let files = discover_files(folder);
    let mut ingested = 0usize;
    let mut skipped = 0usize;

    for path in &files {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(path = %path.display(), reason = %error, "skipped file");
                skipped += 1;
                continue;
            }
        };

        match engine
            .ingest_bytes(extractor, owner, &display_name(path), &bytes)
            .await
        {
            Ok(outcome) => {
                ingested += 1;
                println!(
                    "{} -> document_id={} version={} chunks={}",
                    path.display(),
                    outcome.version.document_id,
                    outcome.version.version,
                    outcome.chunk_count
                );
            }
            Err(error) => {
                warn!(path = %path.display(), reason = %error, stage = ?error.stage(), "skipped file");
                skipped += 1;
            }
        }
    }

    info!(folder = %folder.display(), ingested, skipped, "folder ingestion finished");
    println!(
        "{ingested} of {} files ingested at {}",
        files.len(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
