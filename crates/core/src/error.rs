use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid response from {backend}: {details}")]
    BackendResponse { backend: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store request failed: {0}")]
    Request(String),

    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum EmbeddingError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid embedding response: {0}")]
    Response(String),

    #[error("embedding has {actual} dimensions, expected {expected}")]
    Dimension { expected: usize, actual: usize },

    #[error("embedding call timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Extract,
    ResolveVersion,
    WriteMetadata,
    IndexChunks,
    Query,
    ReadMetadata,
    DeleteMetadata,
    DeleteChunks,
    EnumerateChunks,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Extract => "extract",
            Stage::ResolveVersion => "resolve version",
            Stage::WriteMetadata => "write metadata",
            Stage::IndexChunks => "index chunks",
            Stage::Query => "query",
            Stage::ReadMetadata => "read metadata",
            Stage::DeleteMetadata => "delete metadata",
            Stage::DeleteChunks => "delete chunks",
            Stage::EnumerateChunks => "enumerate chunks",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("unsupported document type: {0}")]
    UnsupportedType(String),

    #[error("extraction failed: {0}")]
    Extraction(String),

    #[error("embedding unavailable: {0}")]
    EmbeddingUnavailable(#[source] EmbeddingError),

    #[error("version conflict for {file_name} after {attempts} attempts")]
    VersionConflict { file_name: String, attempts: usize },

    #[error("store unavailable during {stage}: {source}")]
    StoreUnavailable {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),
}

impl EngineError {
    pub fn store(stage: Stage, source: StoreError) -> Self {
        Self::StoreUnavailable { stage, source }
    }

    /// The pipeline stage a failure belongs to, when it belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            EngineError::UnsupportedType(_) | EngineError::Extraction(_) => Some(Stage::Extract),
            EngineError::VersionConflict { .. } => Some(Stage::ResolveVersion),
            EngineError::EmbeddingUnavailable(_) => Some(Stage::Query),
            EngineError::StoreUnavailable { stage, .. } => Some(*stage),
            EngineError::Validation(_)
            | EngineError::InvalidChunkConfig(_)
            | EngineError::NotFound(_)
            | EngineError::Unauthorized(_) => None,
        }
    }
}

pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_failures_report_their_stage() {
        let error = EngineError::store(
            Stage::WriteMetadata,
            StoreError::Request("connection refused".to_string()),
        );
        assert_eq!(error.stage(), Some(Stage::WriteMetadata));
        assert_eq!(
            error.to_string(),
            "store unavailable during write metadata: store request failed: connection refused"
        );
    }

    #[test]
    fn version_conflicts_belong_to_resolution() {
        let error = EngineError::VersionConflict {
            file_name: "report.pdf".to_string(),
            attempts: 3,
        };
        assert_eq!(error.stage(), Some(Stage::ResolveVersion));
    }
}
