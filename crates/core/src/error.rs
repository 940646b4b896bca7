use thiserror::Error;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("pdf parse error: {0}")]
    PdfParse(String),

    #[error("path has no file name: {0}")]
    MissingFileName(String),

    #[error("invalid chunking config: {0}")]
    InvalidChunkConfig(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

#[derive(Debug, Error)]
pub enum RagError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("no index persisted for session {session}")]
    IndexNotFound { session: String },

    #[error("provider {provider} failed: {details}")]
    Provider { provider: String, details: String },

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("url parse error: {0}")]
    Url(#[from] url::ParseError),

    #[error("serialize error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("embedding dimension {actual} does not match collection dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error("session {session}: another writer kept publishing the same segment after {attempts} attempts")]
    CommitConflict { session: String, attempts: usize },

    #[error("batch {batch} aborted after {committed_chunks} committed chunks: {source}")]
    BatchAborted {
        batch: usize,
        committed_chunks: usize,
        #[source]
        source: Box<RagError>,
    },
}

impl RagError {
    pub fn provider(provider: impl Into<String>, details: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            details: details.into(),
        }
    }

    /// Errors that are surfaced to the caller immediately and never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RagError::Configuration(_) | RagError::IndexNotFound { .. }
        )
    }

    /// Text shown to the student when an answer could not be produced.
    pub fn user_message(&self) -> String {
        match self {
            RagError::Configuration(details) => {
                format!("The assistant is not configured correctly: {details}")
            }
            RagError::IndexNotFound { .. } => {
                "No processed documents were found for this session. Upload and process your materials first.".to_string()
            }
            RagError::Provider { provider, .. } => format!(
                "The {provider} service could not be reached or rejected the request. Please try again."
            ),
            RagError::Http(_) => {
                "The language service could not be reached. Please try again.".to_string()
            }
            _ => format!("Something went wrong while answering: {self}"),
        }
    }
}
