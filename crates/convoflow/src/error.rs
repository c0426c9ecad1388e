use std::time::Duration;

use thiserror::Error;

use crate::pipeline::error_codes::ErrorCode;
use crate::pipeline::retry::{Classify, ErrorClass};

/// Failures reported by a [`crate::Classifier`].
#[derive(Debug, Clone, Error)]
pub enum ClassifierError {
    #[error("classifier timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("classifier rate limited: {0}")]
    RateLimited(String),

    #[error("classifier unavailable: {0}")]
    Unavailable(String),

    #[error("classifier rejected credentials: {0}")]
    Auth(String),

    #[error("invalid conversation: {0}")]
    InvalidInput(String),

    #[error("classifier returned unusable output: {0}")]
    MalformedResponse(String),
}

impl ClassifierError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::RateLimited(_) => ErrorCode::RateLimit,
            Self::Unavailable(_) => ErrorCode::DependencyDown,
            Self::Auth(_) => ErrorCode::Auth,
            Self::InvalidInput(_) => ErrorCode::BadPayload,
            Self::MalformedResponse(_) => ErrorCode::MalformedResponse,
        }
    }
}

impl Classify for ClassifierError {
    fn class(&self) -> ErrorClass {
        self.code().class()
    }
}

/// Failures reported by a [`crate::ConversationStore`].
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("store call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("store conflict ({code}): {message}")]
    Conflict { code: ErrorCode, message: String },

    #[error("store rejected the write: {0}")]
    Validation(String),

    #[error("store rejected credentials: {0}")]
    Auth(String),

    #[error("store out of resources: {0}")]
    ResourceExhausted(String),
}

impl StoreError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Unavailable(_) => ErrorCode::DependencyDown,
            Self::Timeout(_) => ErrorCode::Timeout,
            Self::Conflict { code, .. } => *code,
            Self::Validation(_) => ErrorCode::BadPayload,
            Self::Auth(_) => ErrorCode::Auth,
            Self::ResourceExhausted(_) => ErrorCode::ResourceExhausted,
        }
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        self.code().class()
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db) => {
                let code = db.code().map(|c| c.to_string()).unwrap_or_default();
                let message = db.message().to_string();
                match code.as_str() {
                    "40001" => Self::Conflict {
                        code: ErrorCode::Serialization,
                        message,
                    },
                    "40P01" => Self::Conflict {
                        code: ErrorCode::DbDeadlock,
                        message,
                    },
                    // disk_full, out_of_memory, insufficient_resources
                    "53100" | "53200" | "53000" => Self::ResourceExhausted(message),
                    c if c.starts_with("28") => Self::Auth(message),
                    c if c.starts_with("22") || c.starts_with("23") => Self::Validation(message),
                    _ => Self::Unavailable(message),
                }
            }
            sqlx::Error::PoolTimedOut => Self::Timeout(Duration::ZERO),
            sqlx::Error::ColumnDecode { .. }
            | sqlx::Error::Decode(_)
            | sqlx::Error::ColumnNotFound(_)
            | sqlx::Error::TypeNotFound { .. } => Self::Validation(err.to_string()),
            _ => Self::Unavailable(err.to_string()),
        }
    }
}

/// Local batch-file store failures.
#[derive(Debug, Error)]
pub enum BatchFileError {
    #[error("batch file io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("batch file {path} is corrupt: {source}")]
    Corrupt {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("batch {0} not found")]
    NotFound(String),

    #[error("refusing to create a batch from an empty page")]
    EmptyPage,
}

impl BatchFileError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }

    pub fn is_disk_full(&self) -> bool {
        match self {
            Self::Io { source, .. } => {
                // ENOSPC / EDQUOT
                matches!(source.raw_os_error(), Some(28) | Some(122))
            }
            _ => false,
        }
    }
}

/// Run-level failures surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("store unreachable at startup: {0}")]
    StartupConnectivity(#[source] StoreError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    BatchFiles(#[from] BatchFileError),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("batch {batch_id} still has {outstanding} unfinished items")]
    Incomplete { batch_id: String, outstanding: usize },
}

impl PipelineError {
    /// Fatal errors end the run; everything else sends the orchestrator back
    /// to fetching.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::StartupConnectivity(_) | Self::BatchFiles(_) | Self::ResourceExhausted(_) => true,
            Self::Store(e) => e.class() == ErrorClass::ResourceExhausted,
            Self::Incomplete { .. } => false,
        }
    }
}
