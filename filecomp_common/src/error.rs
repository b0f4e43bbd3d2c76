use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FileCompError {
    #[error("IO error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Out of memory")]
    OutOfMemory,

    /// Raised at a cancellation poll point. Not a failure: the orchestrator
    /// turns it into `CompareOutcome::Cancelled`.
    #[error("Comparison cancelled")]
    Cancelled,

    #[error("Unsupported input: {0}")]
    UnsupportedInput(String),

    #[error("Internal error: {0}")]
    InternalInvariant(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl FileCompError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Short machine-friendly name of the error kind
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io { .. } => ErrorKind::Io,
            Self::OutOfMemory => ErrorKind::OutOfMemory,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::UnsupportedInput(_) => ErrorKind::UnsupportedInput,
            Self::InternalInvariant(_) => ErrorKind::InternalInvariant,
            Self::Config(_) | Self::Serialization(_) => ErrorKind::Config,
        }
    }

    /// Path the error refers to, if any
    pub fn path(&self) -> Option<&std::path::Path> {
        match self {
            Self::Io { path, .. } => Some(path.as_path()),
            _ => None,
        }
    }
}

impl From<std::collections::TryReserveError> for FileCompError {
    fn from(_: std::collections::TryReserveError) -> Self {
        Self::OutOfMemory
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    Io,
    OutOfMemory,
    Cancelled,
    UnsupportedInput,
    InternalInvariant,
    Config,
}

pub type Result<T> = std::result::Result<T, FileCompError>;
