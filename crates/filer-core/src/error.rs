use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::types::SourceTree;

pub type FilerResult<T> = Result<T, FilerError>;

#[derive(Debug, Error)]
pub enum FilerError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O failure: {0}")]
    Io(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: String,
        after: Duration,
    },

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("directory not empty: {0}")]
    NotEmpty(String),

    #[error("is a directory: {0}")]
    IsDirectory(String),

    #[error("not a directory: {0}")]
    NotDirectory(String),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("config error: {0}")]
    Config(String),

    #[error("mount error: {0}")]
    Mount(String),

    #[error("local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// A failure observed by several waiters of one shared fetch.
    #[error(transparent)]
    Shared(Arc<FilerError>),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FilerError {
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        FilerError::Timeout {
            operation: operation.into(),
            after,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            FilerError::NotFound(_) => true,
            FilerError::LocalIo(e) => e.kind() == std::io::ErrorKind::NotFound,
            FilerError::Shared(inner) => inner.is_not_found(),
            _ => false,
        }
    }

    /// Rebuild an owned error from a shared one, keeping the variant where
    /// it carries plain data.
    pub fn from_shared(shared: &Arc<FilerError>) -> Self {
        match shared.as_ref() {
            FilerError::NotFound(p) => FilerError::NotFound(p.clone()),
            FilerError::Io(m) => FilerError::Io(m.clone()),
            FilerError::Timeout { operation, after } => FilerError::Timeout {
                operation: operation.clone(),
                after: *after,
            },
            FilerError::Unsupported(op) => FilerError::Unsupported(op.clone()),
            _ => FilerError::Shared(shared.clone()),
        }
    }
}

// ── Contextual errors ──────────────────────────────────────────────────────

/// Where a failure happened: operation, virtual path, owning tree and the
/// correlation id of the request that hit it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorContext {
    pub operation: String,
    pub path: String,
    pub source_tree: Option<SourceTree>,
    pub request_id: Option<String>,
}

impl ErrorContext {
    pub fn new(operation: impl Into<String>, path: impl Into<String>) -> Self {
        ErrorContext {
            operation: operation.into(),
            path: path.into(),
            source_tree: None,
            request_id: None,
        }
    }

    pub fn with_request(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_tree(mut self, tree: SourceTree) -> Self {
        self.source_tree = Some(tree);
        self
    }
}

#[derive(Debug, Error)]
pub struct ContextualError {
    pub context: ErrorContext,
    #[source]
    pub source: FilerError,
}

impl fmt::Display for ContextualError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] Path: {}", self.context.operation, self.context.path)?;
        if let Some(tree) = self.context.source_tree {
            write!(f, " | FS: {tree}")?;
        }
        if let Some(id) = &self.context.request_id {
            write!(f, " | ReqID: {id}")?;
        }
        write!(f, " | Error: {}", self.source)
    }
}

/// Result of an operation below the native-engine boundary, split by how
/// the caller must treat it.
#[derive(Debug)]
pub enum Failure {
    /// Best-effort path: log and fall back to a default answer.
    Recoverable(ContextualError),
    /// Correctness path: must be surfaced to the caller.
    Fatal(ContextualError),
}

impl Failure {
    pub fn error(&self) -> &ContextualError {
        match self {
            Failure::Recoverable(e) | Failure::Fatal(e) => e,
        }
    }

    pub fn into_error(self) -> ContextualError {
        match self {
            Failure::Recoverable(e) | Failure::Fatal(e) => e,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Failure::Fatal(_))
    }

    /// Swallow a recoverable failure by returning `fallback`; fatal failures
    /// are handed back.
    pub fn recover_with<T>(self, fallback: T) -> Result<T, ContextualError> {
        match self {
            Failure::Recoverable(_) => Ok(fallback),
            Failure::Fatal(e) => Err(e),
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Failure::Recoverable(e) => write!(f, "recoverable: {e}"),
            Failure::Fatal(e) => write!(f, "fatal: {e}"),
        }
    }
}
