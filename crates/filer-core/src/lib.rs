pub mod config;
pub mod context;
pub mod diagnostics;
pub mod error;
pub mod hash;
pub mod path;
pub mod types;

pub use context::{RequestContext, RequestContextTracker, TelemetryResult};
pub use diagnostics::ErrorContextualizer;
pub use error::{ContextualError, ErrorContext, Failure, FilerError, FilerResult};
pub use types::{DirectoryEntry, FileStat, SourceTree};
