//! filer-fuse: FUSE bridge with local write buffering
//!
//! Reads go straight to the content store. New files are written into temp
//! buffers and committed (hash → blob → directory entry) on `release`.
//!
//! Linux: fuse3 crate (kernel FUSE), behind the `fuse` feature
//! macOS: fuse3 with macFUSE 4.x

pub mod adapter;
pub mod driver;
pub mod errno;
pub mod tempfiles;

// Re-export the mount API when the fuse feature is enabled
#[cfg(feature = "fuse")]
pub use driver::{mount, FilerFs, MountConfig};

pub use adapter::{AdapterStats, StatFs, WriteBufferAdapter, FIRST_DESCRIPTOR, STATFS};
pub use errno::{errno, status};
pub use tempfiles::{TempEntry, TempFileManager, TempStat};
