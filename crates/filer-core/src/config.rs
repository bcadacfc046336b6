use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::STRUCTURAL_DIRS;

/// Top-level daemon configuration (loaded from filer.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FilerConfig {
    pub daemon: DaemonConfig,
    pub store: StoreConfig,
    pub cache: CacheConfig,
    pub prefetch: PrefetchConfig,
    pub invalidation: InvalidationConfig,
    pub fuse: FuseConfig,
    pub projection: ProjectionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Prometheus + diagnostics endpoint (default: 127.0.0.1:9110)
    pub metrics_addr: Option<String>,
    /// Log level (default: info)
    pub log_level: String,
    /// Log format: "json" or "text"
    pub log_format: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Local directory (fs backend) or key prefix (s3 backend)
    pub root: String,
    /// S3 endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    pub bucket: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
}

/// Cache TTLs per source tree plus housekeeping intervals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Chat directories whose newest child changed within the last hour
    pub chat_recent_ttl_secs: u64,
    pub chat_ttl_secs: u64,
    pub objects_ttl_secs: u64,
    pub debug_ttl_secs: u64,
    pub invites_ttl_secs: u64,
    pub types_ttl_secs: u64,
    pub root_ttl_secs: u64,
    /// Anything unclassified
    pub default_ttl_secs: u64,
    /// Upper bound for the in-memory file content cache
    pub content_max_bytes: u64,
    pub cleanup_interval_secs: u64,
    /// Telemetry and error records older than this are dropped on cleanup
    pub telemetry_max_age_secs: u64,
    pub error_log_capacity: usize,
    /// Directory for the persistent cache snapshot
    pub persist_dir: PathBuf,
    pub persist_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub max_depth: usize,
    pub parallel_limit: usize,
    pub timeout_ms: u64,
    /// File content reads are issued in batches of this size
    pub content_batch: usize,
    /// Number of frequently-accessed paths added to the smart prefetch set
    pub hot_paths: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    pub debounce_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FuseConfig {
    pub mountpoint: PathBuf,
    /// Write buffers live here until release
    pub temp_dir: PathBuf,
    /// How long getattr waits for an in-flight commit before ENOENT
    pub persist_wait_secs: u64,
    pub allow_other: bool,
    /// Reject dot-prefixed names while buffering writes
    pub reject_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Local directory the projection engine materializes
    pub virtual_root: PathBuf,
    /// Root-level names that are always directories
    pub structural_dirs: Vec<String>,
    /// How long a cold enumeration may block before answering from what it has
    pub enumeration_wait_ms: u64,
}

impl CacheConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }

    pub fn telemetry_max_age(&self) -> Duration {
        Duration::from_secs(self.telemetry_max_age_secs)
    }
}

impl PrefetchConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl ProjectionConfig {
    pub fn enumeration_wait(&self) -> Duration {
        Duration::from_millis(self.enumeration_wait_ms)
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            metrics_addr: Some("127.0.0.1:9110".into()),
            log_level: "info".into(),
            log_format: "text".into(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Fs,
            root: "~/.local/share/filer/store".into(),
            endpoint: "http://localhost:9000".into(),
            region: "us-east-1".into(),
            bucket: "filer".into(),
            access_key_id: None,
            secret_access_key: None,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            chat_recent_ttl_secs: 5 * 60,
            chat_ttl_secs: 60,
            objects_ttl_secs: 30 * 60,
            debug_ttl_secs: 5,
            invites_ttl_secs: 5 * 60,
            types_ttl_secs: 60 * 60,
            root_ttl_secs: 60,
            default_ttl_secs: 30,
            content_max_bytes: 256 * 1024 * 1024,
            cleanup_interval_secs: 5 * 60,
            telemetry_max_age_secs: 60 * 60,
            error_log_capacity: 1000,
            persist_dir: PathBuf::from("~/.cache/filer/projfs-cache"),
            persist_interval_secs: 30,
        }
    }
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
            parallel_limit: 5,
            timeout_ms: 3000,
            content_batch: 10,
            hot_paths: 10,
        }
    }
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self { debounce_ms: 100 }
    }
}

impl Default for FuseConfig {
    fn default() -> Self {
        Self {
            mountpoint: PathBuf::from("/mnt/filer"),
            temp_dir: PathBuf::from("~/.cache/filer/tmp"),
            persist_wait_secs: 10,
            allow_other: false,
            reject_hidden: cfg!(target_os = "macos"),
        }
    }
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            virtual_root: PathBuf::from("~/Filer"),
            structural_dirs: STRUCTURAL_DIRS.iter().map(|s| s.to_string()).collect(),
            enumeration_wait_ms: 2000,
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &std::path::Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[daemon]
log_level = "debug"
log_format = "json"
metrics_addr = "0.0.0.0:9200"

[store]
backend = "s3"
endpoint = "https://s3.example.com"
bucket = "content"
root = "tenant-a"

[cache]
objects_ttl_secs = 7200
debug_ttl_secs = 1
persist_dir = "/var/cache/filer"

[prefetch]
enabled = false
parallel_limit = 8

[invalidation]
debounce_ms = 250

[fuse]
mountpoint = "/mnt/content"
persist_wait_secs = 3
reject_hidden = true

[projection]
structural_dirs = ["chats", "objects"]
"#;
        let config: FilerConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.daemon.log_level, "debug");
        assert_eq!(config.daemon.metrics_addr.as_deref(), Some("0.0.0.0:9200"));
        assert_eq!(config.store.backend, StoreBackend::S3);
        assert_eq!(config.store.bucket, "content");
        assert_eq!(config.cache.objects_ttl_secs, 7200);
        assert_eq!(config.cache.debug_ttl_secs, 1);
        assert_eq!(config.cache.chat_ttl_secs, 60);
        assert!(!config.prefetch.enabled);
        assert_eq!(config.prefetch.parallel_limit, 8);
        assert_eq!(config.prefetch.max_depth, 2);
        assert_eq!(config.invalidation.debounce_ms, 250);
        assert_eq!(config.fuse.mountpoint, PathBuf::from("/mnt/content"));
        assert!(config.fuse.reject_hidden);
        assert_eq!(config.projection.structural_dirs, vec!["chats", "objects"]);
    }

    #[test]
    fn test_parse_defaults() {
        let mut config: FilerConfig = toml::from_str("").unwrap();

        assert_eq!(config.daemon.log_level, "info");
        assert_eq!(config.store.backend, StoreBackend::Fs);
        assert_eq!(config.cache.default_ttl_secs, 30);
        assert_eq!(config.cache.error_log_capacity, 1000);
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(300));
        config.cache.cleanup_interval_secs = 0;
        assert_eq!(config.cache.cleanup_interval(), Duration::from_secs(1));
        assert_eq!(config.prefetch.timeout(), Duration::from_millis(3000));
        assert_eq!(config.prefetch.content_batch, 10);
        assert_eq!(config.invalidation.debounce_ms, 100);
        assert_eq!(config.fuse.persist_wait_secs, 10);
        assert_eq!(config.projection.structural_dirs.len(), 5);
        assert_eq!(config.projection.enumeration_wait(), Duration::from_secs(2));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = FilerConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: FilerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.store.endpoint, parsed.store.endpoint);
        assert_eq!(config.cache.types_ttl_secs, parsed.cache.types_ttl_secs);
        assert_eq!(config.projection.structural_dirs, parsed.projection.structural_dirs);
    }

    #[test]
    fn test_expand_home() {
        let plain = PathBuf::from("/var/tmp/x");
        assert_eq!(expand_home(&plain), plain);
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(
                expand_home(std::path::Path::new("~/a")),
                PathBuf::from(home).join("a")
            );
        }
    }
}
