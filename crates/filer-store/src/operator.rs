//! OpenDAL Operator factory for the configured backing store

use anyhow::{Context, Result};
use opendal::Operator;

use filer_core::config::{expand_home, StoreBackend, StoreConfig};

/// Build an OpenDAL Operator for the configured backend.
///
/// Remote backends get logging and retry layers; retries live here, not in
/// the bridge above.
pub fn build_operator(cfg: &StoreConfig) -> Result<Operator> {
    let op = match cfg.backend {
        StoreBackend::Memory => Operator::new(opendal::services::Memory::default())
            .context("creating OpenDAL memory operator")?
            .finish(),
        StoreBackend::Fs => {
            let root = expand_home(std::path::Path::new(&cfg.root));
            let builder = opendal::services::Fs::default().root(&root.to_string_lossy());
            Operator::new(builder)
                .with_context(|| format!("creating OpenDAL fs operator at {}", root.display()))?
                .layer(opendal::layers::LoggingLayer::default())
                .finish()
        }
        StoreBackend::S3 => {
            if cfg.endpoint.starts_with("http://") {
                tracing::warn!(
                    endpoint = %cfg.endpoint,
                    "S3 endpoint uses plaintext HTTP; credentials are transmitted unencrypted"
                );
            }
            let access_key = cfg
                .access_key_id
                .as_deref()
                .context("store.access_key_id is required for the s3 backend")?;
            let secret_key = cfg
                .secret_access_key
                .as_deref()
                .context("store.secret_access_key is required for the s3 backend")?;

            // opendal 0.55: S3 builder uses consuming pattern (methods take `self`, return `Self`)
            let builder = opendal::services::S3::default()
                .endpoint(&cfg.endpoint)
                .region(&cfg.region)
                .bucket(&cfg.bucket)
                .root(&cfg.root)
                .access_key_id(access_key)
                .secret_access_key(secret_key);

            Operator::new(builder)
                .context("creating OpenDAL S3 operator")?
                .layer(opendal::layers::LoggingLayer::default())
                .layer(
                    opendal::layers::RetryLayer::new()
                        .with_max_times(5)
                        .with_jitter(),
                )
                .finish()
        }
    };

    Ok(op)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_memory_operator() {
        let cfg = StoreConfig {
            backend: StoreBackend::Memory,
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_fs_operator() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = StoreConfig {
            backend: StoreBackend::Fs,
            root: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }

    #[test]
    fn test_build_s3_requires_credentials() {
        let cfg = StoreConfig {
            backend: StoreBackend::S3,
            ..Default::default()
        };
        let err = build_operator(&cfg).unwrap_err();
        assert!(err.to_string().contains("access_key_id"));
    }

    #[test]
    fn test_build_s3_operator() {
        let cfg = StoreConfig {
            backend: StoreBackend::S3,
            endpoint: "http://localhost:9000".into(),
            bucket: "test-bucket".into(),
            access_key_id: Some("test-key".into()),
            secret_access_key: Some("test-secret".into()),
            ..Default::default()
        };
        assert!(build_operator(&cfg).is_ok());
    }
}
