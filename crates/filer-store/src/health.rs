//! Store readiness check

use anyhow::Result;

use crate::store::ContentStore;

/// Verify the store answers and its root is populated.
///
/// An empty root means the store is not ready to be mounted.
pub async fn check_health(store: &dyn ContentStore) -> Result<usize> {
    let children = store
        .read_dir("/")
        .await
        .map_err(|e| anyhow::anyhow!("store health check failed: {e}"))?;
    anyhow::ensure!(!children.is_empty(), "store root is empty");
    Ok(children.len())
}

/// Returns true if the store is ready, false otherwise (non-panicking)
pub async fn is_healthy(store: &dyn ContentStore) -> bool {
    check_health(store).await.is_ok()
}
