//! SHA-256 content addressing.
//!
//! The backing store names every object by the lowercase hex SHA-256 of its
//! bytes; two objects with identical content share a hash.

use std::path::Path;

use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

/// Read buffer used when hashing files from disk.
const HASH_BUF_SIZE: usize = 64 * 1024;

/// Hash a byte slice in memory.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Hash a file with the streaming interface. Returns `(hex, size)`.
pub async fn hash_file(path: &Path) -> std::io::Result<(String, u64)> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        total += n as u64;
    }

    Ok((format!("{:x}", hasher.finalize()), total))
}

/// True if `s` looks like a hex SHA-256 digest.
pub fn is_content_hash(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| b.is_ascii_hexdigit())
}
