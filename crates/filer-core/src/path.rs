//! Virtual path helpers.
//!
//! All caches and the store are keyed by normalized paths: forward slashes,
//! a single leading `/`, no repeated or trailing separators. The root is `/`.

/// Normalize a path coming from a native engine callback.
///
/// Backslashes become `/`, an optional `virtual_root` prefix (the local
/// projection directory) is stripped, and empty components are dropped.
pub fn normalize_path(raw: &str, virtual_root: Option<&str>) -> String {
    let unified = raw.replace('\\', "/");
    let mut rest = unified.as_str();

    if let Some(root) = virtual_root {
        let root = root.replace('\\', "/");
        let root = root.trim_end_matches('/');
        if !root.is_empty() {
            if let Some(stripped) = rest.strip_prefix(root) {
                if stripped.is_empty() || stripped.starts_with('/') {
                    rest = stripped;
                }
            }
        }
    }

    let parts: Vec<&str> = rest
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// Join a child name onto a normalized parent path.
pub fn join_child(parent: &str, name: &str) -> String {
    if parent == "/" || parent.is_empty() {
        format!("/{name}")
    } else {
        format!("{}/{}", parent.trim_end_matches('/'), name)
    }
}

/// Split a normalized path into `(parent, name)`. The root has no name.
pub fn split_parent(path: &str) -> (String, String) {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rsplit_once('/') {
        Some(("", name)) => ("/".to_string(), name.to_string()),
        Some((parent, name)) => (parent.to_string(), name.to_string()),
        None => ("/".to_string(), trimmed.to_string()),
    }
}

/// Last component of a path, or `""` for the root.
pub fn file_name(path: &str) -> &str {
    path.trim_end_matches('/').rsplit('/').next().unwrap_or("")
}

/// Number of components below the root.
pub fn depth(path: &str) -> usize {
    path.split('/').filter(|p| !p.is_empty()).count()
}
