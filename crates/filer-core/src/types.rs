use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ── Mode bits ─────────────────────────────────────────────────────────────

pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Mode for synthesized directories (structural roots, unstattable dirs).
pub const DEFAULT_DIR_MODE: u32 = S_IFDIR | 0o755;
/// Mode for children whose `stat` failed and are not structural.
pub const DEFAULT_FILE_MODE: u32 = S_IFREG | 0o644;
/// Mode used by `mkdir` through the FUSE bridge.
pub const MKDIR_MODE: u32 = S_IFDIR | 0o777;
/// Mode given to files committed from a write buffer.
pub const COMMITTED_FILE_MODE: u32 = S_IFREG | 0o666;

pub fn is_dir_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFDIR
}

pub fn is_symlink_mode(mode: u32) -> bool {
    mode & S_IFMT == S_IFLNK
}

// ── Source trees ──────────────────────────────────────────────────────────

/// Top-level directory names owned by the logical subsystems.
pub const STRUCTURAL_DIRS: [&str; 5] = ["chats", "objects", "debug", "invites", "types"];

/// Logical subsystem owning a virtual path. Selects cache TTL and priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceTree {
    Chat,
    Objects,
    Debug,
    Invites,
    Types,
    Root,
}

impl SourceTree {
    pub const ALL: [SourceTree; 6] = [
        SourceTree::Chat,
        SourceTree::Objects,
        SourceTree::Debug,
        SourceTree::Invites,
        SourceTree::Types,
        SourceTree::Root,
    ];

    /// Classify a normalized virtual path by its first component.
    pub fn of(path: &str) -> Self {
        let first = path.trim_start_matches('/').split('/').next().unwrap_or("");
        match first {
            "chats" => SourceTree::Chat,
            "objects" => SourceTree::Objects,
            "debug" => SourceTree::Debug,
            "invites" => SourceTree::Invites,
            "types" => SourceTree::Types,
            _ => SourceTree::Root,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceTree::Chat => "chat",
            SourceTree::Objects => "objects",
            SourceTree::Debug => "debug",
            SourceTree::Invites => "invites",
            SourceTree::Types => "types",
            SourceTree::Root => "root",
        }
    }
}

impl fmt::Display for SourceTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Store-facing stat ─────────────────────────────────────────────────────

/// Attributes returned by the backing store's `stat`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileStat {
    pub size: u64,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_directory: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<u64>,
}

impl FileStat {
    /// Directory-ness comes from the mode bits, never from `is_directory`.
    pub fn is_dir(&self) -> bool {
        is_dir_mode(self.mode)
    }

    pub fn is_symlink(&self) -> bool {
        is_symlink_mode(self.mode)
    }
}

// ── Directory entries ─────────────────────────────────────────────────────

/// One child of a directory as presented to the OS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryEntry {
    pub name: String,
    #[serde(default)]
    pub content_hash: String,
    pub size: u64,
    pub is_directory: bool,
    pub mode: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub atime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctime: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_tree: Option<SourceTree>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl DirectoryEntry {
    /// A synthesized directory with default mode and no content.
    pub fn directory(name: impl Into<String>) -> Self {
        DirectoryEntry {
            name: name.into(),
            content_hash: String::new(),
            size: 0,
            is_directory: true,
            mode: DEFAULT_DIR_MODE,
            mtime: None,
            atime: None,
            ctime: None,
            source_tree: None,
            content_type: None,
            metadata: BTreeMap::new(),
        }
    }

    /// A placeholder file of size 0 for a child whose attributes are unknown.
    pub fn unknown_file(name: impl Into<String>) -> Self {
        let name = name.into();
        let content_type = content_type_for(&name).to_string();
        DirectoryEntry {
            is_directory: false,
            mode: DEFAULT_FILE_MODE,
            content_type: Some(content_type),
            ..DirectoryEntry::directory(name)
        }
    }

    pub fn from_stat(name: impl Into<String>, stat: &FileStat) -> Self {
        let name = name.into();
        let is_directory = stat.is_dir();
        let content_type = (!is_directory).then(|| content_type_for(&name).to_string());
        DirectoryEntry {
            name,
            content_hash: stat.content_hash.clone().unwrap_or_default(),
            size: if is_directory { 0 } else { stat.size },
            is_directory,
            mode: stat.mode,
            mtime: stat.mtime,
            atime: stat.atime,
            ctime: stat.ctime,
            source_tree: None,
            content_type,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_tree(mut self, tree: SourceTree) -> Self {
        self.source_tree = Some(tree);
        self
    }

    pub fn with_meta(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Guess a MIME type from the file extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_ascii_lowercase(),
        _ => return "application/octet-stream",
    };
    match ext.as_str() {
        "json" => "application/json",
        "txt" => "text/plain",
        "md" => "text/markdown",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "js" => "application/javascript",
        "ts" => "application/typescript",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

// ── Requests ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestKind {
    Enumeration,
    Stat,
    Read,
    Write,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Normal,
    High,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tree_by_prefix() {
        assert_eq!(SourceTree::of("/chats/abc/messages"), SourceTree::Chat);
        assert_eq!(SourceTree::of("/objects/0f"), SourceTree::Objects);
        assert_eq!(SourceTree::of("/debug"), SourceTree::Debug);
        assert_eq!(SourceTree::of("/invites/x"), SourceTree::Invites);
        assert_eq!(SourceTree::of("/types/Person"), SourceTree::Types);
        assert_eq!(SourceTree::of("/"), SourceTree::Root);
        assert_eq!(SourceTree::of("/chatsx"), SourceTree::Root);
    }

    #[test]
    fn directory_from_mode_bits_only() {
        let stat = FileStat {
            size: 4096,
            mode: 0o040755,
            is_directory: Some(false),
            ..Default::default()
        };
        let entry = DirectoryEntry::from_stat("sub", &stat);
        assert!(entry.is_directory);
        assert_eq!(entry.size, 0);
        assert!(entry.content_type.is_none());
    }

    #[test]
    fn file_entry_gets_content_type() {
        let stat = FileStat {
            size: 12,
            mode: 0o100644,
            content_hash: Some("ab".into()),
            ..Default::default()
        };
        let entry = DirectoryEntry::from_stat("notes.MD", &stat);
        assert!(!entry.is_directory);
        assert_eq!(entry.size, 12);
        assert_eq!(entry.content_hash, "ab");
        assert_eq!(entry.content_type.as_deref(), Some("text/markdown"));
    }

    #[test]
    fn content_types() {
        assert_eq!(content_type_for("a.json"), "application/json");
        assert_eq!(content_type_for("photo.JPEG"), "image/jpeg");
        assert_eq!(content_type_for(".hidden"), "application/octet-stream");
        assert_eq!(content_type_for("noext"), "application/octet-stream");
    }

    #[test]
    fn entry_json_skips_empty_optionals() {
        let json = serde_json::to_string(&DirectoryEntry::directory("chats")).unwrap();
        assert!(!json.contains("mtime"));
        assert!(!json.contains("metadata"));
        let back: DirectoryEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, DirectoryEntry::directory("chats"));
    }
}
