//! Node record format stored under `tree/` for every file, directory and
//! symlink.
//!
//! Records are UTF-8 key-value text, one pair per line, `version` first and
//! the remaining keys sorted:
//! ```text
//! version filer-node/1
//! hash ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad
//! kind file
//! mode 33206
//! mtime 1718000000000
//! size 3
//! ```
//!
//! Directories carry their record in a marker object inside the directory;
//! symlinks add a `target` line.

use anyhow::{Context, Result};
use filer_core::types::{FileStat, DEFAULT_DIR_MODE, S_IFDIR, S_IFLNK, S_IFMT};

pub const NODE_VERSION: &str = "filer-node/1";

/// Marker object name holding a directory's own record. Never listed.
pub const DIR_MARKER: &str = ".filer-dir";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
    Symlink,
}

impl NodeKind {
    fn as_str(&self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
            NodeKind::Symlink => "symlink",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub kind: NodeKind,
    /// Content hash of the blob (files only)
    pub hash: String,
    pub mode: u32,
    pub size: u64,
    pub mtime: Option<u64>,
    /// Link target (symlinks only)
    pub target: Option<String>,
}

impl NodeRecord {
    pub fn file(hash: &str, size: u64, mode: u32, mtime: u64) -> Self {
        NodeRecord {
            kind: NodeKind::File,
            hash: hash.to_string(),
            mode,
            size,
            mtime: Some(mtime),
            target: None,
        }
    }

    pub fn dir(mode: u32, mtime: u64) -> Self {
        let mode = if mode & S_IFMT == 0 { mode | S_IFDIR } else { mode };
        NodeRecord {
            kind: NodeKind::Dir,
            hash: String::new(),
            mode,
            size: 0,
            mtime: Some(mtime),
            target: None,
        }
    }

    pub fn symlink(target: &str, mtime: u64) -> Self {
        NodeRecord {
            kind: NodeKind::Symlink,
            hash: String::new(),
            mode: S_IFLNK | 0o777,
            size: target.len() as u64,
            mtime: Some(mtime),
            target: Some(target.to_string()),
        }
    }

    /// A directory that exists only because something lives below it.
    pub fn implicit_dir() -> Self {
        NodeRecord {
            kind: NodeKind::Dir,
            hash: String::new(),
            mode: DEFAULT_DIR_MODE,
            size: 0,
            mtime: None,
            target: None,
        }
    }

    pub fn parse(content: &str) -> Result<Self> {
        let mut kind = None;
        let mut hash = String::new();
        let mut mode = None;
        let mut size = 0u64;
        let mut mtime = None;
        let mut target = None;
        let mut found_version = false;

        for (lineno, line) in content.lines().enumerate() {
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once(' ')
                .with_context(|| format!("line {}: no space separator: {:?}", lineno + 1, line))?;

            match key {
                "version" => {
                    anyhow::ensure!(value == NODE_VERSION, "unsupported node version: {}", value);
                    found_version = true;
                }
                "kind" => {
                    kind = Some(match value {
                        "file" => NodeKind::File,
                        "dir" => NodeKind::Dir,
                        "symlink" => NodeKind::Symlink,
                        other => anyhow::bail!("unknown node kind: {}", other),
                    });
                }
                "hash" => hash = value.to_string(),
                "mode" => {
                    mode = Some(
                        value
                            .parse::<u32>()
                            .with_context(|| format!("invalid mode: {}", value))?,
                    );
                }
                "size" => {
                    size = value
                        .parse::<u64>()
                        .with_context(|| format!("invalid size: {}", value))?;
                }
                "mtime" => {
                    mtime = Some(
                        value
                            .parse::<u64>()
                            .with_context(|| format!("invalid mtime: {}", value))?,
                    );
                }
                "target" => target = Some(value.to_string()),
                _ => {}
            }
        }

        anyhow::ensure!(found_version, "missing version line");
        let kind = kind.context("missing kind field")?;
        if kind == NodeKind::File {
            anyhow::ensure!(!hash.is_empty(), "file node without hash");
        }
        if kind == NodeKind::Symlink {
            anyhow::ensure!(target.is_some(), "symlink node without target");
        }

        Ok(NodeRecord {
            kind,
            hash,
            mode: mode.context("missing mode field")?,
            size,
            mtime,
            target,
        })
    }

    pub fn to_record_string(&self) -> String {
        let mut out = format!("version {NODE_VERSION}\n");
        if !self.hash.is_empty() {
            out.push_str(&format!("hash {}\n", self.hash));
        }
        out.push_str(&format!("kind {}\n", self.kind.as_str()));
        out.push_str(&format!("mode {}\n", self.mode));
        if let Some(mtime) = self.mtime {
            out.push_str(&format!("mtime {mtime}\n"));
        }
        out.push_str(&format!("size {}\n", self.size));
        if let Some(target) = &self.target {
            out.push_str(&format!("target {target}\n"));
        }
        out
    }

    pub fn to_stat(&self) -> FileStat {
        FileStat {
            size: self.size,
            mode: self.mode,
            is_directory: Some(self.kind == NodeKind::Dir),
            content_hash: (!self.hash.is_empty()).then(|| self.hash.clone()),
            mtime: self.mtime,
            atime: self.mtime,
            ctime: self.mtime,
        }
    }
}
