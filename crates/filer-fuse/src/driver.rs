//! FUSE filesystem driver: mounts a content store as a local directory.
//!
//! Every callback is a thin translation onto [`WriteBufferAdapter`]; errors
//! become errnos through [`crate::errno`].

#[cfg(feature = "fuse")]
mod inner {
    use std::ffi::OsStr;
    use std::num::NonZeroU32;
    use std::path::PathBuf;
    use std::sync::Arc;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    use bytes::Bytes;
    use fuse3::path::prelude::*;
    use fuse3::{Errno, FileType, MountOptions};
    use futures::stream;
    use tracing::{debug, info, warn};

    use filer_core::path::join_child;
    use filer_core::types::DEFAULT_DIR_MODE;
    use filer_core::{FileStat, FilerError};

    use crate::adapter::WriteBufferAdapter;
    use crate::errno::errno;

    // ── Configuration ─────────────────────────────────────────────────────────

    /// TTL for dentry/attr entries in the kernel cache
    const ATTR_TTL: Duration = Duration::from_secs(1);

    const MAX_WRITE: u32 = 128 * 1024;

    fn to_errno(op: &str, path: &str, err: FilerError) -> Errno {
        let code = errno(&err);
        if code == libc::ENOENT {
            debug!(op, path, "not found");
        } else {
            warn!(op, path, error = %err, "fuse operation failed");
        }
        Errno::from(code)
    }

    fn path_str(path: Option<&OsStr>) -> fuse3::Result<&str> {
        path.and_then(|p| p.to_str())
            .ok_or_else(|| Errno::from(libc::ENOENT))
    }

    fn child(parent: &OsStr, name: &OsStr) -> fuse3::Result<String> {
        let parent = parent.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        let name = name.to_str().ok_or_else(|| Errno::from(libc::ENOENT))?;
        Ok(join_child(parent, name))
    }

    // ── FilerFs ───────────────────────────────────────────────────────────────

    pub struct FilerFs {
        adapter: Arc<WriteBufferAdapter>,
        uid: u32,
        gid: u32,
        mount_time: SystemTime,
    }

    impl FilerFs {
        pub fn new(adapter: Arc<WriteBufferAdapter>) -> Self {
            let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
            FilerFs {
                adapter,
                uid,
                gid,
                mount_time: SystemTime::now(),
            }
        }

        fn time_of(&self, millis: Option<u64>) -> SystemTime {
            millis
                .map(|ms| UNIX_EPOCH + Duration::from_millis(ms))
                .unwrap_or(self.mount_time)
        }

        fn attr(&self, stat: &FileStat) -> FileAttr {
            let kind = if stat.is_dir() {
                FileType::Directory
            } else if stat.is_symlink() {
                FileType::Symlink
            } else {
                FileType::RegularFile
            };
            FileAttr {
                size: stat.size,
                blocks: stat.size.div_ceil(512),
                atime: self.time_of(stat.atime),
                mtime: self.time_of(stat.mtime),
                ctime: self.time_of(stat.ctime),
                #[cfg(target_os = "macos")]
                crtime: self.mount_time,
                kind,
                perm: (stat.mode & 0o7777) as u16,
                nlink: if kind == FileType::Directory { 2 } else { 1 },
                uid: self.uid,
                gid: self.gid,
                rdev: 0,
                blksize: 4096,
                #[cfg(target_os = "macos")]
                flags: 0,
            }
        }

        async fn entry(&self, op: &str, path: &str) -> fuse3::Result<ReplyEntry> {
            let stat = self
                .adapter
                .getattr(path)
                .await
                .map_err(|e| to_errno(op, path, e))?;
            Ok(ReplyEntry {
                ttl: ATTR_TTL,
                attr: self.attr(&stat),
            })
        }

        async fn listing(&self, path: &str) -> fuse3::Result<Vec<(String, FileAttr)>> {
            let names = self
                .adapter
                .readdir(path)
                .await
                .map_err(|e| to_errno("readdir", path, e))?;
            let mut out = Vec::with_capacity(names.len());
            for name in names {
                let child = join_child(path, &name);
                match self.adapter.getattr(&child).await {
                    Ok(stat) => out.push((name, self.attr(&stat))),
                    Err(e) => debug!(path = %child, error = %e, "skipping unstattable entry"),
                }
            }
            Ok(out)
        }
    }

    // ── PathFilesystem impl ────────────────────────────────────────────────────

    impl PathFilesystem for FilerFs {
        async fn init(&self, _req: Request) -> fuse3::Result<ReplyInit> {
            debug!("filer-fuse init");
            Ok(ReplyInit {
                max_write: NonZeroU32::new(MAX_WRITE).ok_or_else(|| Errno::from(libc::EINVAL))?,
            })
        }

        async fn destroy(&self, _req: Request) {
            info!("filer-fuse unmounted");
        }

        async fn lookup(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            let path = child(parent, name)?;
            self.entry("lookup", &path).await
        }

        async fn getattr(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            _fh: Option<u64>,
            _flags: u32,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path_str(path)?;
            let stat = self
                .adapter
                .getattr(path)
                .await
                .map_err(|e| to_errno("getattr", path, e))?;
            Ok(ReplyAttr {
                ttl: ATTR_TTL,
                attr: self.attr(&stat),
            })
        }

        async fn setattr(
            &self,
            req: Request,
            path: Option<&OsStr>,
            _fh: Option<u64>,
            set_attr: SetAttr,
        ) -> fuse3::Result<ReplyAttr> {
            let path = path_str(path)?;
            if let Some(size) = set_attr.size {
                self.adapter
                    .truncate(path, size)
                    .await
                    .map_err(|e| to_errno("truncate", path, e))?;
            }
            if let Some(mode) = set_attr.mode {
                self.adapter
                    .chmod(path, mode)
                    .await
                    .map_err(|e| to_errno("chmod", path, e))?;
            }
            if set_attr.uid.is_some() || set_attr.gid.is_some() {
                self.adapter
                    .chown(path, set_attr.uid.unwrap_or(self.uid), set_attr.gid.unwrap_or(self.gid))
                    .map_err(|e| to_errno("chown", path, e))?;
            }
            if set_attr.atime.is_some() || set_attr.mtime.is_some() {
                self.adapter
                    .utimens(path)
                    .map_err(|e| to_errno("utimens", path, e))?;
            }
            self.getattr(req, Some(OsStr::new(path)), None, 0).await
        }

        async fn readlink(&self, _req: Request, path: &OsStr) -> fuse3::Result<ReplyData> {
            let path = path_str(Some(path))?;
            let data = self
                .adapter
                .readlink(path)
                .await
                .map_err(|e| to_errno("readlink", path, e))?;
            Ok(ReplyData { data })
        }

        async fn symlink(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            link_path: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            let path = child(parent, name)?;
            let target = link_path.to_str().ok_or_else(|| Errno::from(libc::EINVAL))?;
            self.adapter
                .symlink(target, &path)
                .await
                .map_err(|e| to_errno("symlink", &path, e))?;
            self.entry("symlink", &path).await
        }

        async fn mknod(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            _mode: u32,
            _rdev: u32,
        ) -> fuse3::Result<ReplyEntry> {
            let path = child(parent, name)?;
            self.adapter
                .mknod(&path)
                .map_err(|e| to_errno("mknod", &path, e))?;
            self.entry("mknod", &path).await
        }

        async fn mkdir(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            _umask: u32,
        ) -> fuse3::Result<ReplyEntry> {
            let path = child(parent, name)?;
            self.adapter
                .mkdir(&path, mode)
                .await
                .map_err(|e| to_errno("mkdir", &path, e))?;
            self.entry("mkdir", &path).await
        }

        async fn unlink(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            let path = child(parent, name)?;
            self.adapter
                .unlink(&path)
                .await
                .map_err(|e| to_errno("unlink", &path, e))
        }

        async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            let path = child(parent, name)?;
            self.adapter
                .rmdir(&path)
                .await
                .map_err(|e| to_errno("rmdir", &path, e))
        }

        async fn rename(
            &self,
            _req: Request,
            origin_parent: &OsStr,
            origin_name: &OsStr,
            parent: &OsStr,
            name: &OsStr,
        ) -> fuse3::Result<()> {
            let src = child(origin_parent, origin_name)?;
            let dst = child(parent, name)?;
            self.adapter
                .rename(&src, &dst)
                .await
                .map_err(|e| to_errno("rename", &src, e))
        }

        async fn link(
            &self,
            _req: Request,
            path: &OsStr,
            new_parent: &OsStr,
            new_name: &OsStr,
        ) -> fuse3::Result<ReplyEntry> {
            let src = path_str(Some(path))?;
            let dst = child(new_parent, new_name)?;
            self.adapter
                .link(src, &dst)
                .map_err(|e| to_errno("link", src, e))?;
            self.entry("link", &dst).await
        }

        async fn open(&self, _req: Request, path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
            let path = path_str(Some(path))?;
            Ok(ReplyOpen {
                fh: self.adapter.open(path),
                flags: 0,
            })
        }

        async fn read(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            _fh: u64,
            offset: u64,
            size: u32,
        ) -> fuse3::Result<ReplyData> {
            let path = path_str(path)?;
            let data = self
                .adapter
                .read(path, size, offset)
                .await
                .map_err(|e| to_errno("read", path, e))?;
            Ok(ReplyData { data })
        }

        async fn write(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: u64,
            offset: u64,
            data: &[u8],
            _write_flags: u32,
            _flags: u32,
        ) -> fuse3::Result<ReplyWrite> {
            let path = path_str(path)?;
            let written = self
                .adapter
                .write(path, fh, data, offset)
                .await
                .map_err(|e| to_errno("write", path, e))?;
            Ok(ReplyWrite {
                written: written as u32,
            })
        }

        async fn statfs(&self, _req: Request, _path: &OsStr) -> fuse3::Result<ReplyStatFs> {
            let s = self.adapter.statfs();
            Ok(ReplyStatFs {
                blocks: s.blocks,
                bfree: s.bfree,
                bavail: s.bavail,
                files: s.files,
                ffree: s.ffree,
                bsize: s.bsize,
                namelen: s.namelen,
                frsize: s.frsize,
            })
        }

        async fn release(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: u64,
            _flags: u32,
            _lock_owner: u64,
            _flush: bool,
        ) -> fuse3::Result<()> {
            let path = path_str(path)?;
            self.adapter
                .release(path, fh)
                .await
                .map_err(|e| to_errno("release", path, e))
        }

        async fn fsync(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: u64,
            _datasync: bool,
        ) -> fuse3::Result<()> {
            let path = path_str(path)?;
            self.adapter
                .fsync(path, fh)
                .map_err(|e| to_errno("fsync", path, e))
        }

        async fn setxattr(
            &self,
            _req: Request,
            path: &OsStr,
            name: &OsStr,
            _value: &[u8],
            _flags: u32,
            _position: u32,
        ) -> fuse3::Result<()> {
            let path = path_str(Some(path))?;
            self.adapter
                .setxattr(path, &name.to_string_lossy())
                .map_err(|e| to_errno("setxattr", path, e))
        }

        async fn getxattr(
            &self,
            _req: Request,
            path: &OsStr,
            name: &OsStr,
            size: u32,
        ) -> fuse3::Result<ReplyXAttr> {
            let path = path_str(Some(path))?;
            let value = self
                .adapter
                .getxattr(path, &name.to_string_lossy())
                .unwrap_or_default();
            if size == 0 {
                Ok(ReplyXAttr::Size(value.len() as u32))
            } else {
                Ok(ReplyXAttr::Data(value))
            }
        }

        async fn listxattr(
            &self,
            _req: Request,
            path: &OsStr,
            size: u32,
        ) -> fuse3::Result<ReplyXAttr> {
            let path = path_str(Some(path))?;
            let mut packed = Vec::new();
            for name in self.adapter.listxattr(path) {
                packed.extend_from_slice(name.as_bytes());
                packed.push(0);
            }
            if size == 0 {
                Ok(ReplyXAttr::Size(packed.len() as u32))
            } else {
                Ok(ReplyXAttr::Data(Bytes::from(packed)))
            }
        }

        async fn removexattr(&self, _req: Request, path: &OsStr, name: &OsStr) -> fuse3::Result<()> {
            let path = path_str(Some(path))?;
            self.adapter
                .removexattr(path, &name.to_string_lossy())
                .map_err(|e| to_errno("removexattr", path, e))
        }

        async fn flush(
            &self,
            _req: Request,
            path: Option<&OsStr>,
            fh: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<()> {
            let path = path_str(path)?;
            self.adapter
                .flush(path, fh)
                .await
                .map_err(|e| to_errno("flush", path, e))
        }

        async fn opendir(&self, _req: Request, path: &OsStr, _flags: u32) -> fuse3::Result<ReplyOpen> {
            let path = path_str(Some(path))?;
            Ok(ReplyOpen {
                fh: self.adapter.opendir(path),
                flags: 0,
            })
        }

        async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> fuse3::Result<()> {
            let path = path_str(Some(path))?;
            self.adapter
                .access(path, mask)
                .map_err(|e| to_errno("access", path, e))
        }

        async fn create(
            &self,
            _req: Request,
            parent: &OsStr,
            name: &OsStr,
            mode: u32,
            _flags: u32,
        ) -> fuse3::Result<ReplyCreated> {
            let path = child(parent, name)?;
            let fh = self
                .adapter
                .create(&path, mode)
                .await
                .map_err(|e| to_errno("create", &path, e))?;
            let stat = self
                .adapter
                .getattr(&path)
                .await
                .map_err(|e| to_errno("create", &path, e))?;
            Ok(ReplyCreated {
                ttl: ATTR_TTL,
                attr: self.attr(&stat),
                generation: 0,
                fh,
                flags: 0,
            })
        }

        // Directory entry stream types
        type DirEntryStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
        where
            Self: 'a;

        type DirEntryPlusStream<'a>
            = stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
        where
            Self: 'a;

        async fn readdir<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: i64,
        ) -> fuse3::Result<ReplyDirectory<Self::DirEntryStream<'a>>> {
            let path = path_str(Some(path))?;
            let children = self.listing(path).await?;

            let mut entries = Vec::new();
            let mut next_offset = 1i64;
            let dots = [".".to_string(), "..".to_string()]
                .into_iter()
                .map(|n| (n, FileType::Directory));
            let named = children.into_iter().map(|(n, attr)| (n, attr.kind));
            for (name, kind) in dots.chain(named) {
                if next_offset > offset {
                    entries.push(Ok(DirectoryEntry {
                        kind,
                        name: name.into(),
                        offset: next_offset,
                    }));
                }
                next_offset += 1;
            }

            Ok(ReplyDirectory {
                entries: stream::iter(entries),
            })
        }

        async fn readdirplus<'a>(
            &'a self,
            _req: Request,
            path: &'a OsStr,
            _fh: u64,
            offset: u64,
            _lock_owner: u64,
        ) -> fuse3::Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>> {
            let path = path_str(Some(path))?;
            let dir_attr = self.attr(&FileStat {
                mode: DEFAULT_DIR_MODE,
                ..FileStat::default()
            });
            let children = self.listing(path).await?;
            let offset = offset as i64;

            let mut entries = Vec::new();
            let mut next_offset = 1i64;
            let dots = [(".".to_string(), dir_attr), ("..".to_string(), dir_attr)];
            for (name, attr) in dots.into_iter().chain(children) {
                if next_offset > offset {
                    entries.push(Ok(DirectoryEntryPlus {
                        kind: attr.kind,
                        name: name.into(),
                        offset: next_offset,
                        attr,
                        entry_ttl: ATTR_TTL,
                        attr_ttl: ATTR_TTL,
                    }));
                }
                next_offset += 1;
            }

            Ok(ReplyDirectoryPlus {
                entries: stream::iter(entries),
            })
        }
    }

    // ── Public mount API ──────────────────────────────────────────────────────

    pub struct MountConfig {
        pub adapter: Arc<WriteBufferAdapter>,
        pub mountpoint: PathBuf,
        pub allow_other: bool,
    }

    /// Mount the FUSE filesystem and block until unmounted.
    ///
    /// Returns when the filesystem is unmounted (e.g. via
    /// `fusermount3 -u <mountpoint>`).
    pub async fn mount(cfg: MountConfig) -> std::io::Result<()> {
        let fs = FilerFs::new(cfg.adapter);

        let mut opts = MountOptions::default();
        opts.fs_name("filer");
        opts.force_readdir_plus(true);
        if cfg.allow_other {
            opts.allow_other(true);
        }

        info!(mountpoint = %cfg.mountpoint.display(), "mounting filer (unprivileged via fusermount3)");

        let handle = Session::new(opts)
            .mount_with_unprivileged(fs, &cfg.mountpoint)
            .await?;

        handle.await
    }
}

#[cfg(feature = "fuse")]
pub use inner::{mount, FilerFs, MountConfig};
