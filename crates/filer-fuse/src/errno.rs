//! FilerError → POSIX errno at the FUSE boundary.

use filer_core::{FilerError, FilerResult};

/// Positive errno for `err`.
pub fn errno(err: &FilerError) -> i32 {
    match err {
        FilerError::NotFound(_) => libc::ENOENT,
        FilerError::Io(_) | FilerError::Mount(_) | FilerError::Other(_) => libc::EIO,
        FilerError::Timeout { .. } => libc::ETIMEDOUT,
        FilerError::Unsupported(_) => libc::ENOSYS,
        FilerError::InvalidState(_) | FilerError::Config(_) => libc::EINVAL,
        FilerError::AlreadyExists(_) => libc::EEXIST,
        FilerError::NotEmpty(_) => libc::ENOTEMPTY,
        FilerError::IsDirectory(_) => libc::EISDIR,
        FilerError::NotDirectory(_) => libc::ENOTDIR,
        FilerError::BadHandle(_) => libc::EBADF,
        FilerError::LocalIo(e) => e.raw_os_error().unwrap_or(libc::EIO),
        FilerError::Shared(inner) => errno(inner),
    }
}

/// `0` on success, `-errno` on failure.
pub fn status<T>(result: &FilerResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => -errno(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn common_mappings() {
        assert_eq!(errno(&FilerError::NotFound("/x".into())), libc::ENOENT);
        assert_eq!(errno(&FilerError::timeout("read", Duration::from_secs(1))), libc::ETIMEDOUT);
        assert_eq!(errno(&FilerError::Unsupported("link".into())), libc::ENOSYS);
        assert_eq!(errno(&FilerError::NotEmpty("/d".into())), libc::ENOTEMPTY);
        assert_eq!(errno(&FilerError::AlreadyExists("/d".into())), libc::EEXIST);
        assert_eq!(errno(&FilerError::BadHandle(12)), libc::EBADF);
    }

    #[test]
    fn local_io_keeps_os_code_and_shared_unwraps() {
        let io = std::io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(errno(&FilerError::LocalIo(io)), libc::EACCES);
        let shared = FilerError::Shared(Arc::new(FilerError::NotFound("/a".into())));
        assert_eq!(errno(&shared), libc::ENOENT);
    }

    #[test]
    fn status_is_negative_errno() {
        assert_eq!(status::<()>(&Ok(())), 0);
        assert_eq!(status::<()>(&Err(FilerError::Io("x".into()))), -libc::EIO);
    }
}
