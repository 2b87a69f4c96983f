// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for mapfs core

use std::io;

/// Core filesystem error type
#[derive(thiserror::Error, Debug)]
pub enum FsError {
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    /// Mutation attempted through a node whose mapping is not writable.
    #[error("permission denied: mapping is read-only")]
    PermissionDenied,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("directory not empty")]
    NotEmpty,
    #[error("io error: {0}")]
    Io(io::Error),
    #[error("unsupported")]
    Unsupported,
}

pub type FsResult<T> = Result<T, FsError>;

impl FsError {
    pub fn invalid(msg: impl Into<String>) -> Self {
        FsError::InvalidArgument(msg.into())
    }

    /// Error code reported back to the kernel for this error.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::AlreadyExists => libc::EEXIST,
            FsError::AccessDenied => libc::EACCES,
            FsError::PermissionDenied => libc::EPERM,
            FsError::InvalidArgument(_) => libc::EINVAL,
            FsError::NotADirectory => libc::ENOTDIR,
            FsError::IsADirectory => libc::EISDIR,
            FsError::NotEmpty => libc::ENOTEMPTY,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::Unsupported => libc::ENOSYS,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound)
    }
}

impl From<io::Error> for FsError {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ENOENT) => return FsError::NotFound,
            Some(libc::EEXIST) => return FsError::AlreadyExists,
            Some(libc::EACCES) => return FsError::AccessDenied,
            Some(libc::ENOTDIR) => return FsError::NotADirectory,
            Some(libc::EISDIR) => return FsError::IsADirectory,
            Some(libc::ENOTEMPTY) => return FsError::NotEmpty,
            Some(_) => return FsError::Io(err),
            None => {}
        }
        match err.kind() {
            io::ErrorKind::NotFound => FsError::NotFound,
            io::ErrorKind::AlreadyExists => FsError::AlreadyExists,
            io::ErrorKind::PermissionDenied => FsError::AccessDenied,
            _ => FsError::Io(err),
        }
    }
}

impl From<nix::errno::Errno> for FsError {
    fn from(errno: nix::errno::Errno) -> Self {
        FsError::from(io::Error::from_raw_os_error(errno as i32))
    }
}
