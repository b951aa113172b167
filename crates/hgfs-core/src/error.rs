// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types for the HGFS server core

use hgfs_proto::HgfsStatus;
use std::io;

/// Core server error type
#[derive(thiserror::Error, Debug)]
pub enum HgfsError {
    #[error("protocol error")]
    Protocol,
    #[error("not found")]
    NotFound,
    #[error("already exists")]
    AlreadyExists,
    #[error("access denied")]
    AccessDenied,
    #[error("invalid name")]
    InvalidName,
    #[error("name too long")]
    NameTooLong,
    #[error("not a directory")]
    NotADirectory,
    #[error("is a directory")]
    IsADirectory,
    #[error("symlink loop")]
    SymlinkLoop,
    #[error("directory not empty")]
    NotEmpty,
    #[error("busy")]
    Busy,
    #[error("too many open files")]
    TooManyOpenFiles,
    #[error("invalid handle")]
    InvalidHandle,
    #[error("no space left")]
    NoSpace,
    #[error("crosses devices")]
    NotSameDevice,
    #[error("too many sessions")]
    TooManySessions,
    #[error("stale session")]
    StaleSession,
    #[error("unsupported")]
    Unsupported,
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("internal error")]
    Internal,
}

pub type FsResult<T> = Result<T, HgfsError>;

impl HgfsError {
    /// Maps a core error to the wire status carried in the reply header.
    /// This is the only place errors become protocol-visible.
    pub fn to_status(&self) -> HgfsStatus {
        match self {
            HgfsError::Protocol => HgfsStatus::ProtocolError,
            HgfsError::NotFound => HgfsStatus::NoSuchFileOrDir,
            HgfsError::AlreadyExists => HgfsStatus::FileExists,
            HgfsError::AccessDenied => HgfsStatus::AccessDenied,
            HgfsError::InvalidName => HgfsStatus::InvalidName,
            HgfsError::NameTooLong => HgfsStatus::NameTooLong,
            HgfsError::NotADirectory => HgfsStatus::NotDirectory,
            HgfsError::IsADirectory => HgfsStatus::NotDirectory,
            HgfsError::SymlinkLoop => HgfsStatus::AccessDenied,
            HgfsError::NotEmpty => HgfsStatus::DirNotEmpty,
            HgfsError::Busy => HgfsStatus::SharingViolation,
            HgfsError::TooManyOpenFiles => HgfsStatus::InvalidHandle,
            HgfsError::InvalidHandle => HgfsStatus::InvalidHandle,
            HgfsError::NoSpace => HgfsStatus::NoSpace,
            HgfsError::NotSameDevice => HgfsStatus::NotSameDevice,
            HgfsError::TooManySessions => HgfsStatus::TooManySessions,
            HgfsError::StaleSession => HgfsStatus::StaleSession,
            HgfsError::Unsupported => HgfsStatus::OperationNotSupported,
            HgfsError::Io(e) => io_to_status(e),
            HgfsError::Internal => HgfsStatus::GenericError,
        }
    }

    /// Central errno translation for name resolution and platform calls.
    /// Collapses the OS error space to the closed set the protocol speaks;
    /// anything outside it becomes a generic error.
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => HgfsError::NotFound,
            libc::EEXIST => HgfsError::AlreadyExists,
            libc::EACCES | libc::EPERM => HgfsError::AccessDenied,
            libc::ENOTDIR => HgfsError::NotADirectory,
            libc::EISDIR => HgfsError::IsADirectory,
            libc::ELOOP => HgfsError::SymlinkLoop,
            libc::ENAMETOOLONG => HgfsError::NameTooLong,
            libc::ENOTEMPTY => HgfsError::NotEmpty,
            libc::EBUSY | libc::ETXTBSY => HgfsError::Busy,
            libc::EMFILE | libc::ENFILE => HgfsError::TooManyOpenFiles,
            libc::EBADF => HgfsError::InvalidHandle,
            libc::ENOSPC | libc::EDQUOT => HgfsError::NoSpace,
            libc::EXDEV => HgfsError::NotSameDevice,
            libc::ENOMEM => HgfsError::Internal,
            _ => HgfsError::Io(io::Error::from_raw_os_error(errno)),
        }
    }
}

fn io_to_status(e: &io::Error) -> HgfsStatus {
    match e.raw_os_error() {
        Some(errno) => HgfsError::from_errno(errno).to_status_no_io(),
        None => HgfsStatus::GenericError,
    }
}

impl HgfsError {
    // Avoids recursing through Io when the errno maps back to Io.
    fn to_status_no_io(&self) -> HgfsStatus {
        match self {
            HgfsError::Io(_) => HgfsStatus::GenericError,
            other => other.to_status(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_maps_to_closed_set() {
        assert!(matches!(
            HgfsError::from_errno(libc::ENOENT),
            HgfsError::NotFound
        ));
        assert!(matches!(
            HgfsError::from_errno(libc::ELOOP),
            HgfsError::SymlinkLoop
        ));
        assert!(matches!(
            HgfsError::from_errno(libc::EXDEV),
            HgfsError::NotSameDevice
        ));
    }

    #[test]
    fn unknown_errno_becomes_generic_status() {
        let err = HgfsError::from_errno(libc::EPIPE);
        assert_eq!(err.to_status(), HgfsStatus::GenericError);
    }

    #[test]
    fn io_error_status_uses_raw_os_error() {
        let err = HgfsError::Io(io::Error::from_raw_os_error(libc::ENOSPC));
        assert_eq!(err.to_status(), HgfsStatus::NoSpace);
    }
}
