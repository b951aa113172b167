// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core type definitions and collaborator traits for the HGFS server

use std::path::{Path, PathBuf};

use crate::error::FsResult;
use hgfs_proto::OpenMode;

/// Opaque protocol handle for an open file or an open search.
///
/// Encodes `(index, generation)`: the low 32 bits index the owning
/// session's handle table, the high 32 bits carry the slot generation. A
/// lookup whose generation does not match the slot's current generation is
/// treated as an invalid handle, so a handle released and reallocated can
/// never alias its predecessor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HgfsHandle(pub u64);

impl HgfsHandle {
    pub fn new(index: u32, generation: u32) -> Self {
        Self((generation as u64) << 32 | index as u64)
    }

    pub fn index(self) -> u32 {
        self.0 as u32
    }

    pub fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

/// Session identifier, unique across the process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

/// Opaque platform file descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileDesc(pub u64);

/// Local file identity, used to detect a path being replaced underneath a
/// cached descriptor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileId {
    pub volume: u64,
    pub file: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

/// File attributes as reported by the platform backend.
#[derive(Clone, Copy, Debug)]
pub struct Attributes {
    pub file_type: FileType,
    pub size: u64,
    pub perms: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: u64,
    pub mtime: u64,
    pub ctime: u64,
    pub id: FileId,
}

/// Directory entry returned by a platform scan.
#[derive(Clone, Debug)]
pub struct DirEntry {
    pub name: String,
    pub file_type: FileType,
}

/// Volume statistics for query-volume replies.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub free_bytes: u64,
    pub total_bytes: u64,
}

/// Granted server lock held by an open file node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ServerLock {
    #[default]
    None,
    Shared,
    Exclusive,
}

/// Target of a setattr sub-operation: an open descriptor when the request
/// addressed a handle, otherwise the resolved local path.
#[derive(Clone, Debug)]
pub enum AttrTarget {
    Path(PathBuf),
    Fd(FileDesc),
}

/// Write permission of a share.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShareAccess {
    ReadOnly,
    ReadWrite,
}

/// Per-OS filesystem backend. Every blocking syscall the core needs goes
/// through this seam; the core itself never touches the OS directly.
///
/// Attribute changes are split into independent sub-operations on purpose:
/// a multi-field setattr applies each requested change separately and
/// reports the last failure while keeping the ones that succeeded.
#[cfg_attr(test, mockall::automock)]
pub trait Platform: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode, flags: u32, permissions: u32)
        -> FsResult<FileDesc>;
    fn close(&self, fd: FileDesc) -> FsResult<()>;
    fn read(&self, fd: FileDesc, offset: u64, len: u32) -> FsResult<Vec<u8>>;
    fn write(&self, fd: FileDesc, offset: u64, data: &[u8], append: bool) -> FsResult<u32>;

    fn getattr_by_name(&self, path: &Path, follow_symlinks: bool) -> FsResult<Attributes>;
    fn getattr_by_fd(&self, fd: FileDesc) -> FsResult<Attributes>;
    fn readlink(&self, path: &Path) -> FsResult<PathBuf>;

    fn set_size(&self, target: &AttrTarget, size: u64) -> FsResult<()>;
    fn set_mode(&self, target: &AttrTarget, perms: u32) -> FsResult<()>;
    fn set_owner(&self, target: &AttrTarget, uid: Option<u32>, gid: Option<u32>) -> FsResult<()>;
    fn set_times(&self, target: &AttrTarget, atime: Option<u64>, mtime: Option<u64>)
        -> FsResult<()>;

    fn scandir(&self, path: &Path, follow_symlinks: bool) -> FsResult<Vec<DirEntry>>;
    fn create_dir(&self, path: &Path, permissions: u32) -> FsResult<()>;
    fn create_symlink(&self, link: &Path, target: &Path) -> FsResult<()>;
    fn rename(&self, from: &Path, to: &Path) -> FsResult<()>;
    fn delete_file(&self, path: &Path) -> FsResult<()>;
    fn delete_dir(&self, path: &Path) -> FsResult<()>;
    fn statfs(&self, path: &Path) -> FsResult<VolumeInfo>;
}

/// Share configuration lookup. Resolves share names from the wire to local
/// roots and permissions; the core never parses share configuration itself.
#[cfg_attr(test, mockall::automock)]
pub trait SharePolicy: Send + Sync {
    fn share_root(&self, share_name: &str) -> FsResult<PathBuf>;
    fn share_access(&self, share_name: &str) -> FsResult<ShareAccess>;
    fn follow_symlinks(&self, share_name: &str) -> bool;
    fn enumerate_shares(&self) -> Vec<String>;
}

/// OS lease integration for the oplock coordinator. Acquisition must be
/// non-blocking; contention is reported as an error, not waited out.
#[cfg_attr(test, mockall::automock)]
pub trait LeaseBackend: Send + Sync {
    fn try_acquire(&self, fd: FileDesc, lock: ServerLock) -> FsResult<()>;
    fn downgrade(&self, fd: FileDesc, lock: ServerLock) -> FsResult<()>;
    fn release(&self, fd: FileDesc) -> FsResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_encodes_index_and_generation() {
        let h = HgfsHandle::new(7, 3);
        assert_eq!(h.index(), 7);
        assert_eq!(h.generation(), 3);
        assert_ne!(HgfsHandle::new(7, 3), HgfsHandle::new(7, 4));
    }
}
