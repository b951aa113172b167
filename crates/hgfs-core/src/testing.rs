// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! In-memory test doubles for the platform and share-policy seams
//!
//! [`TestPlatform`] keeps a whole file tree in a mutex-guarded map and
//! counts the calls the server makes, which lets tests assert on cache
//! behavior (stat counts) and descriptor lifecycle (close counts) without
//! touching a real filesystem.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{FsResult, HgfsError};
use crate::types::{
    AttrTarget, Attributes, DirEntry, FileDesc, FileId, FileType, Platform, SharePolicy,
    ShareAccess, VolumeInfo,
};
use hgfs_proto::{OpenMode, OPEN_CREATE, OPEN_EXCLUSIVE, OPEN_TRUNCATE};

#[derive(Clone)]
struct Entry {
    kind: FileType,
    data: Vec<u8>,
    perms: u32,
    uid: u32,
    gid: u32,
    atime: u64,
    mtime: u64,
    ctime: u64,
    id: FileId,
    link: Option<PathBuf>,
}

struct OpenFd {
    path: PathBuf,
}

struct State {
    files: BTreeMap<PathBuf, Entry>,
    fds: HashMap<u64, OpenFd>,
    next_fd: u64,
    next_file: u64,
    stat_calls: usize,
    close_calls: usize,
    volume: VolumeInfo,
}

/// In-memory [`Platform`] implementation.
pub struct TestPlatform {
    state: Mutex<State>,
}

impl TestPlatform {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                files: BTreeMap::new(),
                fds: HashMap::new(),
                next_fd: 100,
                next_file: 1,
                stat_calls: 0,
                close_calls: 0,
                volume: VolumeInfo {
                    free_bytes: 1 << 30,
                    total_bytes: 1 << 31,
                },
            }),
        }
    }

    fn fresh_entry(state: &mut State, kind: FileType, perms: u32) -> Entry {
        let id = FileId {
            volume: 1,
            file: state.next_file,
        };
        state.next_file += 1;
        Entry {
            kind,
            data: Vec::new(),
            perms,
            uid: 0,
            gid: 0,
            atime: 0,
            mtime: 0,
            ctime: 0,
            id,
            link: None,
        }
    }

    pub fn add_dir(&self, path: &str) {
        let mut state = self.state.lock().unwrap();
        let entry = Self::fresh_entry(&mut state, FileType::Directory, 0o755);
        state.files.insert(PathBuf::from(path), entry);
    }

    pub fn add_file(&self, path: &str, data: &[u8]) {
        let mut state = self.state.lock().unwrap();
        let mut entry = Self::fresh_entry(&mut state, FileType::Regular, 0o644);
        entry.data = data.to_vec();
        state.files.insert(PathBuf::from(path), entry);
    }

    pub fn add_symlink(&self, path: &str, target: &str) {
        let mut state = self.state.lock().unwrap();
        let mut entry = Self::fresh_entry(&mut state, FileType::Symlink, 0o777);
        entry.link = Some(PathBuf::from(target));
        state.files.insert(PathBuf::from(path), entry);
    }

    /// Replaces a file with new contents under a new file id, as an
    /// external rename-over would.
    pub fn replace_file(&self, path: &str, data: &[u8]) {
        self.add_file(path, data);
    }

    pub fn stat_calls(&self) -> usize {
        self.state.lock().unwrap().stat_calls
    }

    pub fn close_calls(&self) -> usize {
        self.state.lock().unwrap().close_calls
    }

    pub fn set_volume_info(&self, volume: VolumeInfo) {
        self.state.lock().unwrap().volume = volume;
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .files
            .get(Path::new(path))
            .map(|e| e.data.clone())
    }

    fn attrs(entry: &Entry) -> Attributes {
        // symlinks stat as the length of their target path
        let size = match &entry.link {
            Some(target) => target.as_os_str().len() as u64,
            None => entry.data.len() as u64,
        };
        Attributes {
            file_type: entry.kind,
            size,
            perms: entry.perms,
            uid: entry.uid,
            gid: entry.gid,
            atime: entry.atime,
            mtime: entry.mtime,
            ctime: entry.ctime,
            id: entry.id,
        }
    }

    fn target_path(state: &State, target: &AttrTarget) -> FsResult<PathBuf> {
        match target {
            AttrTarget::Path(p) => Ok(p.clone()),
            AttrTarget::Fd(fd) => state
                .fds
                .get(&fd.0)
                .map(|f| f.path.clone())
                .ok_or(HgfsError::InvalidHandle),
        }
    }

    fn with_entry<R>(
        &self,
        target: &AttrTarget,
        f: impl FnOnce(&mut Entry) -> R,
    ) -> FsResult<R> {
        let mut state = self.state.lock().unwrap();
        let path = Self::target_path(&state, target)?;
        let entry = state.files.get_mut(&path).ok_or(HgfsError::NotFound)?;
        Ok(f(entry))
    }
}

impl Default for TestPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for TestPlatform {
    fn open(
        &self,
        path: &Path,
        _mode: OpenMode,
        flags: u32,
        permissions: u32,
    ) -> FsResult<FileDesc> {
        let mut state = self.state.lock().unwrap();
        match state.files.get(path) {
            Some(entry) => {
                if flags & OPEN_CREATE != 0 && flags & OPEN_EXCLUSIVE != 0 {
                    return Err(HgfsError::AlreadyExists);
                }
                if entry.kind == FileType::Directory {
                    return Err(HgfsError::IsADirectory);
                }
                if flags & OPEN_TRUNCATE != 0 {
                    state.files.get_mut(path).unwrap().data.clear();
                }
            }
            None => {
                if flags & OPEN_CREATE == 0 {
                    return Err(HgfsError::NotFound);
                }
                let entry = Self::fresh_entry(&mut state, FileType::Regular, permissions);
                state.files.insert(path.to_path_buf(), entry);
            }
        }
        let fd = state.next_fd;
        state.next_fd += 1;
        state.fds.insert(
            fd,
            OpenFd {
                path: path.to_path_buf(),
            },
        );
        Ok(FileDesc(fd))
    }

    fn close(&self, fd: FileDesc) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        state.close_calls += 1;
        state
            .fds
            .remove(&fd.0)
            .map(|_| ())
            .ok_or(HgfsError::InvalidHandle)
    }

    fn read(&self, fd: FileDesc, offset: u64, len: u32) -> FsResult<Vec<u8>> {
        let state = self.state.lock().unwrap();
        let open = state.fds.get(&fd.0).ok_or(HgfsError::InvalidHandle)?;
        let entry = state.files.get(&open.path).ok_or(HgfsError::NotFound)?;
        let start = (offset as usize).min(entry.data.len());
        let end = (start + len as usize).min(entry.data.len());
        Ok(entry.data[start..end].to_vec())
    }

    fn write(&self, fd: FileDesc, offset: u64, data: &[u8], append: bool) -> FsResult<u32> {
        let mut state = self.state.lock().unwrap();
        let path = state
            .fds
            .get(&fd.0)
            .map(|f| f.path.clone())
            .ok_or(HgfsError::InvalidHandle)?;
        let entry = state.files.get_mut(&path).ok_or(HgfsError::NotFound)?;
        if append {
            entry.data.extend_from_slice(data);
        } else {
            let end = offset as usize + data.len();
            if entry.data.len() < end {
                entry.data.resize(end, 0);
            }
            entry.data[offset as usize..end].copy_from_slice(data);
        }
        entry.mtime += 1;
        Ok(data.len() as u32)
    }

    fn getattr_by_name(&self, path: &Path, _follow_symlinks: bool) -> FsResult<Attributes> {
        let mut state = self.state.lock().unwrap();
        state.stat_calls += 1;
        state
            .files
            .get(path)
            .map(Self::attrs)
            .ok_or(HgfsError::NotFound)
    }

    fn getattr_by_fd(&self, fd: FileDesc) -> FsResult<Attributes> {
        let state = self.state.lock().unwrap();
        let open = state.fds.get(&fd.0).ok_or(HgfsError::InvalidHandle)?;
        state
            .files
            .get(&open.path)
            .map(Self::attrs)
            .ok_or(HgfsError::NotFound)
    }

    fn readlink(&self, path: &Path) -> FsResult<PathBuf> {
        let state = self.state.lock().unwrap();
        let entry = state.files.get(path).ok_or(HgfsError::NotFound)?;
        entry.link.clone().ok_or(HgfsError::Unsupported)
    }

    fn set_size(&self, target: &AttrTarget, size: u64) -> FsResult<()> {
        self.with_entry(target, |e| e.data.resize(size as usize, 0))
    }

    fn set_mode(&self, target: &AttrTarget, perms: u32) -> FsResult<()> {
        self.with_entry(target, |e| e.perms = perms)
    }

    fn set_owner(&self, target: &AttrTarget, uid: Option<u32>, gid: Option<u32>) -> FsResult<()> {
        self.with_entry(target, |e| {
            if let Some(uid) = uid {
                e.uid = uid;
            }
            if let Some(gid) = gid {
                e.gid = gid;
            }
        })
    }

    fn set_times(
        &self,
        target: &AttrTarget,
        atime: Option<u64>,
        mtime: Option<u64>,
    ) -> FsResult<()> {
        self.with_entry(target, |e| {
            if let Some(atime) = atime {
                e.atime = atime;
            }
            if let Some(mtime) = mtime {
                e.mtime = mtime;
            }
        })
    }

    fn scandir(&self, path: &Path, _follow_symlinks: bool) -> FsResult<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        let dir = state.files.get(path).ok_or(HgfsError::NotFound)?;
        if dir.kind != FileType::Directory {
            return Err(HgfsError::NotADirectory);
        }
        // BTreeMap iteration keeps entries name-sorted
        let entries = state
            .files
            .iter()
            .filter(|(p, _)| p.parent() == Some(path))
            .map(|(p, e)| DirEntry {
                name: p.file_name().unwrap().to_string_lossy().into_owned(),
                file_type: e.kind,
            })
            .collect();
        Ok(entries)
    }

    fn create_dir(&self, path: &Path, permissions: u32) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(path) {
            return Err(HgfsError::AlreadyExists);
        }
        let entry = Self::fresh_entry(&mut state, FileType::Directory, permissions);
        state.files.insert(path.to_path_buf(), entry);
        Ok(())
    }

    fn create_symlink(&self, link: &Path, target: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        if state.files.contains_key(link) {
            return Err(HgfsError::AlreadyExists);
        }
        let mut entry = Self::fresh_entry(&mut state, FileType::Symlink, 0o777);
        entry.link = Some(target.to_path_buf());
        state.files.insert(link.to_path_buf(), entry);
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.files.remove(from).ok_or(HgfsError::NotFound)?;
        state.files.insert(to.to_path_buf(), entry);
        // carry children of a renamed directory along
        let prefix = from.to_path_buf();
        let moved: Vec<(PathBuf, Entry)> = state
            .files
            .iter()
            .filter(|(p, _)| p.starts_with(&prefix) && **p != prefix)
            .map(|(p, e)| (p.clone(), e.clone()))
            .collect();
        for (old, entry) in moved {
            state.files.remove(&old);
            let rel = old.strip_prefix(&prefix).unwrap().to_path_buf();
            state.files.insert(to.join(rel), entry);
        }
        Ok(())
    }

    fn delete_file(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.files.get(path).ok_or(HgfsError::NotFound)?;
        if entry.kind == FileType::Directory {
            return Err(HgfsError::IsADirectory);
        }
        state.files.remove(path);
        Ok(())
    }

    fn delete_dir(&self, path: &Path) -> FsResult<()> {
        let mut state = self.state.lock().unwrap();
        let entry = state.files.get(path).ok_or(HgfsError::NotFound)?;
        if entry.kind != FileType::Directory {
            return Err(HgfsError::NotADirectory);
        }
        if state.files.keys().any(|p| p.parent() == Some(path)) {
            return Err(HgfsError::NotEmpty);
        }
        state.files.remove(path);
        Ok(())
    }

    fn statfs(&self, _path: &Path) -> FsResult<VolumeInfo> {
        Ok(self.state.lock().unwrap().volume)
    }
}

struct ShareDef {
    root: PathBuf,
    access: ShareAccess,
    follow_symlinks: bool,
}

/// Fixed share table for tests.
pub struct StaticSharePolicy {
    shares: BTreeMap<String, ShareDef>,
}

impl StaticSharePolicy {
    pub fn new() -> Self {
        Self {
            shares: BTreeMap::new(),
        }
    }

    pub fn add_share(&mut self, name: &str, root: &str, access: ShareAccess, follow: bool) {
        self.shares.insert(
            name.to_string(),
            ShareDef {
                root: PathBuf::from(root),
                access,
                follow_symlinks: follow,
            },
        );
    }
}

impl Default for StaticSharePolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl SharePolicy for StaticSharePolicy {
    fn share_root(&self, share_name: &str) -> FsResult<PathBuf> {
        self.shares
            .get(share_name)
            .map(|s| s.root.clone())
            .ok_or(HgfsError::NotFound)
    }

    fn share_access(&self, share_name: &str) -> FsResult<ShareAccess> {
        self.shares
            .get(share_name)
            .map(|s| s.access)
            .ok_or(HgfsError::NotFound)
    }

    fn follow_symlinks(&self, share_name: &str) -> bool {
        self.shares
            .get(share_name)
            .map(|s| s.follow_symlinks)
            .unwrap_or(false)
    }

    fn enumerate_shares(&self) -> Vec<String> {
        self.shares.keys().cloned().collect()
    }
}
