// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle tables: the per-session pools of open files and open searches
//!
//! Both tables are arenas addressed by generation-checked handles. A slot
//! carries a generation counter that is bumped when the slot is released;
//! a stale handle therefore fails the generation check and is
//! indistinguishable from one that never existed. Free slots are reused
//! LIFO.
//!
//! The node table additionally tracks the cached-open-node set: nodes
//! whose platform descriptor is kept open between requests. Admission past
//! the soft limit selects the least-recently-cached unlocked node for
//! eviction and hands its descriptor back to the caller, which must close
//! it only after dropping the table lock.

use std::collections::VecDeque;
use std::path::PathBuf;

use crate::error::{FsResult, HgfsError};
use crate::types::{DirEntry, FileDesc, FileId, HgfsHandle, ServerLock, ShareAccess};
use hgfs_proto::OpenMode;

/// Lifecycle of a file-node slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeState {
    /// Freshly allocated; descriptor open but not tracked by the cache.
    InUseNotCached,
    /// Descriptor additionally tracked by the cached-open-node set.
    InUseCached,
}

/// One open file.
#[derive(Debug)]
pub struct FileNode {
    pub path: PathBuf,
    pub share: String,
    pub share_access: ShareAccess,
    /// Device and inode pair captured at open; compared against a fresh
    /// stat before the cached descriptor is reused.
    pub id: FileId,
    pub fd: Option<FileDesc>,
    pub mode: OpenMode,
    pub flags: u32,
    pub append: bool,
    pub server_lock: ServerLock,
    pub state: NodeState,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SearchKind {
    /// Real directory, entries populated by a platform scan.
    Dir,
    /// The share-list root; entries come from the policy enumerator.
    Base,
    /// Synthetic directory with no on-disk analog.
    Other,
}

/// One open directory enumeration. Entries are populated once at
/// search-open and consumed by search-read; `dents` only shrinks.
#[derive(Debug)]
pub struct SearchNode {
    pub path: PathBuf,
    pub share: String,
    pub kind: SearchKind,
    pub dents: VecDeque<DirEntry>,
}

struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Generation-checked arena shared by both tables.
pub struct HandleTable<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    max: usize,
}

impl<T> HandleTable<T> {
    pub fn new(max: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            max,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn allocate(&mut self, value: T) -> FsResult<HgfsHandle> {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            debug_assert!(slot.value.is_none());
            slot.value = Some(value);
            return Ok(HgfsHandle::new(index, slot.generation));
        }
        if self.slots.len() >= self.max {
            return Err(HgfsError::TooManyOpenFiles);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            value: Some(value),
        });
        Ok(HgfsHandle::new(index, 0))
    }

    fn slot(&self, handle: HgfsHandle) -> FsResult<&Slot<T>> {
        let slot = self
            .slots
            .get(handle.index() as usize)
            .ok_or(HgfsError::InvalidHandle)?;
        if slot.generation != handle.generation() || slot.value.is_none() {
            return Err(HgfsError::InvalidHandle);
        }
        Ok(slot)
    }

    pub fn get(&self, handle: HgfsHandle) -> FsResult<&T> {
        Ok(self.slot(handle)?.value.as_ref().unwrap())
    }

    pub fn get_mut(&mut self, handle: HgfsHandle) -> FsResult<&mut T> {
        self.slot(handle)?;
        Ok(self.slots[handle.index() as usize].value.as_mut().unwrap())
    }

    /// Frees the slot, bumping its generation so the handle (and any stale
    /// copy of it) can never resolve again.
    pub fn release(&mut self, handle: HgfsHandle) -> FsResult<T> {
        self.slot(handle)?;
        let slot = &mut self.slots[handle.index() as usize];
        let value = slot.value.take().unwrap();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index());
        Ok(value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (HgfsHandle, &T)> {
        self.slots.iter().enumerate().filter_map(|(i, slot)| {
            slot.value
                .as_ref()
                .map(|v| (HgfsHandle::new(i as u32, slot.generation), v))
        })
    }

    /// Removes every live entry; used at session teardown.
    pub fn drain_all(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if let Some(value) = slot.value.take() {
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(i as u32);
                out.push(value);
            }
        }
        out
    }
}

/// Node table plus the cached-open-node discipline.
pub struct NodeTable {
    table: HandleTable<FileNode>,
    /// Cached handles, least-recently-cached at the front.
    cached: VecDeque<HgfsHandle>,
    num_locked: usize,
    max_cached: usize,
}

impl NodeTable {
    pub fn new(max_nodes: usize, max_cached: usize) -> Self {
        Self {
            table: HandleTable::new(max_nodes),
            cached: VecDeque::new(),
            num_locked: 0,
            max_cached,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn num_cached(&self) -> usize {
        self.cached.len()
    }

    pub fn num_locked(&self) -> usize {
        self.num_locked
    }

    pub fn allocate(&mut self, node: FileNode) -> FsResult<HgfsHandle> {
        debug_assert_eq!(node.state, NodeState::InUseNotCached);
        self.table.allocate(node)
    }

    pub fn get(&self, handle: HgfsHandle) -> FsResult<&FileNode> {
        self.table.get(handle)
    }

    pub fn get_mut(&mut self, handle: HgfsHandle) -> FsResult<&mut FileNode> {
        self.table.get_mut(handle)
    }

    /// Admits `handle` into the cached set (or refreshes its recency).
    /// When the soft limit is exceeded, the least-recently-cached unlocked
    /// node is uncached and its descriptor returned; the caller closes it
    /// after releasing the table lock. A locked node is never evicted.
    pub fn admit_cached(
        &mut self,
        handle: HgfsHandle,
    ) -> FsResult<Option<(HgfsHandle, FileDesc)>> {
        let node = self.table.get_mut(handle)?;
        match node.state {
            NodeState::InUseCached => {
                // refresh recency
                if let Some(pos) = self.cached.iter().position(|&h| h == handle) {
                    self.cached.remove(pos);
                }
                self.cached.push_back(handle);
                return Ok(None);
            }
            NodeState::InUseNotCached => {
                node.state = NodeState::InUseCached;
                if node.server_lock != ServerLock::None {
                    self.num_locked += 1;
                }
                self.cached.push_back(handle);
            }
        }

        if self.cached.len() <= self.max_cached {
            return Ok(None);
        }
        // evict the oldest unlocked cached node, skipping locked ones; the
        // node just admitted is not a candidate
        let victim_pos = self.cached.iter().position(|&h| {
            h != handle
                && self
                    .table
                    .get(h)
                    .map(|n| n.server_lock == ServerLock::None)
                    .unwrap_or(false)
        });
        let Some(pos) = victim_pos else {
            // every cached node is locked; tolerate exceeding the soft limit
            return Ok(None);
        };
        let victim = self.cached.remove(pos).unwrap();
        let node = self.table.get_mut(victim)?;
        node.state = NodeState::InUseNotCached;
        let fd = node.fd.take();
        Ok(fd.map(|fd| (victim, fd)))
    }

    /// Removes `handle` from the cached set without releasing the slot.
    pub fn uncache(&mut self, handle: HgfsHandle) -> FsResult<()> {
        let node = self.table.get_mut(handle)?;
        if node.state == NodeState::InUseCached {
            node.state = NodeState::InUseNotCached;
            if node.server_lock != ServerLock::None {
                self.num_locked -= 1;
            }
            if let Some(pos) = self.cached.iter().position(|&h| h == handle) {
                self.cached.remove(pos);
            }
        }
        Ok(())
    }

    /// Updates a node's granted lock, keeping the locked-cached counter in
    /// step.
    pub fn set_lock(&mut self, handle: HgfsHandle, lock: ServerLock) -> FsResult<()> {
        let node = self.table.get_mut(handle)?;
        let cached = node.state == NodeState::InUseCached;
        let was_locked = node.server_lock != ServerLock::None;
        let is_locked = lock != ServerLock::None;
        node.server_lock = lock;
        if cached {
            match (was_locked, is_locked) {
                (false, true) => self.num_locked += 1,
                (true, false) => self.num_locked -= 1,
                _ => {}
            }
        }
        Ok(())
    }

    /// Frees the slot and returns the node; the caller owns the descriptor
    /// cleanup.
    pub fn release(&mut self, handle: HgfsHandle) -> FsResult<FileNode> {
        self.uncache(handle)?;
        self.table.release(handle)
    }

    /// True when any other live node on the same file holds an exclusive
    /// server lock.
    pub fn locked_elsewhere(&self, handle: HgfsHandle, id: FileId) -> bool {
        self.table.iter().any(|(h, node)| {
            h != handle && node.id == id && node.server_lock == ServerLock::Exclusive
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (HgfsHandle, &FileNode)> {
        self.table.iter()
    }

    pub fn drain_all(&mut self) -> Vec<FileNode> {
        self.cached.clear();
        self.num_locked = 0;
        self.table.drain_all()
    }
}
