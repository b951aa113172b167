// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Request dispatch and operation handlers
//!
//! [`HgfsServer::handle_packet`] is the single entry point: one request
//! buffer in, at most one reply buffer out. Header and payload validation
//! live in `hgfs-proto`; this module routes the typed request to its
//! session and handler. Handlers never hold a table lock across a
//! platform call that can block on descriptor identity checks; they
//! snapshot under the lock, call the platform, then re-validate and
//! commit.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;

use hgfs_proto::{
    pack_error_reply, unpack_header, unpack_request, CreateDirRequest, CreateSessionRequest,
    DeleteRequest, GetattrRequest, HeaderError, HgfsStatus, Opcode, OpenRequest, PacketIn,
    QueryVolumeRequest, ReadRequest, RenameRequest, ReplyBuilder, Request, SearchOpenRequest,
    SearchReadRequest, ServerLockChangeRequest, SetattrRequest, SymlinkCreateRequest, Target,
    WireAttr, WireLock, WireName, WriteRequest, ATTR_ATIME, ATTR_GID, ATTR_MTIME, ATTR_PERMS,
    ATTR_SIZE, ATTR_UID, FILE_TYPE_DIRECTORY, FILE_TYPE_REGULAR, FILE_TYPE_SYMLINK,
    HGFS_HEADER_SIZE, OPEN_APPEND, OPEN_CREATE, OPEN_EXCLUSIVE, OPEN_TRUNCATE,
    RENAME_NO_REPLACE_EXISTING, SEARCH_READ_RESTART, WRITE_APPEND,
};

use crate::config::ServerConfig;
use crate::error::{FsResult, HgfsError};
use crate::handles::{FileNode, NodeState, SearchKind, SearchNode};
use crate::oplock::{LockBreak, OplockCoordinator};
use crate::session::{Session, SessionManager};
use crate::types::{
    AttrTarget, Attributes, DirEntry, FileDesc, FileType, HgfsHandle, LeaseBackend, Platform,
    ServerLock, SessionId, SharePolicy, ShareAccess,
};

const MAX_COMPONENT_LEN: usize = 255;

/// Result of resolving a wire name against the share policy.
struct Resolved {
    share: String,
    path: PathBuf,
    access: ShareAccess,
}

/// The HGFS server core. Transport-agnostic: the embedder feeds request
/// buffers in and ships reply buffers (and queued lock breaks) out.
pub struct HgfsServer {
    platform: Arc<dyn Platform>,
    policy: Arc<dyn SharePolicy>,
    sessions: SessionManager,
    oplocks: OplockCoordinator,
}

impl HgfsServer {
    pub fn new(
        config: ServerConfig,
        platform: Arc<dyn Platform>,
        policy: Arc<dyn SharePolicy>,
        leases: Option<Arc<dyn LeaseBackend>>,
    ) -> (Self, Receiver<LockBreak>) {
        let (oplocks, breaks) = OplockCoordinator::new(leases);
        (
            Self {
                platform,
                policy,
                sessions: SessionManager::new(config),
                oplocks,
            },
            breaks,
        )
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Handles one request packet. Returns `None` when the buffer is too
    /// mangled to even synthesize an error reply; such packets are dropped
    /// after logging.
    pub fn handle_packet(&self, buf: &[u8]) -> Option<Vec<u8>> {
        let pkt = match unpack_header(buf) {
            Ok(pkt) => pkt,
            Err(HeaderError::Drop(reason)) => {
                tracing::warn!(reason, len = buf.len(), "dropping unparseable packet");
                return None;
            }
            Err(HeaderError::Reply {
                gen,
                op_value,
                request_id,
                session_id,
                status,
            }) => {
                return Some(pack_error_reply(gen, op_value, request_id, session_id, status));
            }
        };
        let fail = |status: HgfsStatus| {
            Some(pack_error_reply(
                pkt.gen,
                pkt.op_value,
                pkt.request_id,
                pkt.session_id,
                status,
            ))
        };

        // Session creation runs before any session exists.
        if pkt.op == Opcode::CreateSessionV4 {
            let req = match unpack_request(pkt.op, pkt.payload) {
                Ok(Request::CreateSession(req)) => req,
                Ok(_) => return fail(HgfsStatus::ProtocolError),
                Err(e) => return fail(e.to_status()),
            };
            return Some(match self.op_create_session(&pkt, &req) {
                Ok(reply) => reply,
                Err(e) => pack_error_reply(
                    pkt.gen,
                    pkt.op_value,
                    pkt.request_id,
                    pkt.session_id,
                    e.to_status(),
                ),
            });
        }

        let session = match pkt.session_id {
            Some(id) => match self.sessions.get(SessionId(id)) {
                Ok(s) => s,
                Err(e) => return fail(e.to_status()),
            },
            // legacy pre-session operations run on the implicit session
            None => self.sessions.internal_session(),
        };
        if !session.supports(pkt.op) {
            return fail(HgfsStatus::OperationNotSupported);
        }
        if let Err(e) = session.begin_request() {
            return fail(e.to_status());
        }
        let req = match unpack_request(pkt.op, pkt.payload) {
            Ok(r) => r,
            Err(e) => {
                session.end_request();
                return fail(e.to_status());
            }
        };

        if matches!(req, Request::DestroySession) {
            // teardown drains in-flight requests; this one must not count
            // itself among them
            session.end_request();
            self.sessions
                .destroy_session(session.id, self.platform.as_ref());
            return Some(self.reply(&pkt, None).finish());
        }

        let out = self.dispatch(&pkt, &session, req);
        session.end_request();
        Some(match out {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(op = ?pkt.op, status = ?e.to_status(), "request failed");
                pack_error_reply(
                    pkt.gen,
                    pkt.op_value,
                    pkt.request_id,
                    pkt.session_id,
                    e.to_status(),
                )
            }
        })
    }

    fn dispatch(
        &self,
        pkt: &PacketIn<'_>,
        session: &Arc<Session>,
        req: Request,
    ) -> FsResult<Vec<u8>> {
        match req {
            Request::Open(r) => self.op_open(pkt, session, r),
            Request::Read(r) => self.op_read(pkt, session, r),
            Request::Write(r) => self.op_write(pkt, session, r),
            Request::Close(r) => self.op_close(pkt, session, r.handle),
            Request::SearchOpen(r) => self.op_search_open(pkt, session, r),
            Request::SearchRead(r) => self.op_search_read(pkt, session, r),
            Request::SearchClose(r) => self.op_search_close(pkt, session, r.handle),
            Request::Getattr(r) => self.op_getattr(pkt, session, r),
            Request::Setattr(r) => self.op_setattr(pkt, session, r),
            Request::CreateDir(r) => self.op_create_dir(pkt, session, r),
            Request::Delete(r) => self.op_delete(pkt, session, r),
            Request::Rename(r) => self.op_rename(pkt, session, r),
            Request::SymlinkCreate(r) => self.op_symlink_create(pkt, session, r),
            Request::QueryVolume(r) => self.op_query_volume(pkt, session, r),
            Request::ServerLockChange(r) => self.op_server_lock_change(pkt, session, r),
            // both handled in handle_packet before dispatch
            Request::CreateSession(_) | Request::DestroySession => Err(HgfsError::Protocol),
        }
    }

    fn reply(&self, pkt: &PacketIn<'_>, session: Option<&Session>) -> ReplyBuilder {
        let max = session.map_or(usize::MAX, |s| s.max_packet_size as usize);
        ReplyBuilder::new(
            pkt.gen,
            pkt.op_value,
            pkt.request_id,
            pkt.session_id,
            HgfsStatus::Success,
            max,
        )
    }

    // ---- name resolution ----------------------------------------------

    /// Maps a wire name to a local path below its share root. Every
    /// component is validated before it touches the path; `.` and `..`
    /// never reach the filesystem.
    fn resolve_name(&self, session: &Session, name: &WireName) -> FsResult<Resolved> {
        let share = name.share().ok_or(HgfsError::InvalidName)?;
        validate_component(share)?;
        let root = self.policy.share_root(share)?;
        let access = self.policy.share_access(share)?;
        let follow = self.policy.follow_symlinks(share);
        let mut path = root;
        for component in name.relative() {
            validate_component(component)?;
            if !follow {
                // a symlink ancestor would let the path escape the share
                self.deny_symlink(session, &path)?;
            }
            path.push(component);
        }
        Ok(Resolved {
            share: share.to_string(),
            path,
            access,
        })
    }

    /// Rejects paths that pass through a symlink, consulting the
    /// per-session cache before paying for a stat.
    fn deny_symlink(&self, session: &Session, path: &Path) -> FsResult<()> {
        let key = cache_key(path);
        {
            let mut cache = session.symlink_cache.lock().unwrap();
            if let Some(&is_link) = cache.get(&key) {
                return if is_link {
                    Err(HgfsError::AccessDenied)
                } else {
                    Ok(())
                };
            }
        }
        let is_link = match self.platform.getattr_by_name(path, false) {
            Ok(attr) => attr.file_type == FileType::Symlink,
            // a missing ancestor fails later with a better error
            Err(HgfsError::NotFound) => false,
            Err(e) => return Err(e),
        };
        session.symlink_cache.lock().unwrap().put(&key, is_link);
        if is_link {
            Err(HgfsError::AccessDenied)
        } else {
            Ok(())
        }
    }

    // ---- descriptor recovery ------------------------------------------

    /// Returns a usable descriptor for an open node, transparently
    /// reopening when the cached descriptor was evicted or the path was
    /// replaced underneath it. The platform calls run without the table
    /// lock; the commit re-validates the handle.
    fn node_fd(&self, session: &Session, handle: HgfsHandle) -> FsResult<FileDesc> {
        let (path, share, id, fd, mode, flags) = {
            let nodes = session.nodes.lock().unwrap();
            let n = nodes.get(handle)?;
            (n.path.clone(), n.share.clone(), n.id, n.fd, n.mode, n.flags)
        };
        let follow = self.policy.follow_symlinks(&share);
        if let Some(fd) = fd {
            match self.platform.getattr_by_name(&path, follow) {
                Ok(attr) if attr.id == id => {
                    // a successful fetch promotes the node into the cached
                    // set (or refreshes its recency)
                    let evicted = {
                        let mut nodes = session.nodes.lock().unwrap();
                        nodes.admit_cached(handle)?
                    };
                    self.close_evicted(evicted);
                    return Ok(fd);
                }
                // replaced or vanished underneath; fall through and reopen
                _ => {}
            }
        }

        let reopen_flags = flags & !(OPEN_CREATE | OPEN_TRUNCATE | OPEN_EXCLUSIVE);
        let new_fd = self.platform.open(&path, mode, reopen_flags, 0)?;
        let attr = match self.platform.getattr_by_fd(new_fd) {
            Ok(attr) => attr,
            Err(e) => {
                let _ = self.platform.close(new_fd);
                return Err(e);
            }
        };

        let (stale, evicted) = {
            let mut nodes = session.nodes.lock().unwrap();
            let node = match nodes.get_mut(handle) {
                Ok(n) => n,
                Err(e) => {
                    drop(nodes);
                    let _ = self.platform.close(new_fd);
                    return Err(e);
                }
            };
            if node.fd != fd {
                // a concurrent request recovered first; theirs wins
                let winner = node.fd;
                drop(nodes);
                let _ = self.platform.close(new_fd);
                return winner.ok_or(HgfsError::InvalidHandle);
            }
            let stale = node.fd.take();
            node.fd = Some(new_fd);
            node.id = attr.id;
            let evicted = nodes.admit_cached(handle)?;
            (stale, evicted)
        };
        if let Some(old) = stale {
            self.oplocks.release(old);
            if let Err(err) = self.platform.close(old) {
                tracing::warn!(?err, "closing stale descriptor failed");
            }
        }
        self.close_evicted(evicted);
        Ok(new_fd)
    }

    /// Closes a descriptor handed back by cached-set eviction. Runs after
    /// the table lock is dropped.
    fn close_evicted(&self, evicted: Option<(HgfsHandle, FileDesc)>) {
        if let Some((_, fd)) = evicted {
            self.oplocks.release(fd);
            if let Err(err) = self.platform.close(fd) {
                tracing::warn!(?err, "closing evicted descriptor failed");
            }
        }
    }

    // ---- file operations ----------------------------------------------

    fn op_open(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: OpenRequest,
    ) -> FsResult<Vec<u8>> {
        let r = self.resolve_name(session, &req.name)?;
        let follow = self.policy.follow_symlinks(&r.share);

        let write_intent = req.mode.writes() || req.flags & (OPEN_CREATE | OPEN_TRUNCATE) != 0;
        if r.access == ShareAccess::ReadOnly && write_intent {
            // an exclusive create colliding with an existing file reports
            // the collision, not the share gate
            if req.flags & OPEN_CREATE != 0
                && req.flags & OPEN_EXCLUSIVE != 0
                && self.platform.getattr_by_name(&r.path, follow).is_ok()
            {
                return Err(HgfsError::AlreadyExists);
            }
            return Err(HgfsError::AccessDenied);
        }

        let fd = self
            .platform
            .open(&r.path, req.mode, req.flags, req.permissions)?;
        let attr = match self.platform.getattr_by_fd(fd) {
            Ok(attr) => attr,
            Err(e) => {
                let _ = self.platform.close(fd);
                return Err(e);
            }
        };

        // an exclusive holder on the same file gets a break instead of us
        // getting a lock
        let holders: Vec<FileDesc> = {
            let nodes = session.nodes.lock().unwrap();
            nodes
                .iter()
                .filter(|(_, n)| n.id == attr.id && n.server_lock == ServerLock::Exclusive)
                .filter_map(|(_, n)| n.fd)
                .collect()
        };
        let lock = if holders.is_empty() {
            self.oplocks.acquire(fd, req.desired_lock)
        } else {
            for holder in holders {
                self.oplocks.request_break(holder, ServerLock::Shared);
            }
            ServerLock::None
        };

        let node = FileNode {
            path: r.path,
            share: r.share,
            share_access: r.access,
            id: attr.id,
            fd: Some(fd),
            mode: req.mode,
            flags: req.flags,
            append: req.flags & OPEN_APPEND != 0,
            server_lock: lock,
            state: NodeState::InUseNotCached,
        };
        // the node stays uncached until its first descriptor fetch; a bare
        // open must not evict anyone else's cached descriptor
        let handle = {
            let mut nodes = session.nodes.lock().unwrap();
            match nodes.allocate(node) {
                Ok(h) => h,
                Err(e) => {
                    drop(nodes);
                    self.oplocks.release(fd);
                    let _ = self.platform.close(fd);
                    return Err(e);
                }
            }
        };

        let mut b = self.reply(pkt, Some(session));
        b.put_u64(handle.0);
        b.put_u32(lock_to_wire(lock));
        Ok(b.finish())
    }

    fn op_read(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: ReadRequest,
    ) -> FsResult<Vec<u8>> {
        let fd = self.node_fd(session, HgfsHandle(req.handle))?;
        // leave room for the reply header and the length prefix
        let cap = session
            .max_packet_size
            .saturating_sub((HGFS_HEADER_SIZE + 8) as u32);
        let len = req.required_size.min(cap);
        let data = self.platform.read(fd, req.offset, len)?;
        let mut b = self.reply(pkt, Some(session));
        b.put_counted(&data);
        Ok(b.finish())
    }

    fn op_write(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: WriteRequest,
    ) -> FsResult<Vec<u8>> {
        let handle = HgfsHandle(req.handle);
        let (mode, node_append, path) = {
            let nodes = session.nodes.lock().unwrap();
            let n = nodes.get(handle)?;
            (n.mode, n.append, n.path.clone())
        };
        if !mode.writes() {
            return Err(HgfsError::AccessDenied);
        }
        let fd = self.node_fd(session, handle)?;
        let append = node_append || req.flags & WRITE_APPEND != 0;
        let written = self.platform.write(fd, req.offset, &req.data, append)?;
        session
            .attr_cache
            .lock()
            .unwrap()
            .invalidate(&cache_key(&path));
        let mut b = self.reply(pkt, Some(session));
        b.put_u32(written);
        Ok(b.finish())
    }

    fn op_close(&self, pkt: &PacketIn<'_>, session: &Session, handle: u64) -> FsResult<Vec<u8>> {
        let node = {
            let mut nodes = session.nodes.lock().unwrap();
            nodes.release(HgfsHandle(handle))?
        };
        if let Some(fd) = node.fd {
            self.oplocks.release(fd);
            self.platform.close(fd)?;
        }
        Ok(self.reply(pkt, Some(session)).finish())
    }

    // ---- directory enumeration ----------------------------------------

    fn op_search_open(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: SearchOpenRequest,
    ) -> FsResult<Vec<u8>> {
        let search = self.build_search(session, &req.name)?;
        let handle = session.searches.lock().unwrap().allocate(search)?;
        let mut b = self.reply(pkt, Some(session));
        b.put_u64(handle.0);
        Ok(b.finish())
    }

    fn build_search(&self, session: &Session, name: &WireName) -> FsResult<SearchNode> {
        if name.is_root() {
            // the share-list root is virtual; entries come from policy
            let dents = self.share_list_entries();
            return Ok(SearchNode {
                path: PathBuf::new(),
                share: String::new(),
                kind: SearchKind::Base,
                dents,
            });
        }
        let r = self.resolve_name(session, name)?;
        let follow = self.policy.follow_symlinks(&r.share);
        let dents = self.platform.scandir(&r.path, follow)?;
        Ok(SearchNode {
            path: r.path,
            share: r.share,
            kind: SearchKind::Dir,
            dents: dents.into(),
        })
    }

    /// Entries of the virtual share-list directory: the synthetic dot
    /// entries followed by one directory per configured share.
    fn share_list_entries(&self) -> VecDeque<DirEntry> {
        let mut dents: VecDeque<DirEntry> = VecDeque::new();
        for dot in [".", ".."] {
            dents.push_back(DirEntry {
                name: dot.to_string(),
                file_type: FileType::Directory,
            });
        }
        dents.extend(self.policy.enumerate_shares().into_iter().map(|name| {
            DirEntry {
                name,
                file_type: FileType::Directory,
            }
        }));
        dents
    }

    fn op_search_read(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: SearchReadRequest,
    ) -> FsResult<Vec<u8>> {
        let handle = HgfsHandle(req.handle);
        let (kind, dir, share) = {
            let searches = session.searches.lock().unwrap();
            let s = searches.get(handle)?;
            (s.kind, s.path.clone(), s.share.clone())
        };
        let follow = !share.is_empty() && self.policy.follow_symlinks(&share);

        if !req.multi {
            // legacy read: offset indexes the snapshot, nothing is consumed
            let entry = {
                let searches = session.searches.lock().unwrap();
                searches
                    .get(handle)?
                    .dents
                    .get(req.offset as usize)
                    .cloned()
            };
            let mut b = self.reply(pkt, Some(session));
            match entry {
                Some(entry) => {
                    let attr = self.entry_attr(kind, &dir, &entry, follow);
                    b.put_attr(&attr);
                    b.put_counted(entry.name.as_bytes());
                }
                None => {
                    // end of search: a zero-length name
                    b.put_attr(&WireAttr::default());
                    b.put_counted(b"");
                }
            }
            return Ok(b.finish());
        }

        if req.flags & SEARCH_READ_RESTART != 0 {
            self.restart_search(session, handle)?;
        }

        // consuming multi-record read: fill the page until a record no
        // longer fits, then hand the refused entry back
        let mut b = self.reply(pkt, Some(session));
        b.begin_dirents();
        loop {
            let entry = {
                let mut searches = session.searches.lock().unwrap();
                searches.get_mut(handle)?.dents.pop_front()
            };
            let Some(entry) = entry else { break };
            let attr = self.entry_attr(kind, &dir, &entry, follow);
            if !b.push_dirent(&attr, &entry.name) {
                let mut searches = session.searches.lock().unwrap();
                searches.get_mut(handle)?.dents.push_front(entry);
                break;
            }
        }
        Ok(b.finish())
    }

    fn restart_search(&self, session: &Session, handle: HgfsHandle) -> FsResult<()> {
        let (kind, path, share) = {
            let searches = session.searches.lock().unwrap();
            let s = searches.get(handle)?;
            (s.kind, s.path.clone(), s.share.clone())
        };
        let dents: VecDeque<DirEntry> = match kind {
            SearchKind::Base => self.share_list_entries(),
            SearchKind::Dir => {
                let follow = self.policy.follow_symlinks(&share);
                self.platform.scandir(&path, follow)?.into()
            }
            SearchKind::Other => VecDeque::new(),
        };
        session.searches.lock().unwrap().get_mut(handle)?.dents = dents;
        Ok(())
    }

    /// Attributes for one directory record. An entry that vanished between
    /// the scan and the read keeps its scan-time type with empty
    /// attributes rather than failing the whole page.
    fn entry_attr(&self, kind: SearchKind, dir: &Path, entry: &DirEntry, follow: bool) -> WireAttr {
        match kind {
            SearchKind::Base | SearchKind::Other => WireAttr {
                file_type: FILE_TYPE_DIRECTORY,
                perms: 0o555,
                ..Default::default()
            },
            SearchKind::Dir => match self.platform.getattr_by_name(&dir.join(&entry.name), follow)
            {
                Ok(attr) => wire_attr(&attr),
                Err(_) => WireAttr {
                    file_type: file_type_to_wire(entry.file_type),
                    ..Default::default()
                },
            },
        }
    }

    fn op_search_close(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        handle: u64,
    ) -> FsResult<Vec<u8>> {
        session
            .searches
            .lock()
            .unwrap()
            .release(HgfsHandle(handle))?;
        Ok(self.reply(pkt, Some(session)).finish())
    }

    // ---- attributes ---------------------------------------------------

    fn op_getattr(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: GetattrRequest,
    ) -> FsResult<Vec<u8>> {
        let attr = match req.target {
            Target::Handle(h) => {
                let fd = self.node_fd(session, HgfsHandle(h))?;
                wire_attr(&self.platform.getattr_by_fd(fd)?)
            }
            Target::Name(name) if name.is_root() => WireAttr {
                file_type: FILE_TYPE_DIRECTORY,
                perms: 0o555,
                ..Default::default()
            },
            Target::Name(name) => {
                let r = self.resolve_name(session, &name)?;
                let key = cache_key(&r.path);
                let cached = session.attr_cache.lock().unwrap().get(&key).copied();
                let mut attr = match cached {
                    Some(attr) => attr,
                    None => {
                        let follow = self.policy.follow_symlinks(&r.share);
                        let attr = self.platform.getattr_by_name(&r.path, follow)?;
                        session.attr_cache.lock().unwrap().put(&key, attr);
                        attr
                    }
                };
                // a symlink's size on the wire is the length of its target
                // path, not whatever the platform reports
                if attr.file_type == FileType::Symlink {
                    let target = self.platform.readlink(&r.path)?;
                    attr.size = target.as_os_str().len() as u64;
                }
                wire_attr(&attr)
            }
        };
        let mut b = self.reply(pkt, Some(session));
        b.put_attr(&attr);
        Ok(b.finish())
    }

    fn op_setattr(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: SetattrRequest,
    ) -> FsResult<Vec<u8>> {
        let (target, path, self_handle) = match req.target {
            Target::Handle(h) => {
                let handle = HgfsHandle(h);
                let (path, access) = {
                    let nodes = session.nodes.lock().unwrap();
                    let n = nodes.get(handle)?;
                    (n.path.clone(), n.share_access)
                };
                if access == ShareAccess::ReadOnly {
                    return Err(HgfsError::AccessDenied);
                }
                let fd = self.node_fd(session, handle)?;
                (AttrTarget::Fd(fd), path, Some(handle))
            }
            Target::Name(name) => {
                let r = self.resolve_name(session, &name)?;
                if r.access == ShareAccess::ReadOnly {
                    return Err(HgfsError::AccessDenied);
                }
                (AttrTarget::Path(r.path.clone()), r.path, None)
            }
        };

        // each requested change applies independently; the last failure
        // wins the reply status while earlier successes stick
        let u = &req.update;
        let mut last_err: Option<HgfsError> = None;
        if u.mask & ATTR_SIZE != 0 {
            if self.size_change_blocked(session, &target, &path, self_handle)? {
                last_err = Some(HgfsError::Busy);
            } else if let Err(e) = self.platform.set_size(&target, u.size) {
                last_err = Some(e);
            }
        }
        if u.mask & ATTR_PERMS != 0 {
            if let Err(e) = self.platform.set_mode(&target, u.perms) {
                last_err = Some(e);
            }
        }
        if u.mask & (ATTR_UID | ATTR_GID) != 0 {
            let uid = (u.mask & ATTR_UID != 0).then_some(u.uid);
            let gid = (u.mask & ATTR_GID != 0).then_some(u.gid);
            if let Err(e) = self.platform.set_owner(&target, uid, gid) {
                last_err = Some(e);
            }
        }
        if u.mask & (ATTR_ATIME | ATTR_MTIME) != 0 {
            let atime = (u.mask & ATTR_ATIME != 0).then_some(u.atime);
            let mtime = (u.mask & ATTR_MTIME != 0).then_some(u.mtime);
            if let Err(e) = self.platform.set_times(&target, atime, mtime) {
                last_err = Some(e);
            }
        }
        session
            .attr_cache
            .lock()
            .unwrap()
            .invalidate(&cache_key(&path));
        match last_err {
            Some(e) => Err(e),
            None => Ok(self.reply(pkt, Some(session)).finish()),
        }
    }

    /// A size change is refused while another open of the same file holds
    /// an exclusive server lock.
    fn size_change_blocked(
        &self,
        session: &Session,
        target: &AttrTarget,
        path: &Path,
        self_handle: Option<HgfsHandle>,
    ) -> FsResult<bool> {
        let id = match target {
            AttrTarget::Fd(fd) => self.platform.getattr_by_fd(*fd)?.id,
            AttrTarget::Path(_) => match self.platform.getattr_by_name(path, false) {
                Ok(attr) => attr.id,
                // creating via truncate of a missing file; nothing to lock
                Err(HgfsError::NotFound) => return Ok(false),
                Err(e) => return Err(e),
            },
        };
        let nodes = session.nodes.lock().unwrap();
        let probe = self_handle.unwrap_or(HgfsHandle(u64::MAX));
        Ok(nodes.locked_elsewhere(probe, id))
    }

    // ---- namespace operations -----------------------------------------

    fn op_create_dir(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: CreateDirRequest,
    ) -> FsResult<Vec<u8>> {
        let r = self.resolve_name(session, &req.name)?;
        require_writable(r.access)?;
        self.platform.create_dir(&r.path, req.permissions)?;
        Ok(self.reply(pkt, Some(session)).finish())
    }

    fn op_delete(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: DeleteRequest,
    ) -> FsResult<Vec<u8>> {
        let (path, access) = match req.target {
            Target::Name(name) => {
                let r = self.resolve_name(session, &name)?;
                (r.path, r.access)
            }
            Target::Handle(h) => {
                let nodes = session.nodes.lock().unwrap();
                let n = nodes.get(HgfsHandle(h))?;
                (n.path.clone(), n.share_access)
            }
        };
        require_writable(access)?;
        if req.is_dir {
            self.platform.delete_dir(&path)?;
        } else {
            self.platform.delete_file(&path)?;
        }
        session
            .attr_cache
            .lock()
            .unwrap()
            .invalidate(&cache_key(&path));
        Ok(self.reply(pkt, Some(session)).finish())
    }

    fn op_rename(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: RenameRequest,
    ) -> FsResult<Vec<u8>> {
        let from = self.resolve_name(session, &req.old_name)?;
        let to = self.resolve_name(session, &req.new_name)?;
        require_writable(from.access)?;
        require_writable(to.access)?;
        if req.hints & RENAME_NO_REPLACE_EXISTING != 0 {
            let follow = self.policy.follow_symlinks(&to.share);
            if self.platform.getattr_by_name(&to.path, follow).is_ok() {
                return Err(HgfsError::AlreadyExists);
            }
        }
        self.platform.rename(&from.path, &to.path)?;
        let mut cache = session.attr_cache.lock().unwrap();
        cache.invalidate(&cache_key(&from.path));
        cache.invalidate(&cache_key(&to.path));
        drop(cache);
        Ok(self.reply(pkt, Some(session)).finish())
    }

    fn op_symlink_create(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: SymlinkCreateRequest,
    ) -> FsResult<Vec<u8>> {
        let link = self.resolve_name(session, &req.link_name)?;
        require_writable(link.access)?;
        // the target is stored verbatim as a relative path, it is not
        // resolved against any share
        if req.target_name.components.is_empty() {
            return Err(HgfsError::InvalidName);
        }
        let target: PathBuf = req.target_name.components.join("/").into();
        self.platform.create_symlink(&link.path, &target)?;
        Ok(self.reply(pkt, Some(session)).finish())
    }

    fn op_query_volume(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: QueryVolumeRequest,
    ) -> FsResult<Vec<u8>> {
        let info = if req.name.is_root() {
            // the virtual root spans every share; report the most
            // constrained volume so clients never over-commit
            let mut best: Option<crate::types::VolumeInfo> = None;
            for share in self.policy.enumerate_shares() {
                let Ok(root) = self.policy.share_root(&share) else {
                    continue;
                };
                let Ok(info) = self.platform.statfs(&root) else {
                    continue;
                };
                best = Some(match best {
                    None => info,
                    Some(prev) => crate::types::VolumeInfo {
                        free_bytes: prev.free_bytes.min(info.free_bytes),
                        total_bytes: prev.total_bytes.min(info.total_bytes),
                    },
                });
            }
            best.ok_or(HgfsError::NotFound)?
        } else {
            let r = self.resolve_name(session, &req.name)?;
            self.platform.statfs(&r.path)?
        };
        let mut b = self.reply(pkt, Some(session));
        b.put_u64(info.free_bytes);
        b.put_u64(info.total_bytes);
        Ok(b.finish())
    }

    // ---- locks and sessions -------------------------------------------

    fn op_server_lock_change(
        &self,
        pkt: &PacketIn<'_>,
        session: &Session,
        req: ServerLockChangeRequest,
    ) -> FsResult<Vec<u8>> {
        let new_lock = match req.new_lock {
            WireLock::None => ServerLock::None,
            WireLock::Shared => ServerLock::Shared,
            WireLock::Exclusive => ServerLock::Exclusive,
            // locks are only acquired opportunistically at open
            WireLock::Opportunistic => return Err(HgfsError::Unsupported),
        };
        let handle = HgfsHandle(req.handle);
        let fd = {
            let nodes = session.nodes.lock().unwrap();
            nodes.get(handle)?.fd
        };
        let granted = match fd {
            Some(fd) => self.oplocks.change(fd, new_lock)?,
            // an evicted descriptor cannot be holding a lock
            None => ServerLock::None,
        };
        session.nodes.lock().unwrap().set_lock(handle, granted)?;
        let mut b = self.reply(pkt, Some(session));
        b.put_u32(lock_to_wire(granted));
        Ok(b.finish())
    }

    fn op_create_session(
        &self,
        pkt: &PacketIn<'_>,
        req: &CreateSessionRequest,
    ) -> FsResult<Vec<u8>> {
        let session = self
            .sessions
            .create_session(req.max_packet_size, &req.capabilities)?;
        let mut b = ReplyBuilder::new(
            pkt.gen,
            pkt.op_value,
            pkt.request_id,
            Some(session.id.0),
            HgfsStatus::Success,
            usize::MAX,
        );
        b.put_u64(session.id.0);
        b.put_u32(session.max_packet_size);
        let caps = session.capabilities();
        b.put_u32(caps.len() as u32);
        for cap in caps {
            b.put_u32(cap.op);
            b.put_u32(cap.flags);
        }
        Ok(b.finish())
    }
}

fn validate_component(component: &str) -> FsResult<()> {
    if component.is_empty() || component == "." || component == ".." {
        return Err(HgfsError::InvalidName);
    }
    if component.contains(['/', '\\', '\0']) {
        return Err(HgfsError::InvalidName);
    }
    if component.len() > MAX_COMPONENT_LEN {
        return Err(HgfsError::NameTooLong);
    }
    Ok(())
}

fn require_writable(access: ShareAccess) -> FsResult<()> {
    if access == ShareAccess::ReadOnly {
        return Err(HgfsError::AccessDenied);
    }
    Ok(())
}

fn cache_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn lock_to_wire(lock: ServerLock) -> u32 {
    match lock {
        ServerLock::None => WireLock::None.to_u32(),
        ServerLock::Shared => WireLock::Shared.to_u32(),
        ServerLock::Exclusive => WireLock::Exclusive.to_u32(),
    }
}

fn file_type_to_wire(t: FileType) -> u32 {
    match t {
        FileType::Regular => FILE_TYPE_REGULAR,
        FileType::Directory => FILE_TYPE_DIRECTORY,
        FileType::Symlink => FILE_TYPE_SYMLINK,
    }
}

fn wire_attr(attr: &Attributes) -> WireAttr {
    WireAttr {
        file_type: file_type_to_wire(attr.file_type),
        size: attr.size,
        perms: attr.perms,
        uid: attr.uid,
        gid: attr.gid,
        atime: attr.atime,
        mtime: attr.mtime,
        ctime: attr.ctime,
        volume_id: attr.id.volume,
        file_id: attr.id.file,
    }
}
