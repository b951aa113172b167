// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Session lifecycle and routing
//!
//! The manager owns every active session and routes request session ids to
//! them. Lock order is manager map lock first, then any per-session lock;
//! a handler never holds locks of two different sessions at once.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

use crate::cache::LruCache;
use crate::config::ServerConfig;
use crate::error::{FsResult, HgfsError};
use crate::handles::{HandleTable, NodeTable, SearchNode};
use crate::types::{Attributes, Platform, SessionId};
use hgfs_proto::{CapabilityEntry, Opcode};

/// Capability flag value meaning the operation is supported.
pub const CAP_SUPPORTED: u32 = 1;
/// Capability flag value meaning the operation is not supported.
pub const CAP_NOT_SUPPORTED: u32 = 0;

/// Builds the process-wide default capability table: every core operation
/// supported, the reserved v4 extensions (watches, notifications, extended
/// entry attributes) negotiated off. Immutable after startup.
pub fn default_capabilities() -> Vec<CapabilityEntry> {
    let mut caps = Vec::new();
    for op in 0..=Opcode::SetEntryAttributesV4 as u32 {
        let supported = !matches!(
            Opcode::from_u32(op),
            Some(Opcode::SetWatchV4)
                | Some(Opcode::RemoveWatchV4)
                | Some(Opcode::NotifyV4)
                | Some(Opcode::SetEntryAttributesV4)
        );
        caps.push(CapabilityEntry {
            op,
            flags: if supported {
                CAP_SUPPORTED
            } else {
                CAP_NOT_SUPPORTED
            },
        });
    }
    caps
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

struct SessionMeta {
    state: SessionState,
    refs: u32,
    invalidation_attempts: u32,
}

/// One logical client connection with its own handle tables and caches.
pub struct Session {
    pub id: SessionId,
    /// The implicit session legacy pre-session clients are routed to.
    pub internal: bool,
    pub max_packet_size: u32,
    capabilities: Vec<CapabilityEntry>,
    meta: Mutex<SessionMeta>,
    pub nodes: Mutex<NodeTable>,
    pub searches: Mutex<HandleTable<SearchNode>>,
    pub attr_cache: Mutex<LruCache<Attributes>>,
    pub symlink_cache: Mutex<LruCache<bool>>,
    in_flight: Mutex<u64>,
    drained: Condvar,
}

impl Session {
    fn new(
        id: SessionId,
        internal: bool,
        max_packet_size: u32,
        capabilities: Vec<CapabilityEntry>,
        config: &ServerConfig,
    ) -> Self {
        Self {
            id,
            internal,
            max_packet_size,
            capabilities,
            meta: Mutex::new(SessionMeta {
                state: SessionState::Open,
                refs: 1,
                invalidation_attempts: 0,
            }),
            nodes: Mutex::new(NodeTable::new(
                config.limits.max_open_nodes,
                config.limits.max_cached_open_nodes,
            )),
            searches: Mutex::new(HandleTable::new(config.limits.max_open_searches)),
            attr_cache: Mutex::new(LruCache::new(config.attr_cache_capacity)),
            symlink_cache: Mutex::new(LruCache::new(config.symlink_cache_capacity)),
            in_flight: Mutex::new(0),
            drained: Condvar::new(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.meta.lock().unwrap().state
    }

    pub fn capabilities(&self) -> &[CapabilityEntry] {
        &self.capabilities
    }

    pub fn supports(&self, op: Opcode) -> bool {
        self.capabilities
            .iter()
            .find(|c| c.op == op as u32)
            .map(|c| c.flags == CAP_SUPPORTED)
            .unwrap_or(false)
    }

    /// Marks a request in flight. Fails once the session is closed so no
    /// new operation starts on a dying session. The state check and the
    /// counter increment both happen under the counter lock: a concurrent
    /// drain can never observe zero between them and tear down under an
    /// admitted request.
    pub fn begin_request(&self) -> FsResult<()> {
        let mut count = self.in_flight.lock().unwrap();
        if self.meta.lock().unwrap().state == SessionState::Closed {
            return Err(HgfsError::StaleSession);
        }
        *count += 1;
        Ok(())
    }

    pub fn end_request(&self) {
        let mut count = self.in_flight.lock().unwrap();
        debug_assert!(*count > 0);
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }

    /// Blocks until every in-flight request has completed. Bounded by
    /// request completion, not by anything the client controls.
    pub fn wait_for_drain(&self) {
        let mut count = self.in_flight.lock().unwrap();
        while *count > 0 {
            count = self.drained.wait(count).unwrap();
        }
    }

    pub fn acquire_ref(&self) {
        self.meta.lock().unwrap().refs += 1;
    }

    /// Drops one reference; returns true when the session should be
    /// finalized (last reference gone and state closed).
    pub fn release_ref(&self) -> bool {
        let mut meta = self.meta.lock().unwrap();
        debug_assert!(meta.refs > 0);
        meta.refs -= 1;
        meta.refs == 0 && meta.state == SessionState::Closed
    }
}

/// Process-wide session table.
pub struct SessionManager {
    config: ServerConfig,
    default_caps: Vec<CapabilityEntry>,
    sessions: Mutex<HashMap<u64, Arc<Session>>>,
    internal_id: Mutex<Option<u64>>,
    next_id: Mutex<u64>,
}

impl SessionManager {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            default_caps: default_capabilities(),
            sessions: Mutex::new(HashMap::new()),
            internal_id: Mutex::new(None),
            next_id: Mutex::new(1),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    // Plain monotonic counter: ids never repeat for the life of the
    // process, so an insert can never displace a live session.
    fn allocate_id(&self) -> SessionId {
        let mut next = self.next_id.lock().unwrap();
        let id = *next;
        *next += 1;
        SessionId(id)
    }

    /// Creates a session with the negotiated packet size and capability
    /// extensions merged over the process defaults. Fails at the session
    /// bound; an existing session is never evicted to make room.
    pub fn create_session(
        &self,
        max_packet_size: u32,
        extensions: &[CapabilityEntry],
    ) -> FsResult<Arc<Session>> {
        let mut sessions = self.sessions.lock().unwrap();
        if sessions.len() >= self.config.max_sessions {
            return Err(HgfsError::TooManySessions);
        }
        let mut caps = self.default_caps.clone();
        for ext in extensions {
            match caps.iter_mut().find(|c| c.op == ext.op) {
                Some(entry) => entry.flags = ext.flags,
                None => caps.push(*ext),
            }
        }
        let id = self.allocate_id();
        let max_packet = if max_packet_size == 0 {
            self.config.max_packet_size
        } else {
            max_packet_size.min(self.config.max_packet_size)
        };
        let session = Arc::new(Session::new(id, false, max_packet, caps, &self.config));
        sessions.insert(id.0, session.clone());
        tracing::debug!(session = id.0, max_packet, "session created");
        Ok(session)
    }

    /// The implicit session for legacy pre-session opcodes, created on
    /// first use. Exempt from the session bound: it exists before any
    /// negotiation.
    pub fn internal_session(&self) -> Arc<Session> {
        let mut internal = self.internal_id.lock().unwrap();
        if let Some(id) = *internal {
            if let Some(session) = self.sessions.lock().unwrap().get(&id) {
                return session.clone();
            }
        }
        let id = self.allocate_id();
        let session = Arc::new(Session::new(
            id,
            true,
            self.config.max_packet_size,
            self.default_caps.clone(),
            &self.config,
        ));
        self.sessions.lock().unwrap().insert(id.0, session.clone());
        *internal = Some(id.0);
        session
    }

    pub fn get(&self, id: SessionId) -> FsResult<Arc<Session>> {
        let sessions = self.sessions.lock().unwrap();
        let session = sessions.get(&id.0).ok_or(HgfsError::StaleSession)?;
        if session.state() == SessionState::Closed {
            return Err(HgfsError::StaleSession);
        }
        Ok(session.clone())
    }

    /// Transitions the session to closed: in-flight requests finish, new
    /// ones are refused.
    pub fn mark_inactive(&self, id: SessionId) -> FsResult<()> {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            sessions.get(&id.0).ok_or(HgfsError::StaleSession)?.clone()
        };
        session.meta.lock().unwrap().state = SessionState::Closed;
        Ok(())
    }

    /// One invalidation attempt against an inactive session. Destroys it
    /// when the last reference is gone, or forcibly after the configured
    /// attempt bound (a leaked reference upstream; logged, never retried,
    /// never escalated to process death). Returns whether the session is
    /// gone.
    pub fn try_invalidate(&self, id: SessionId, platform: &dyn Platform) -> bool {
        let session = {
            let sessions = self.sessions.lock().unwrap();
            match sessions.get(&id.0) {
                Some(s) => s.clone(),
                None => return true,
            }
        };
        let force = {
            let mut meta = session.meta.lock().unwrap();
            meta.state = SessionState::Closed;
            meta.invalidation_attempts += 1;
            if meta.refs == 0 {
                false
            } else if meta.invalidation_attempts >= self.config.max_invalidation_attempts {
                tracing::error!(
                    session = id.0,
                    refs = meta.refs,
                    attempts = meta.invalidation_attempts,
                    "session invalidation exhausted, forcing teardown of leaked session"
                );
                true
            } else {
                return false;
            }
        };
        if !force {
            tracing::debug!(session = id.0, "invalidating idle session");
        }
        self.destroy_session(id, platform);
        true
    }

    /// Releases one reference, finalizing teardown when it was the last on
    /// a closed session.
    pub fn unref(&self, session: &Arc<Session>, platform: &dyn Platform) {
        if session.release_ref() {
            self.destroy_session(session.id, platform);
        }
    }

    /// Full teardown: drain in-flight requests, close every node and
    /// search, drop both caches, remove the session from the table.
    pub fn destroy_session(&self, id: SessionId, platform: &dyn Platform) {
        let session = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.remove(&id.0) {
                Some(s) => s,
                None => return,
            }
        };
        {
            let mut internal = self.internal_id.lock().unwrap();
            if *internal == Some(id.0) {
                *internal = None;
            }
        }
        session.meta.lock().unwrap().state = SessionState::Closed;
        session.wait_for_drain();

        let nodes = session.nodes.lock().unwrap().drain_all();
        for node in nodes {
            if let Some(fd) = node.fd {
                if let Err(err) = platform.close(fd) {
                    tracing::warn!(?err, path = %node.path.display(), "close during teardown failed");
                }
            }
        }
        session.searches.lock().unwrap().drain_all();
        session.attr_cache.lock().unwrap().clear();
        session.symlink_cache.lock().unwrap().clear();
        tracing::debug!(session = id.0, "session destroyed");
    }
}
