// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! HGFS server core
//!
//! Transport-agnostic implementation of the host side of the host/guest
//! shared file system: sessions, handle tables, caches, opportunistic
//! lock coordination and the per-operation handlers. The embedding
//! transport feeds raw request packets to [`HgfsServer::handle_packet`]
//! and ships the returned reply buffers (plus any queued lock-break
//! notifications) back to the guest.
//!
//! All filesystem access goes through the [`Platform`] trait and all
//! share configuration through [`SharePolicy`]; the core itself never
//! touches the OS.

pub mod cache;
pub mod config;
pub mod error;
pub mod handles;
pub mod oplock;
pub mod server;
pub mod session;
pub mod types;

#[cfg(test)]
pub mod testing;

// Re-export key types
pub use cache::{LruCache, RemovalCallback};
pub use config::{ServerConfig, SessionLimits};
pub use error::{FsResult, HgfsError};
pub use handles::{FileNode, HandleTable, NodeState, NodeTable, SearchKind, SearchNode};
pub use oplock::{LockBreak, OplockCoordinator};
pub use server::HgfsServer;
pub use session::{default_capabilities, Session, SessionManager, SessionState};
pub use types::{
    AttrTarget, Attributes, DirEntry, FileDesc, FileId, FileType, HgfsHandle, LeaseBackend,
    Platform, ServerLock, SessionId, SharePolicy, ShareAccess, VolumeInfo,
};
