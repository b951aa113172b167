// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Opportunistic lock coordination
//!
//! The coordinator sits between the request handlers and the OS lease
//! backend. Grants are best-effort: a client asking for a lock it cannot
//! have is granted no lock, never an error. Lock breaks initiated by the
//! OS (or by a conflicting open) are queued on a channel and consumed by
//! the transport's notification path; the client acknowledges with a
//! server-lock-change request, which is when the backend downgrade
//! actually happens.

use std::collections::HashMap;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Arc, Mutex};

use crate::error::{FsResult, HgfsError};
use crate::types::{FileDesc, LeaseBackend, ServerLock};
use hgfs_proto::WireLock;

/// A pending lock break the client must acknowledge.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockBreak {
    pub fd: FileDesc,
    /// Strongest lock the holder may keep after the break.
    pub new_lock: ServerLock,
}

/// Tracks granted locks per descriptor and mediates breaks.
pub struct OplockCoordinator {
    backend: Option<Arc<dyn LeaseBackend>>,
    held: Mutex<HashMap<u64, ServerLock>>,
    pending: Mutex<HashMap<u64, ServerLock>>,
    breaks: Sender<LockBreak>,
}

impl OplockCoordinator {
    /// Builds the coordinator and the break-event receiver the transport
    /// drains. Without a backend every grant is `ServerLock::None`.
    pub fn new(backend: Option<Arc<dyn LeaseBackend>>) -> (Self, Receiver<LockBreak>) {
        let (tx, rx) = channel();
        (
            Self {
                backend,
                held: Mutex::new(HashMap::new()),
                pending: Mutex::new(HashMap::new()),
                breaks: tx,
            },
            rx,
        )
    }

    fn try_backend(&self, fd: FileDesc, lock: ServerLock) -> bool {
        match &self.backend {
            Some(backend) => backend.try_acquire(fd, lock).is_ok(),
            None => false,
        }
    }

    /// Attempts to satisfy the lock requested at open. Opportunistic asks
    /// for exclusive first and settles for shared; explicit requests are
    /// all-or-nothing. The grant is returned, never an error.
    pub fn acquire(&self, fd: FileDesc, requested: WireLock) -> ServerLock {
        let granted = match requested {
            WireLock::None => ServerLock::None,
            WireLock::Shared => {
                if self.try_backend(fd, ServerLock::Shared) {
                    ServerLock::Shared
                } else {
                    ServerLock::None
                }
            }
            WireLock::Exclusive => {
                if self.try_backend(fd, ServerLock::Exclusive) {
                    ServerLock::Exclusive
                } else {
                    ServerLock::None
                }
            }
            WireLock::Opportunistic => {
                if self.try_backend(fd, ServerLock::Exclusive) {
                    ServerLock::Exclusive
                } else if self.try_backend(fd, ServerLock::Shared) {
                    ServerLock::Shared
                } else {
                    ServerLock::None
                }
            }
        };
        if granted != ServerLock::None {
            self.held.lock().unwrap().insert(fd.0, granted);
            tracing::debug!(fd = fd.0, ?granted, "server lock granted");
        }
        granted
    }

    /// Queues a break asking the holder to fall back to `new_lock`. Idempotent
    /// while a break for the same descriptor is outstanding.
    pub fn request_break(&self, fd: FileDesc, new_lock: ServerLock) {
        {
            let held = self.held.lock().unwrap();
            if !held.contains_key(&fd.0) {
                return;
            }
            let mut pending = self.pending.lock().unwrap();
            if pending.contains_key(&fd.0) {
                return;
            }
            pending.insert(fd.0, new_lock);
        }
        tracing::debug!(fd = fd.0, ?new_lock, "lock break queued");
        // receiver gone means the transport is shutting down; the lock
        // dies with the session
        let _ = self.breaks.send(LockBreak { fd, new_lock });
    }

    /// Client acknowledgement of a break (or a voluntary downgrade). The
    /// new lock must not be stronger than what is currently held.
    pub fn change(&self, fd: FileDesc, new_lock: ServerLock) -> FsResult<ServerLock> {
        let mut held = self.held.lock().unwrap();
        let current = held.get(&fd.0).copied().unwrap_or(ServerLock::None);
        if rank(new_lock) > rank(current) {
            return Err(HgfsError::Unsupported);
        }
        if current == ServerLock::None {
            // nothing held; releasing is a no-op
            return Ok(ServerLock::None);
        }
        if let Some(backend) = &self.backend {
            match new_lock {
                ServerLock::None => backend.release(fd)?,
                other => backend.downgrade(fd, other)?,
            }
        }
        if new_lock == ServerLock::None {
            held.remove(&fd.0);
        } else {
            held.insert(fd.0, new_lock);
        }
        self.pending.lock().unwrap().remove(&fd.0);
        Ok(new_lock)
    }

    /// Drops any lock state for a descriptor being closed.
    pub fn release(&self, fd: FileDesc) {
        let had = self.held.lock().unwrap().remove(&fd.0).is_some();
        self.pending.lock().unwrap().remove(&fd.0);
        if had {
            if let Some(backend) = &self.backend {
                if let Err(err) = backend.release(fd) {
                    tracing::warn!(fd = fd.0, ?err, "lease release failed");
                }
            }
        }
    }
}

fn rank(lock: ServerLock) -> u8 {
    match lock {
        ServerLock::None => 0,
        ServerLock::Shared => 1,
        ServerLock::Exclusive => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MockLeaseBackend;
    use mockall::predicate::eq;

    #[test]
    fn no_backend_grants_nothing() {
        let (coord, _rx) = OplockCoordinator::new(None);
        assert_eq!(
            coord.acquire(FileDesc(1), WireLock::Opportunistic),
            ServerLock::None
        );
        assert_eq!(
            coord.acquire(FileDesc(1), WireLock::Exclusive),
            ServerLock::None
        );
    }

    #[test]
    fn opportunistic_falls_back_to_shared() {
        let mut backend = MockLeaseBackend::new();
        backend
            .expect_try_acquire()
            .with(eq(FileDesc(3)), eq(ServerLock::Exclusive))
            .times(1)
            .returning(|_, _| Err(HgfsError::Busy));
        backend
            .expect_try_acquire()
            .with(eq(FileDesc(3)), eq(ServerLock::Shared))
            .times(1)
            .returning(|_, _| Ok(()));
        let (coord, _rx) = OplockCoordinator::new(Some(Arc::new(backend)));
        assert_eq!(
            coord.acquire(FileDesc(3), WireLock::Opportunistic),
            ServerLock::Shared
        );
    }

    #[test]
    fn explicit_request_does_not_downgrade() {
        let mut backend = MockLeaseBackend::new();
        backend
            .expect_try_acquire()
            .returning(|_, _| Err(HgfsError::Busy));
        let (coord, _rx) = OplockCoordinator::new(Some(Arc::new(backend)));
        assert_eq!(
            coord.acquire(FileDesc(3), WireLock::Exclusive),
            ServerLock::None
        );
    }

    #[test]
    fn break_is_queued_once_and_acked() {
        let mut backend = MockLeaseBackend::new();
        backend.expect_try_acquire().returning(|_, _| Ok(()));
        backend
            .expect_downgrade()
            .with(eq(FileDesc(7)), eq(ServerLock::Shared))
            .times(1)
            .returning(|_, _| Ok(()));
        let (coord, rx) = OplockCoordinator::new(Some(Arc::new(backend)));

        assert_eq!(
            coord.acquire(FileDesc(7), WireLock::Exclusive),
            ServerLock::Exclusive
        );
        coord.request_break(FileDesc(7), ServerLock::Shared);
        coord.request_break(FileDesc(7), ServerLock::Shared); // deduplicated
        let ev = rx.try_recv().unwrap();
        assert_eq!(
            ev,
            LockBreak {
                fd: FileDesc(7),
                new_lock: ServerLock::Shared
            }
        );
        assert!(rx.try_recv().is_err());

        assert_eq!(
            coord.change(FileDesc(7), ServerLock::Shared).unwrap(),
            ServerLock::Shared
        );
        // acked: a later break for the same fd queues again
        coord.request_break(FileDesc(7), ServerLock::None);
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn change_rejects_upgrade() {
        let (coord, _rx) = OplockCoordinator::new(None);
        assert!(coord.change(FileDesc(9), ServerLock::Exclusive).is_err());
    }

    #[test]
    fn break_for_unheld_lock_is_ignored() {
        let (coord, rx) = OplockCoordinator::new(None);
        coord.request_break(FileDesc(11), ServerLock::None);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn release_forwards_to_backend_once() {
        let mut backend = MockLeaseBackend::new();
        backend.expect_try_acquire().returning(|_, _| Ok(()));
        backend
            .expect_release()
            .with(eq(FileDesc(5)))
            .times(1)
            .returning(|_| Ok(()));
        let (coord, _rx) = OplockCoordinator::new(Some(Arc::new(backend)));
        coord.acquire(FileDesc(5), WireLock::Shared);
        coord.release(FileDesc(5));
        coord.release(FileDesc(5)); // second release is a no-op
    }
}
