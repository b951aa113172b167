// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Server configuration

use serde::{Deserialize, Serialize};

/// Per-session resource bounds.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SessionLimits {
    /// Hard bound on simultaneously open file nodes.
    pub max_open_nodes: usize,
    /// Hard bound on simultaneously open searches.
    pub max_open_searches: usize,
    /// Soft bound on nodes whose descriptor stays open in the cached set;
    /// admission beyond this closes the least-recently-cached descriptor.
    pub max_cached_open_nodes: usize,
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_open_nodes: 256,
            max_open_searches: 64,
            max_cached_open_nodes: 64,
        }
    }
}

/// Top-level server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bound on concurrent sessions; creation beyond it fails, nothing is
    /// evicted.
    pub max_sessions: usize,
    pub limits: SessionLimits,
    /// Capacity of the per-session file-attribute cache.
    pub attr_cache_capacity: usize,
    /// Capacity of the per-session symlink-check cache.
    pub symlink_cache_capacity: usize,
    /// Invalidation attempts before an inactive session is force-destroyed.
    pub max_invalidation_attempts: u32,
    /// Largest reply packet the server will build before negotiation.
    pub max_packet_size: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_sessions: 1024,
            limits: SessionLimits::default(),
            attr_cache_capacity: 64,
            symlink_cache_capacity: 64,
            max_invalidation_attempts: 4,
            max_packet_size: 64 * 1024,
        }
    }
}
