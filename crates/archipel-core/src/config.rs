// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Multicast group used for local-network discovery.
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 42, 99);
pub const DISCOVERY_PORT: u16 = 6000;

pub const DEFAULT_TCP_PORT: u16 = 7777;

pub const HELLO_INTERVAL: Duration = Duration::from_secs(15);
/// Peers silent for this long are evicted (3 missed hellos).
pub const PEER_TIMEOUT: Duration = Duration::from_secs(45);
pub const GOSSIP_INTERVAL: Duration = Duration::from_secs(30);

/// Default transfer chunk size.  Fixed per manifest once chosen.
pub const CHUNK_SIZE: u32 = 512 * 1024;
/// Upper bound on concurrently outstanding chunk requests per download.
pub const MAX_PARALLEL_CHUNKS: usize = 3;

/// Window in which a repeated relay packet is dropped as a duplicate.
pub const RELAY_DEDUP_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// TCP listen port.  0 binds an ephemeral port.
    pub tcp_port: u16,
    /// Directory holding the identity, trust, and content-index files.
    pub data_dir: PathBuf,
    /// Directory downloads are written to.
    pub download_dir: PathBuf,
    pub chunk_size: u32,
    pub max_parallel_chunks: usize,
    /// Multicast discovery can be disabled for gossip-only operation.
    pub enable_discovery: bool,
    pub discovery_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            tcp_port: DEFAULT_TCP_PORT,
            data_dir: PathBuf::from("."),
            download_dir: PathBuf::from("."),
            chunk_size: CHUNK_SIZE,
            max_parallel_chunks: MAX_PARALLEL_CHUNKS,
            enable_discovery: true,
            discovery_port: DISCOVERY_PORT,
        }
    }
}
