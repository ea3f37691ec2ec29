// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Local-network peer discovery.
//!
//! Every `HELLO_INTERVAL` a cleartext CBOR datagram `{kind, id, tcp_port}`
//! is multicast on every non-loopback IPv4 interface.  The peer table is a
//! pure structure (upsert + TTL sweep) so liveness semantics are testable
//! without sockets; the async service owns the UDP socket and the timers.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::MULTICAST_GROUP;
use crate::ids::NodeId;

/// A known peer and when it was last heard from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub id: NodeId,
    pub ip: IpAddr,
    pub tcp_port: u16,
    pub last_seen: Instant,
}

/// Discovery heartbeat datagram.  `kind` guards against unrelated traffic
/// on the multicast group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloDatagram {
    pub kind: String,
    pub id: NodeId,
    pub tcp_port: u16,
}

pub const HELLO_KIND: &str = "HELLO";

impl HelloDatagram {
    pub fn new(id: NodeId, tcp_port: u16) -> Self {
        Self {
            kind: HELLO_KIND.to_owned(),
            id,
            tcp_port,
        }
    }
}

/// Owned peer table.  All mutation goes through `upsert` and `sweep`, so
/// the peer-new / peer-lost event semantics live in one place regardless
/// of whether a peer arrived by multicast, gossip, or manual registration.
#[derive(Debug, Default)]
pub struct PeerTable {
    records: HashMap<NodeId, PeerRecord>,
}

impl PeerTable {
    /// Insert or refresh a peer.  Returns `true` only on first sight,
    /// which is the trigger for a single peer-new event.
    pub fn upsert(&mut self, id: NodeId, ip: IpAddr, tcp_port: u16, now: Instant) -> bool {
        let is_new = !self.records.contains_key(&id);
        self.records.insert(
            id,
            PeerRecord {
                id,
                ip,
                tcp_port,
                last_seen: now,
            },
        );
        is_new
    }

    /// Evict peers silent for longer than `timeout`.  Each evicted record
    /// is returned exactly once, driving a single peer-lost event.
    pub fn sweep(&mut self, now: Instant, timeout: Duration) -> Vec<PeerRecord> {
        let expired: Vec<NodeId> = self
            .records
            .values()
            .filter(|record| now.duration_since(record.last_seen) > timeout)
            .map(|record| record.id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.records.remove(&id))
            .collect()
    }

    pub fn get(&self, id: &NodeId) -> Option<&PeerRecord> {
        self.records.get(id)
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.records.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Multicast socket bound to the discovery port, joined on every
/// non-loopback IPv4 interface.
pub struct DiscoverySocket {
    socket: Arc<UdpSocket>,
    group: SocketAddr,
}

impl DiscoverySocket {
    pub async fn bind(discovery_port: u16) -> anyhow::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port)).await?;
        socket.set_multicast_loop_v4(true)?;

        let mut joined = 0usize;
        for (name, addr) in local_ip_address::list_afinet_netifas().unwrap_or_default() {
            let IpAddr::V4(v4) = addr else { continue };
            if v4.is_loopback() {
                continue;
            }
            match socket.join_multicast_v4(MULTICAST_GROUP, v4) {
                Ok(()) => {
                    joined += 1;
                    debug!(interface = %name, addr = %v4, "joined multicast group");
                }
                Err(err) => {
                    debug!(interface = %name, addr = %v4, %err, "multicast join failed");
                }
            }
        }
        if joined == 0 {
            // Fall back to the default interface so discovery still works
            // on hosts where enumeration fails.
            if let Err(err) = socket.join_multicast_v4(MULTICAST_GROUP, Ipv4Addr::UNSPECIFIED) {
                warn!(%err, "could not join multicast group on any interface");
            }
        }

        Ok(Self {
            socket: Arc::new(socket),
            group: SocketAddr::new(IpAddr::V4(MULTICAST_GROUP), discovery_port),
        })
    }

    /// Broadcast one HELLO heartbeat.
    pub async fn send_hello(&self, id: NodeId, tcp_port: u16) -> anyhow::Result<()> {
        let datagram = crate::cbor::to_vec(&HelloDatagram::new(id, tcp_port))?;
        self.socket.send_to(&datagram, self.group).await?;
        Ok(())
    }

    /// Receive the next well-formed HELLO from a different node.
    /// Malformed datagrams and our own heartbeats are skipped.
    pub async fn recv_hello(&self, local_id: &NodeId) -> (HelloDatagram, SocketAddr) {
        let mut buf = [0u8; 512];
        loop {
            let Ok((len, from)) = self.socket.recv_from(&mut buf).await else {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            };
            match crate::cbor::from_slice::<HelloDatagram>(&buf[..len]) {
                Ok(hello) if hello.kind == HELLO_KIND && hello.id != *local_id => {
                    return (hello, from);
                }
                Ok(_) => {}
                Err(err) => debug!(%from, %err, "ignoring malformed discovery datagram"),
            }
        }
    }
}
