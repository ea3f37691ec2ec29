// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! The node controller: owns every subsystem and dispatches protocol
//! messages between them.
//!
//! Connections carry gossip (peers + providers) and transfer traffic over
//! the secure channel.  The peer table, provider directory, and transfer
//! engine are each a single owned structure behind one lock; `std` guards
//! are never held across await points.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex as TokioMutex, RwLock as TokioRwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::connection::{initiate_on, respond_on};
use crate::directory::ProviderDirectory;
use crate::discovery::{DiscoverySocket, PeerRecord, PeerTable};
use crate::events::NodeEvent;
use crate::framing::{encode_frame, Deframer};
use crate::handshake::EstablishedLink;
use crate::identity::{NodeIdentity, PinBook, TrustAssertion, TrustLog};
use crate::ids::{FileId, NodeId};
use crate::manifest::FileManifest;
use crate::relay::{self, RelayDedup};
use crate::session::SecureSession;
use crate::transfer::{ChunkOutcome, SharedFile, TransferEngine};
use crate::wire::{
    Ack, AckStatus, ChunkData, ChunkReq, DhtFind, DhtFound, DhtProvide, Envelope, GossipPeer,
    GossipPeers, ManifestData, Msg, Pong, Relay, ReqManifest, TrustAssertionMsg, WirePayload,
};

const OUTBOUND_QUEUE: usize = 64;
const EVENT_QUEUE: usize = 256;

struct ConnectionHandle {
    tx: mpsc::Sender<WirePayload>,
}

pub(crate) struct NodeInner {
    identity: NodeIdentity,
    config: NodeConfig,
    local_addr: SocketAddr,
    peers: StdRwLock<PeerTable>,
    directory: StdRwLock<ProviderDirectory>,
    /// Downloads waiting for a manifest (`NoManifest`/`AwaitingManifest`).
    pending_downloads: StdRwLock<HashSet<FileId>>,
    transfer: TokioMutex<TransferEngine>,
    pins: Arc<StdMutex<PinBook>>,
    trust: StdMutex<TrustLog>,
    conns: TokioRwLock<HashMap<NodeId, ConnectionHandle>>,
    relay_seen: StdMutex<RelayDedup>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeInner {
    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    /// Upsert a peer (multicast, gossip, and manual registration all share
    /// these semantics).  Emits peer-new only on first sight.
    fn register_peer(&self, id: NodeId, ip: IpAddr, tcp_port: u16) -> bool {
        if id == self.identity.id {
            return false;
        }
        let is_new = self
            .peers
            .write()
            .expect("peer table lock")
            .upsert(id, ip, tcp_port, Instant::now());
        if is_new {
            info!(peer = %id.short(), %ip, tcp_port, "new peer");
            self.emit(NodeEvent::PeerNew { id, ip, tcp_port });
        }
        is_new
    }

    fn gossip_payload(&self) -> GossipPeers {
        let peers = self
            .peers
            .read()
            .expect("peer table lock")
            .peers()
            .into_iter()
            .map(|record| GossipPeer {
                id: record.id,
                ip: record.ip,
                tcp_port: record.tcp_port,
            })
            .collect();
        GossipPeers { peers }
    }

    /// Providers for a file, sorted for stable round-robin assignment.
    fn sorted_providers(&self, file_id: &FileId) -> Vec<NodeId> {
        let mut providers: Vec<NodeId> = self
            .directory
            .read()
            .expect("directory lock")
            .providers(file_id)
            .into_iter()
            .filter(|p| *p != self.identity.id)
            .collect();
        providers.sort_by_key(|p| p.0);
        providers
    }
}

/// A running Archipel node.
pub struct Node {
    inner: Arc<NodeInner>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Load state, bind the TCP listener, and spawn the service loops.
    pub async fn start(config: NodeConfig) -> anyhow::Result<Self> {
        let identity = NodeIdentity::load_or_generate(&config.data_dir, config.tcp_port)?;
        let pins = Arc::new(StdMutex::new(PinBook::open(
            &config.data_dir,
            config.tcp_port,
        )?));
        let trust = StdMutex::new(TrustLog::open(&config.data_dir, config.tcp_port)?);
        let transfer = TokioMutex::new(TransferEngine::open(
            &config.data_dir,
            &config.download_dir,
            config.tcp_port,
        )?);

        let listener = TcpListener::bind(("0.0.0.0", config.tcp_port)).await?;
        let local_addr = listener.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_QUEUE);

        info!(id = %identity.id.short(), %local_addr, "node starting");

        let inner = Arc::new(NodeInner {
            identity,
            local_addr,
            peers: StdRwLock::new(PeerTable::default()),
            directory: StdRwLock::new(ProviderDirectory::default()),
            pending_downloads: StdRwLock::new(HashSet::new()),
            transfer,
            pins,
            trust,
            conns: TokioRwLock::new(HashMap::new()),
            relay_seen: StdMutex::new(RelayDedup::default()),
            events,
            config,
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(accept_loop(inner.clone(), listener)));
        tasks.push(tokio::spawn(gossip_loop(inner.clone())));
        tasks.push(tokio::spawn(sweep_loop(inner.clone())));
        if inner.config.enable_discovery {
            match DiscoverySocket::bind(inner.config.discovery_port).await {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    tasks.push(tokio::spawn(hello_loop(inner.clone(), socket.clone())));
                    tasks.push(tokio::spawn(discovery_recv_loop(inner.clone(), socket)));
                }
                Err(err) => {
                    warn!(%err, "multicast discovery unavailable, running gossip-only");
                }
            }
        }

        Ok(Self {
            inner,
            tasks: StdMutex::new(tasks),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.identity.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub fn peers(&self) -> Vec<PeerRecord> {
        self.inner.peers.read().expect("peer table lock").peers()
    }

    /// Peers with a live secure connection right now.
    pub async fn connected_peers(&self) -> Vec<NodeId> {
        self.inner.conns.read().await.keys().copied().collect()
    }

    pub fn providers(&self, file_id: &FileId) -> Vec<NodeId> {
        self.inner
            .directory
            .read()
            .expect("directory lock")
            .providers(file_id)
    }

    pub async fn shared_files(&self) -> Vec<SharedFile> {
        let transfer = self.inner.transfer.lock().await;
        transfer.shared_files().into_iter().cloned().collect()
    }

    pub fn trust_assertions(&self, target: &NodeId) -> Vec<TrustAssertion> {
        self.inner
            .trust
            .lock()
            .expect("trust log lock")
            .assertions_for(target)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Open (or reuse) a secure connection to an explicit address.  The
    /// peer is registered as if discovered, extending reach past the
    /// multicast domain.
    pub async fn connect_to(&self, addr: SocketAddr) -> anyhow::Result<NodeId> {
        connect_to(&self.inner, addr).await
    }

    /// Send a direct text message over the secure channel.
    pub async fn send_message(&self, target: NodeId, content: &str) -> anyhow::Result<()> {
        send_payload(
            &self.inner,
            target,
            WirePayload::Msg(Msg {
                content: content.to_owned(),
            }),
        )
        .await
    }

    /// Send a text message to every known peer.
    pub async fn broadcast_message(&self, content: &str) {
        broadcast_payload(
            &self.inner,
            WirePayload::Msg(Msg {
                content: content.to_owned(),
            }),
        )
        .await;
    }

    /// Build a signed manifest for `path`, index it for serving, and
    /// advertise it to the network.
    pub async fn share_file(&self, path: &Path) -> anyhow::Result<FileManifest> {
        let manifest =
            FileManifest::build(path, self.inner.config.chunk_size, &self.inner.identity).await?;
        let file_id = manifest.file_id;
        {
            let mut transfer = self.inner.transfer.lock().await;
            transfer.share(manifest.clone(), path.to_owned());
        }
        self.inner
            .directory
            .write()
            .expect("directory lock")
            .add(file_id, self.inner.identity.id);
        self.inner.emit(NodeEvent::FileShared {
            manifest: manifest.clone(),
        });
        info!(file_id = %file_id, filename = %manifest.filename, "file shared");

        broadcast_payload(
            &self.inner,
            WirePayload::DhtProvide(DhtProvide {
                file_id,
                provider: self.inner.identity.id,
            }),
        )
        .await;
        Ok(manifest)
    }

    /// Download a file by content id.  If no provider is known yet, a FIND
    /// query is broadcast and the download starts as soon as a FOUND
    /// response names a provider.
    pub async fn download_file(&self, file_id: FileId) -> anyhow::Result<()> {
        {
            let transfer = self.inner.transfer.lock().await;
            if transfer.is_shared(&file_id) || transfer.is_downloading(&file_id) {
                debug!(%file_id, "download requested for already-tracked file");
                return Ok(());
            }
        }
        self.inner
            .pending_downloads
            .write()
            .expect("pending lock")
            .insert(file_id);

        let providers = self.inner.sorted_providers(&file_id);
        if let Some(provider) = providers.first() {
            send_payload(
                &self.inner,
                *provider,
                WirePayload::ReqManifest(ReqManifest { file_id }),
            )
            .await?;
        } else {
            debug!(%file_id, "no provider known, broadcasting FIND");
            broadcast_payload(&self.inner, WirePayload::DhtFind(DhtFind { file_id })).await;
        }
        Ok(())
    }

    /// Sign and publish a trust assertion for a peer whose key is pinned.
    pub async fn trust_peer(&self, target: NodeId) -> anyhow::Result<TrustAssertion> {
        let pinned = self
            .inner
            .pins
            .lock()
            .expect("pin book lock")
            .pinned_key(&target)
            .ok_or_else(|| anyhow::anyhow!("no pinned key for peer {target}"))?;
        let assertion = TrustAssertion::sign(&self.inner.identity, target, pinned);
        self.inner
            .trust
            .lock()
            .expect("trust log lock")
            .append(assertion.clone());
        broadcast_payload(
            &self.inner,
            WirePayload::TrustAssertion(TrustAssertionMsg {
                assertion: assertion.clone(),
            }),
        )
        .await;
        Ok(assertion)
    }

    /// Seal a message to `target` and launch it into the mesh; every hop
    /// forwards the still-sealed packet toward the recipient.
    pub async fn relay_message(&self, target: NodeId, content: &str) -> anyhow::Result<()> {
        let sealed = relay::seal(&target, content.as_bytes())?;
        broadcast_payload(
            &self.inner,
            WirePayload::Relay(Relay {
                to: target,
                from: self.inner.identity.id,
                sealed,
            }),
        )
        .await;
        Ok(())
    }

    /// Stop all service loops.  Connections die with their tasks.
    pub fn stop(&self) {
        for task in self.tasks.lock().expect("task list lock").drain(..) {
            task.abort();
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Service loops ───────────────────────────────────────────────────────

async fn accept_loop(inner: Arc<NodeInner>, listener: TcpListener) {
    loop {
        let (mut stream, remote) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };
        let inner = inner.clone();
        tokio::spawn(async move {
            match respond_on(&mut stream, &inner.identity, &inner.pins).await {
                Ok((link, leftover)) => {
                    adopt_connection(&inner, stream, link, leftover).await;
                }
                Err(err) => {
                    // A failed handshake closes this socket only; other
                    // live connections are unaffected.
                    warn!(%remote, %err, "inbound handshake failed");
                }
            }
        });
    }
}

async fn gossip_loop(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(crate::config::GOSSIP_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let gossip = inner.gossip_payload();
        if gossip.peers.is_empty() {
            continue;
        }
        debug!(count = gossip.peers.len(), "gossiping routing table");
        broadcast_payload(&inner, WirePayload::GossipPeers(gossip)).await;
    }
}

async fn sweep_loop(inner: Arc<NodeInner>) {
    let mut ticker = tokio::time::interval(crate::config::HELLO_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let lost = inner
            .peers
            .write()
            .expect("peer table lock")
            .sweep(Instant::now(), crate::config::PEER_TIMEOUT);
        for peer in lost {
            info!(peer = %peer.id.short(), "peer lost");
            inner.conns.write().await.remove(&peer.id);
            inner.emit(NodeEvent::PeerLost { id: peer.id });
        }
    }
}

async fn hello_loop(inner: Arc<NodeInner>, socket: Arc<DiscoverySocket>) {
    let mut ticker = tokio::time::interval(crate::config::HELLO_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        if let Err(err) = socket
            .send_hello(inner.identity.id, inner.local_addr.port())
            .await
        {
            debug!(%err, "discovery hello failed");
        }
    }
}

async fn discovery_recv_loop(inner: Arc<NodeInner>, socket: Arc<DiscoverySocket>) {
    loop {
        let (hello, from) = socket.recv_hello(&inner.identity.id).await;
        inner.register_peer(hello.id, from.ip(), hello.tcp_port);
    }
}

// ── Connection management ───────────────────────────────────────────────

// Boxed future: `connect_to`, `adopt_connection`, and the message
// dispatch path form an auto-trait inference cycle across `tokio::spawn`
// boundaries (a dialed connection spawns a reader whose gossip handling
// may dial again). Giving this one function a concrete `Send` future type
// terminates the cycle the compiler would otherwise try to reveal.
fn connect_to<'a>(
    inner: &'a Arc<NodeInner>,
    addr: SocketAddr,
) -> Pin<Box<dyn Future<Output = anyhow::Result<NodeId>> + Send + 'a>> {
    Box::pin(async move {
        let mut stream = TcpStream::connect(addr).await?;
        let (link, leftover) = initiate_on(&mut stream, &inner.identity, &inner.pins).await?;
        let peer_id = link.peer_id;
        inner.register_peer(peer_id, addr.ip(), addr.port());
        adopt_connection(inner, stream, link, leftover).await;
        Ok(peer_id)
    })
}

/// Register an established connection, enforcing one connection per peer
/// id, and spawn its reader/writer tasks.
async fn adopt_connection(
    inner: &Arc<NodeInner>,
    stream: TcpStream,
    link: EstablishedLink,
    leftover: Vec<u8>,
) {
    let peer_id = link.peer_id;
    let session = Arc::new(SecureSession::new(&link.keys));
    let (tx, rx) = mpsc::channel::<WirePayload>(OUTBOUND_QUEUE);

    {
        let mut conns = inner.conns.write().await;
        match conns.get(&peer_id) {
            Some(existing) if !existing.tx.is_closed() => {
                // Dedup by peer id: keep the established connection.
                debug!(peer = %peer_id.short(), "duplicate connection dropped");
                return;
            }
            _ => {
                conns.insert(peer_id, ConnectionHandle { tx: tx.clone() });
            }
        }
    }
    info!(peer = %peer_id.short(), "secure connection registered");

    let (read_half, write_half) = stream.into_split();
    tokio::spawn(writer_task(write_half, rx, session.clone(), peer_id));
    tokio::spawn(reader_task(
        inner.clone(),
        read_half,
        session,
        peer_id,
        leftover,
        tx.clone(),
    ));

    // Push our routing table to the fresh peer right away.
    let gossip = inner.gossip_payload();
    if !gossip.peers.is_empty() {
        let _ = tx.send(WirePayload::GossipPeers(gossip)).await;
    }
}

/// Send one payload to a peer, dialing a connection on demand.
async fn send_payload(
    inner: &Arc<NodeInner>,
    target: NodeId,
    payload: WirePayload,
) -> anyhow::Result<()> {
    let existing = {
        let conns = inner.conns.read().await;
        conns.get(&target).map(|handle| handle.tx.clone())
    };
    if let Some(tx) = existing {
        if tx.send(payload).await.is_ok() {
            return Ok(());
        }
        inner.conns.write().await.remove(&target);
        anyhow::bail!("connection to {target} lost");
    }

    let record = {
        let peers = inner.peers.read().expect("peer table lock");
        peers.get(&target).cloned()
    };
    let Some(record) = record else {
        anyhow::bail!("peer {target} not found");
    };
    debug!(peer = %target.short(), "dialing secure link");
    connect_to(inner, SocketAddr::new(record.ip, record.tcp_port)).await?;

    let conns = inner.conns.read().await;
    let Some(handle) = conns.get(&target) else {
        anyhow::bail!("connection to {target} not established");
    };
    handle
        .tx
        .send(payload)
        .await
        .map_err(|_| anyhow::anyhow!("connection to {target} closed"))
}

/// Best-effort send to every known peer.
async fn broadcast_payload(inner: &Arc<NodeInner>, payload: WirePayload) {
    let targets: Vec<NodeId> = {
        let peers = inner.peers.read().expect("peer table lock");
        peers.peers().into_iter().map(|record| record.id).collect()
    };
    for target in targets {
        let inner = inner.clone();
        let payload = payload.clone();
        tokio::spawn(async move {
            if let Err(err) = send_payload(&inner, target, payload).await {
                debug!(peer = %target.short(), %err, "broadcast delivery failed");
            }
        });
    }
}

// ── Transfer driving ────────────────────────────────────────────────────

/// Issue chunk requests for a download, keeping at most
/// `max_parallel_chunks` outstanding, round-robined over providers.
async fn request_missing_chunks(inner: &Arc<NodeInner>, file_id: FileId) {
    let providers = inner.sorted_providers(&file_id);
    if providers.is_empty() {
        warn!(%file_id, "no providers available for chunk requests");
        return;
    }
    let indices = {
        let mut transfer = inner.transfer.lock().await;
        transfer.next_requests(&file_id, inner.config.max_parallel_chunks)
    };
    for index in indices {
        let provider = providers[index as usize % providers.len()];
        if let Err(err) = send_payload(
            inner,
            provider,
            WirePayload::ChunkReq(ChunkReq { file_id, index }),
        )
        .await
        {
            debug!(peer = %provider.short(), index, %err, "chunk request failed");
            let mut transfer = inner.transfer.lock().await;
            transfer.release_request(&file_id, index);
        }
    }
}

/// Promote a finished download and advertise ourselves as a provider.
async fn complete_download(inner: &Arc<NodeInner>, file_id: FileId) {
    let path = {
        let mut transfer = inner.transfer.lock().await;
        match transfer.finalize(&file_id).await {
            Ok(path) => path,
            Err(err) => {
                warn!(%file_id, %err, "finalize failed");
                return;
            }
        }
    };
    inner
        .directory
        .write()
        .expect("directory lock")
        .add(file_id, inner.identity.id);
    inner.emit(NodeEvent::TransferComplete { file_id, path });
    broadcast_payload(
        inner,
        WirePayload::DhtProvide(DhtProvide {
            file_id,
            provider: inner.identity.id,
        }),
    )
    .await;
}

// ── Message dispatch ────────────────────────────────────────────────────

/// Exhaustive dispatch of one decrypted application message.
async fn handle_payload(
    inner: &Arc<NodeInner>,
    from: NodeId,
    payload: WirePayload,
) -> anyhow::Result<()> {
    match payload {
        WirePayload::Msg(msg) => {
            inner.emit(NodeEvent::Message {
                from,
                content: msg.content,
                is_relayed: false,
            });
        }
        WirePayload::Ping(ping) => {
            let _ = send_payload(inner, from, WirePayload::Pong(Pong { nonce: ping.nonce })).await;
        }
        WirePayload::Pong(_) => {
            debug!(peer = %from.short(), "pong");
        }
        WirePayload::GossipPeers(gossip) => {
            handle_gossip(inner, gossip).await;
        }
        WirePayload::ReqManifest(req) => {
            let manifest = {
                let transfer = inner.transfer.lock().await;
                transfer.shared_manifest(&req.file_id).cloned()
            };
            if let Some(manifest) = manifest {
                send_payload(inner, from, WirePayload::Manifest(ManifestData { manifest })).await?;
            } else {
                debug!(file_id = %req.file_id.short(), "manifest requested but not shared");
            }
        }
        WirePayload::Manifest(data) => {
            handle_manifest(inner, from, data.manifest).await?;
        }
        WirePayload::ChunkReq(req) => {
            let chunk = {
                let transfer = inner.transfer.lock().await;
                transfer.read_chunk(&req.file_id, req.index).await?
            };
            match chunk {
                Some(data) => {
                    send_payload(
                        inner,
                        from,
                        WirePayload::ChunkData(ChunkData {
                            file_id: req.file_id,
                            index: req.index,
                            data,
                        }),
                    )
                    .await?;
                }
                None => {
                    send_payload(
                        inner,
                        from,
                        WirePayload::Ack(Ack {
                            file_id: req.file_id,
                            index: req.index,
                            status: AckStatus::NotFound,
                        }),
                    )
                    .await?;
                }
            }
        }
        WirePayload::ChunkData(chunk) => {
            handle_chunk_data(inner, from, chunk).await?;
        }
        WirePayload::Ack(ack) => match ack.status {
            AckStatus::Ok => {
                debug!(peer = %from.short(), index = ack.index, "chunk acknowledged");
            }
            AckStatus::HashMismatch => {
                warn!(peer = %from.short(), index = ack.index, "peer reported chunk mismatch");
            }
            AckStatus::NotFound => {
                // The provider cannot serve this chunk; free the slot so
                // another provider can be tried.
                {
                    let mut transfer = inner.transfer.lock().await;
                    transfer.release_request(&ack.file_id, ack.index);
                }
                request_missing_chunks(inner, ack.file_id).await;
            }
        },
        WirePayload::DhtProvide(provide) => {
            // Add-only: the push was already broadcast to the full peer
            // set, so it is not propagated further.
            let is_new = inner
                .directory
                .write()
                .expect("directory lock")
                .add(provide.file_id, provide.provider);
            if is_new {
                info!(
                    file_id = %provide.file_id.short(),
                    provider = %provide.provider.short(),
                    "learned provider"
                );
                inner.emit(NodeEvent::DhtUpdate {
                    file_id: provide.file_id,
                    provider: provide.provider,
                });
            }
        }
        WirePayload::DhtFind(find) => {
            let locally_shared = {
                let transfer = inner.transfer.lock().await;
                transfer.is_shared(&find.file_id)
            };
            let provider = if locally_shared {
                Some(inner.identity.id)
            } else {
                // Answer from directory knowledge; the query itself is
                // never forwarded (single-hop contract).
                inner.sorted_providers(&find.file_id).first().copied()
            };
            if let Some(provider) = provider {
                send_payload(
                    inner,
                    from,
                    WirePayload::DhtFound(DhtFound {
                        file_id: find.file_id,
                        provider,
                    }),
                )
                .await?;
            }
        }
        WirePayload::DhtFound(found) => {
            let is_new = inner
                .directory
                .write()
                .expect("directory lock")
                .add(found.file_id, found.provider);
            if is_new {
                inner.emit(NodeEvent::DhtUpdate {
                    file_id: found.file_id,
                    provider: found.provider,
                });
            }
            let pending = inner
                .pending_downloads
                .read()
                .expect("pending lock")
                .contains(&found.file_id);
            if pending && found.provider != inner.identity.id {
                info!(
                    file_id = %found.file_id.short(),
                    provider = %found.provider.short(),
                    "provider found, requesting manifest"
                );
                send_payload(
                    inner,
                    found.provider,
                    WirePayload::ReqManifest(ReqManifest {
                        file_id: found.file_id,
                    }),
                )
                .await?;
            }
        }
        WirePayload::Relay(packet) => {
            handle_relay(inner, packet).await;
        }
        WirePayload::TrustAssertion(msg) => match msg.assertion.verify() {
            Ok(()) => {
                debug!(
                    signer = %msg.assertion.signer_id.short(),
                    target = %msg.assertion.target_id.short(),
                    "trust assertion recorded"
                );
                inner
                    .trust
                    .lock()
                    .expect("trust log lock")
                    .append(msg.assertion);
            }
            Err(err) => {
                warn!(peer = %from.short(), %err, "invalid trust assertion dropped");
            }
        },
    }
    Ok(())
}

async fn handle_gossip(inner: &Arc<NodeInner>, gossip: GossipPeers) {
    for peer in gossip.peers {
        if peer.id == inner.identity.id {
            continue;
        }
        let is_new = inner.register_peer(peer.id, peer.ip, peer.tcp_port);
        if is_new {
            // Opportunistic connect: this is how the network grows beyond
            // one multicast domain.
            let inner = inner.clone();
            let addr = SocketAddr::new(peer.ip, peer.tcp_port);
            tokio::spawn(async move {
                if let Err(err) = connect_to(&inner, addr).await {
                    debug!(%addr, %err, "gossip-learned peer unreachable");
                }
            });
        }
    }
}

async fn handle_manifest(
    inner: &Arc<NodeInner>,
    from: NodeId,
    manifest: FileManifest,
) -> anyhow::Result<()> {
    if let Err(err) = manifest.verify() {
        warn!(peer = %from.short(), %err, "rejected manifest");
        return Ok(());
    }
    let file_id = manifest.file_id;

    let was_pending = inner
        .pending_downloads
        .write()
        .expect("pending lock")
        .remove(&file_id);
    if !was_pending {
        debug!(%file_id, "unsolicited manifest ignored");
        return Ok(());
    }

    // Whoever served the manifest holds the file.
    inner
        .directory
        .write()
        .expect("directory lock")
        .add(file_id, from);

    let total = manifest.nb_chunks;
    let already_complete = {
        let mut transfer = inner.transfer.lock().await;
        if transfer.is_downloading(&file_id) || transfer.is_shared(&file_id) {
            return Ok(());
        }
        transfer.begin_download(manifest).await?
    };
    inner.emit(NodeEvent::TransferProgress {
        file_id,
        completed: 0,
        total,
    });

    if already_complete {
        complete_download(inner, file_id).await;
    } else {
        request_missing_chunks(inner, file_id).await;
    }
    Ok(())
}

async fn handle_chunk_data(
    inner: &Arc<NodeInner>,
    from: NodeId,
    chunk: ChunkData,
) -> anyhow::Result<()> {
    let file_id = chunk.file_id;
    let (outcome, progress) = {
        let mut transfer = inner.transfer.lock().await;
        let outcome = transfer
            .accept_chunk(&file_id, chunk.index, &chunk.data)
            .await?;
        let progress = transfer
            .download(&file_id)
            .map(|d| (d.completed_chunks(), d.manifest.nb_chunks));
        (outcome, progress)
    };

    match outcome {
        ChunkOutcome::Verified { complete, .. } => {
            send_payload(
                inner,
                from,
                WirePayload::Ack(Ack {
                    file_id,
                    index: chunk.index,
                    status: AckStatus::Ok,
                }),
            )
            .await?;
            if let Some((completed, total)) = progress {
                inner.emit(NodeEvent::TransferProgress {
                    file_id,
                    completed,
                    total,
                });
            }
            if complete {
                complete_download(inner, file_id).await;
            } else {
                // Keep the parallel window full.
                request_missing_chunks(inner, file_id).await;
            }
        }
        ChunkOutcome::HashMismatch => {
            send_payload(
                inner,
                from,
                WirePayload::Ack(Ack {
                    file_id,
                    index: chunk.index,
                    status: AckStatus::HashMismatch,
                }),
            )
            .await?;
            // The chunk stays missing; re-request it.
            request_missing_chunks(inner, file_id).await;
        }
        ChunkOutcome::UnknownDownload | ChunkOutcome::UnknownChunk => {
            debug!(%file_id, index = chunk.index, "stray chunk ignored");
        }
    }
    Ok(())
}

async fn handle_relay(inner: &Arc<NodeInner>, packet: Relay) {
    let fresh = inner
        .relay_seen
        .lock()
        .expect("relay dedup lock")
        .check_and_record(&packet.from, &packet.to, &packet.sealed, Instant::now());
    if !fresh {
        return;
    }

    if packet.to == inner.identity.id {
        match relay::open(&inner.identity, &packet.sealed) {
            Ok(plaintext) => {
                let content = String::from_utf8_lossy(&plaintext).into_owned();
                info!(from = %packet.from.short(), "relayed message received");
                inner.emit(NodeEvent::Message {
                    from: packet.from,
                    content,
                    is_relayed: true,
                });
            }
            Err(err) => {
                warn!(from = %packet.from.short(), %err, "relay seal failed to open");
            }
        }
    } else {
        // Forward the still-sealed packet if the target is directly
        // reachable; multi-hop store-and-forward is out of scope.
        let target = packet.to;
        debug!(target = %target.short(), "forwarding sealed relay packet");
        if let Err(err) = send_payload(inner, target, WirePayload::Relay(packet)).await {
            debug!(target = %target.short(), %err, "relay target unreachable");
        }
    }
}

// ── Per-connection tasks ────────────────────────────────────────────────

async fn writer_task(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut rx: mpsc::Receiver<WirePayload>,
    session: Arc<SecureSession>,
    peer_id: NodeId,
) {
    use tokio::io::AsyncWriteExt;

    while let Some(payload) = rx.recv().await {
        let frame = match Envelope::from_typed(&payload)
            .and_then(|envelope| envelope.encode())
            .and_then(|bytes| {
                let packet = session.encrypt(&bytes)?;
                Ok(encode_frame(&packet)?)
            }) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(peer = %peer_id.short(), %err, "failed to encode outbound frame");
                continue;
            }
        };
        if let Err(err) = write_half.write_all(&frame).await {
            debug!(peer = %peer_id.short(), %err, "write failed, closing connection");
            break;
        }
    }
}

async fn reader_task(
    inner: Arc<NodeInner>,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    session: Arc<SecureSession>,
    peer_id: NodeId,
    leftover: Vec<u8>,
    own_tx: mpsc::Sender<WirePayload>,
) {
    use tokio::io::AsyncReadExt;

    let mut deframer = Deframer::with_leftover(leftover);
    let mut buf = [0u8; 16 * 1024];
    'conn: loop {
        // Drain every complete frame before reading again.
        loop {
            let frame = match deframer.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    warn!(peer = %peer_id.short(), %err, "framing violation, closing");
                    break 'conn;
                }
            };
            let plaintext = match session.decrypt(&frame) {
                Ok(plaintext) => plaintext,
                Err(err) => {
                    // Frame-local: drop the frame, keep the session.
                    warn!(peer = %peer_id.short(), %err, "dropping undecryptable frame");
                    continue;
                }
            };
            let payload =
                match Envelope::decode(&plaintext).and_then(|envelope| envelope.decode_typed()) {
                    Ok(payload) => payload,
                    Err(err) => {
                        warn!(peer = %peer_id.short(), %err, "unparseable message, closing");
                        break 'conn;
                    }
                };
            if let Err(err) = handle_payload(&inner, peer_id, payload).await {
                warn!(peer = %peer_id.short(), %err, "message handling failed");
            }
        }

        match read_half.read(&mut buf).await {
            Ok(0) => {
                debug!(peer = %peer_id.short(), "connection closed by peer");
                break;
            }
            Ok(n) => deframer.feed(&buf[..n]),
            Err(err) => {
                debug!(peer = %peer_id.short(), %err, "read failed");
                break;
            }
        }
    }

    // Deregister only our own handle: the peer may have reconnected and
    // registered a fresh connection in the meantime.
    let mut conns = inner.conns.write().await;
    if let Some(handle) = conns.get(&peer_id) {
        if handle.tx.same_channel(&own_tx) {
            conns.remove(&peer_id);
        }
    }
}
