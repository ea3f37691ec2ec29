// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Application messages carried over the encrypted channel.
//!
//! Every frame body decrypts to a CBOR [`Envelope`] whose `type` selects a
//! variant of the closed [`WirePayload`] union.  Unknown type tags are an
//! explicit decode error, never silently ignored.

use std::convert::TryFrom;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::identity::TrustAssertion;
use crate::ids::{FileId, NodeId};
use crate::manifest::FileManifest;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub r#type: u16,
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Upper bound for a serialized envelope accepted from the wire.
pub const MAX_ENVELOPE_BYTES: usize = 2 * 1024 * 1024;
/// Upper bound for the decoded payload inside an envelope.
pub const MAX_ENVELOPE_PAYLOAD_BYTES: usize = 1024 * 1024;

impl Envelope {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(crate::cbor::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() > MAX_ENVELOPE_BYTES {
            anyhow::bail!(
                "envelope exceeds max size: {} > {}",
                bytes.len(),
                MAX_ENVELOPE_BYTES
            );
        }
        let envelope: Self = crate::cbor::from_slice(bytes)?;
        if envelope.payload.len() > MAX_ENVELOPE_PAYLOAD_BYTES {
            anyhow::bail!(
                "envelope payload exceeds max size: {} > {}",
                envelope.payload.len(),
                MAX_ENVELOPE_PAYLOAD_BYTES
            );
        }
        Ok(envelope)
    }

    /// Decode the envelope payload into a typed protocol message.
    pub fn decode_typed(&self) -> anyhow::Result<WirePayload> {
        WirePayload::decode(self.r#type, &self.payload)
    }

    /// Build an envelope from a typed protocol payload.
    pub fn from_typed(payload: &WirePayload) -> anyhow::Result<Self> {
        Ok(Self {
            r#type: u16::from(payload.msg_type()),
            payload: payload.encode()?,
        })
    }
}

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MsgType {
    /// Direct text message.
    Msg = 1,
    /// Liveness probe.
    Ping = 10,
    /// Liveness probe response.
    Pong = 11,
    /// Full known-peer list push.
    GossipPeers = 20,
    /// Manifest request by file id.
    ReqManifest = 30,
    /// Serialized manifest response.
    Manifest = 31,
    /// Chunk request.
    ChunkReq = 32,
    /// Chunk payload response.
    ChunkData = 33,
    /// Positive or negative chunk acknowledgement.
    Ack = 34,
    /// Provider advertisement for a file id.
    DhtProvide = 40,
    /// Provider query for a file id.
    DhtFind = 41,
    /// Provider binding response.
    DhtFound = 42,
    /// Sealed packet forwarded toward a non-adjacent recipient.
    Relay = 50,
    /// Web-of-trust assertion push.
    TrustAssertion = 60,
}

impl From<MsgType> for u16 {
    fn from(value: MsgType) -> Self {
        value as u16
    }
}

impl TryFrom<u16> for MsgType {
    type Error = anyhow::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Msg),
            10 => Ok(Self::Ping),
            11 => Ok(Self::Pong),
            20 => Ok(Self::GossipPeers),
            30 => Ok(Self::ReqManifest),
            31 => Ok(Self::Manifest),
            32 => Ok(Self::ChunkReq),
            33 => Ok(Self::ChunkData),
            34 => Ok(Self::Ack),
            40 => Ok(Self::DhtProvide),
            41 => Ok(Self::DhtFind),
            42 => Ok(Self::DhtFound),
            50 => Ok(Self::Relay),
            60 => Ok(Self::TrustAssertion),
            _ => anyhow::bail!("unknown message type {value}"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Msg {
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ping {
    pub nonce: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Pong {
    pub nonce: u64,
}

/// A peer as gossiped between nodes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipPeer {
    pub id: NodeId,
    pub ip: IpAddr,
    pub tcp_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GossipPeers {
    pub peers: Vec<GossipPeer>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReqManifest {
    pub file_id: FileId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestData {
    pub manifest: FileManifest,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkReq {
    pub file_id: FileId,
    pub index: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkData {
    pub file_id: FileId,
    pub index: u32,
    #[serde(with = "serde_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Ok,
    HashMismatch,
    NotFound,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Ack {
    pub file_id: FileId,
    pub index: u32,
    pub status: AckStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhtProvide {
    pub file_id: FileId,
    pub provider: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhtFind {
    pub file_id: FileId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DhtFound {
    pub file_id: FileId,
    pub provider: NodeId,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Relay {
    pub to: NodeId,
    pub from: NodeId,
    #[serde(with = "serde_bytes")]
    pub sealed: Vec<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrustAssertionMsg {
    pub assertion: TrustAssertion,
}

/// Closed union of every application message.  Decoding matches
/// exhaustively on the type tag; there is no catch-all variant.
#[derive(Debug, Clone)]
pub enum WirePayload {
    Msg(Msg),
    Ping(Ping),
    Pong(Pong),
    GossipPeers(GossipPeers),
    ReqManifest(ReqManifest),
    Manifest(ManifestData),
    ChunkReq(ChunkReq),
    ChunkData(ChunkData),
    Ack(Ack),
    DhtProvide(DhtProvide),
    DhtFind(DhtFind),
    DhtFound(DhtFound),
    Relay(Relay),
    TrustAssertion(TrustAssertionMsg),
}

impl WirePayload {
    pub fn msg_type(&self) -> MsgType {
        match self {
            Self::Msg(_) => MsgType::Msg,
            Self::Ping(_) => MsgType::Ping,
            Self::Pong(_) => MsgType::Pong,
            Self::GossipPeers(_) => MsgType::GossipPeers,
            Self::ReqManifest(_) => MsgType::ReqManifest,
            Self::Manifest(_) => MsgType::Manifest,
            Self::ChunkReq(_) => MsgType::ChunkReq,
            Self::ChunkData(_) => MsgType::ChunkData,
            Self::Ack(_) => MsgType::Ack,
            Self::DhtProvide(_) => MsgType::DhtProvide,
            Self::DhtFind(_) => MsgType::DhtFind,
            Self::DhtFound(_) => MsgType::DhtFound,
            Self::Relay(_) => MsgType::Relay,
            Self::TrustAssertion(_) => MsgType::TrustAssertion,
        }
    }

    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        let bytes = match self {
            Self::Msg(m) => crate::cbor::to_vec(m)?,
            Self::Ping(m) => crate::cbor::to_vec(m)?,
            Self::Pong(m) => crate::cbor::to_vec(m)?,
            Self::GossipPeers(m) => crate::cbor::to_vec(m)?,
            Self::ReqManifest(m) => crate::cbor::to_vec(m)?,
            Self::Manifest(m) => crate::cbor::to_vec(m)?,
            Self::ChunkReq(m) => crate::cbor::to_vec(m)?,
            Self::ChunkData(m) => crate::cbor::to_vec(m)?,
            Self::Ack(m) => crate::cbor::to_vec(m)?,
            Self::DhtProvide(m) => crate::cbor::to_vec(m)?,
            Self::DhtFind(m) => crate::cbor::to_vec(m)?,
            Self::DhtFound(m) => crate::cbor::to_vec(m)?,
            Self::Relay(m) => crate::cbor::to_vec(m)?,
            Self::TrustAssertion(m) => crate::cbor::to_vec(m)?,
        };
        Ok(bytes)
    }

    pub fn decode(msg_type: u16, payload: &[u8]) -> anyhow::Result<Self> {
        let typed = match MsgType::try_from(msg_type)? {
            MsgType::Msg => Self::Msg(crate::cbor::from_slice(payload)?),
            MsgType::Ping => Self::Ping(crate::cbor::from_slice(payload)?),
            MsgType::Pong => Self::Pong(crate::cbor::from_slice(payload)?),
            MsgType::GossipPeers => Self::GossipPeers(crate::cbor::from_slice(payload)?),
            MsgType::ReqManifest => Self::ReqManifest(crate::cbor::from_slice(payload)?),
            MsgType::Manifest => Self::Manifest(crate::cbor::from_slice(payload)?),
            MsgType::ChunkReq => Self::ChunkReq(crate::cbor::from_slice(payload)?),
            MsgType::ChunkData => Self::ChunkData(crate::cbor::from_slice(payload)?),
            MsgType::Ack => Self::Ack(crate::cbor::from_slice(payload)?),
            MsgType::DhtProvide => Self::DhtProvide(crate::cbor::from_slice(payload)?),
            MsgType::DhtFind => Self::DhtFind(crate::cbor::from_slice(payload)?),
            MsgType::DhtFound => Self::DhtFound(crate::cbor::from_slice(payload)?),
            MsgType::Relay => Self::Relay(crate::cbor::from_slice(payload)?),
            MsgType::TrustAssertion => Self::TrustAssertion(crate::cbor::from_slice(payload)?),
        };
        Ok(typed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_envelope_roundtrip() {
        let payload = WirePayload::ChunkReq(ChunkReq {
            file_id: FileId([3u8; 32]),
            index: 7,
        });
        let envelope = Envelope::from_typed(&payload).expect("build envelope");
        assert_eq!(envelope.r#type, MsgType::ChunkReq as u16);

        let decoded = Envelope::decode(&envelope.encode().expect("encode")).expect("decode");
        match decoded.decode_typed().expect("typed") {
            WirePayload::ChunkReq(req) => {
                assert_eq!(req.file_id, FileId([3u8; 32]));
                assert_eq!(req.index, 7);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_type_tag_is_rejected() {
        let envelope = Envelope {
            r#type: 999,
            payload: vec![],
        };
        let err = envelope.decode_typed().expect_err("unknown tag");
        assert!(err.to_string().contains("unknown message type 999"));
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let envelope = Envelope {
            r#type: MsgType::Msg as u16,
            payload: vec![0u8; MAX_ENVELOPE_PAYLOAD_BYTES + 1],
        };
        let err = Envelope::decode(&envelope.encode().expect("encode")).expect_err("oversized");
        assert!(err.to_string().contains("payload exceeds max size"));
    }

    #[test]
    fn gossip_peers_roundtrip() {
        let payload = WirePayload::GossipPeers(GossipPeers {
            peers: vec![GossipPeer {
                id: NodeId([1u8; 32]),
                ip: "192.168.1.20".parse().expect("valid ip"),
                tcp_port: 7777,
            }],
        });
        let envelope = Envelope::from_typed(&payload).expect("build envelope");
        match envelope.decode_typed().expect("typed") {
            WirePayload::GossipPeers(gossip) => {
                assert_eq!(gossip.peers.len(), 1);
                assert_eq!(gossip.peers[0].tcp_port, 7777);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn ack_status_roundtrip() {
        for status in [AckStatus::Ok, AckStatus::HashMismatch, AckStatus::NotFound] {
            let payload = WirePayload::Ack(Ack {
                file_id: FileId([9u8; 32]),
                index: 1,
                status,
            });
            let envelope = Envelope::from_typed(&payload).expect("build envelope");
            match envelope.decode_typed().expect("typed") {
                WirePayload::Ack(ack) => assert_eq!(ack.status, status),
                other => panic!("wrong variant: {other:?}"),
            }
        }
    }
}
