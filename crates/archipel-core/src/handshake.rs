// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Four-message mutual-authentication handshake.
//!
//! ```text
//! Initiator                                   Responder
//!   HELLO        eph_i (32) ‖ timestamp (8)      →
//!      ←   static_r (32) ‖ eph_r (32) ‖ sig_r (64)   HELLO_REPLY
//!   AUTH         static_i (32) ‖ sig_i (64)      →
//! ```
//!
//! Both signatures cover the ephemeral tuple `eph_i ‖ eph_r`, binding each
//! static identity to this specific exchange.  The initiator withholds its
//! identity until the responder has committed to an ephemeral key.
//!
//! Each side is an explicit state machine advanced by feeding bytes, so
//! partial-segment behavior is unit-testable without a socket.  Any bytes
//! beyond the handshake messages (coalesced application data) are handed
//! back on establishment.

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, SharedSecret};
use zeroize::Zeroize;

use crate::error::ChannelError;
use crate::identity::{NodeIdentity, PinBook};
use crate::ids::NodeId;
use crate::session::{SecretBytes, SessionKeys};

pub const HELLO_LEN: usize = 40;
pub const HELLO_REPLY_LEN: usize = 128;
pub const AUTH_LEN: usize = 96;

/// Maximum tolerated difference between the HELLO timestamp and the
/// responder's clock.
pub const MAX_CLOCK_SKEW_SECS: u64 = 5 * 60;

const KDF_CONTEXT_C2S: &str = "archipel v1 session client->server";
const KDF_CONTEXT_S2C: &str = "archipel v1 session server->client";

/// Result of a completed handshake: the session keys plus the peer's
/// authenticated identity.
#[derive(Debug)]
pub struct EstablishedLink {
    pub keys: SessionKeys,
    pub peer_id: NodeId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Initiator,
    Responder,
}

/// Derive the per-direction session keys.  Canonical client/server role
/// assignment prevents key confusion: both directions are derived from the
/// same transcript, then assigned by role.
fn derive_session_keys(
    role: Role,
    dh: &SharedSecret,
    initiator_eph: &[u8; 32],
    responder_eph: &[u8; 32],
) -> SessionKeys {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh.as_bytes());
    ikm.extend_from_slice(initiator_eph);
    ikm.extend_from_slice(responder_eph);

    let c2s = blake3::derive_key(KDF_CONTEXT_C2S, &ikm);
    let s2c = blake3::derive_key(KDF_CONTEXT_S2C, &ikm);
    ikm.zeroize();

    match role {
        Role::Initiator => SessionKeys {
            tx: SecretBytes(c2s),
            rx: SecretBytes(s2c),
        },
        Role::Responder => SessionKeys {
            tx: SecretBytes(s2c),
            rx: SecretBytes(c2s),
        },
    }
}

fn ephemeral_tuple(initiator_eph: &[u8; 32], responder_eph: &[u8; 32]) -> [u8; 64] {
    let mut tuple = [0u8; 64];
    tuple[..32].copy_from_slice(initiator_eph);
    tuple[32..].copy_from_slice(responder_eph);
    tuple
}

fn verify_tuple_signature(
    static_key: &[u8; 32],
    tuple: &[u8; 64],
    sig: &[u8],
) -> Result<(), ChannelError> {
    let pubkey =
        VerifyingKey::from_bytes(static_key).map_err(|_| ChannelError::SignatureInvalid)?;
    let mut sig_arr = [0u8; 64];
    sig_arr.copy_from_slice(sig);
    pubkey
        .verify(tuple, &Signature::from_bytes(&sig_arr))
        .map_err(|_| ChannelError::SignatureInvalid)
}

fn now_unix_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Initiator side: `Initiating → AwaitingReply → Established`.
pub struct InitiatorHandshake {
    buf: Vec<u8>,
    eph_secret: Option<EphemeralSecret>,
    eph_public: [u8; 32],
}

/// Progress report from feeding bytes to the initiator machine.
#[derive(Debug)]
pub enum InitiatorStep {
    /// The HELLO_REPLY has not fully arrived yet.
    NeedMore,
    /// Handshake complete.  `auth` must be sent to the responder; any
    /// coalesced post-handshake bytes are in `leftover`.
    Established {
        auth: Vec<u8>,
        link: EstablishedLink,
        leftover: Vec<u8>,
    },
}

impl InitiatorHandshake {
    /// Begin a handshake.  Returns the machine plus the HELLO packet to
    /// send.  No identity is revealed in HELLO.
    pub fn start() -> (Self, Vec<u8>) {
        Self::start_at(now_unix_secs())
    }

    pub fn start_at(timestamp_unix_secs: u64) -> (Self, Vec<u8>) {
        let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
        let eph_public = X25519PublicKey::from(&eph_secret).to_bytes();

        let mut hello = Vec::with_capacity(HELLO_LEN);
        hello.extend_from_slice(&eph_public);
        hello.extend_from_slice(&timestamp_unix_secs.to_be_bytes());

        (
            Self {
                buf: Vec::new(),
                eph_secret: Some(eph_secret),
                eph_public,
            },
            hello,
        )
    }

    /// Feed newly arrived bytes.  Once the 128-byte HELLO_REPLY is
    /// complete: verify the responder's signature, run the pinned-identity
    /// check, derive the client-role session keys, and produce AUTH.
    pub fn feed(
        &mut self,
        input: &[u8],
        identity: &NodeIdentity,
        pins: &mut PinBook,
    ) -> Result<InitiatorStep, ChannelError> {
        self.buf.extend_from_slice(input);
        if self.buf.len() < HELLO_REPLY_LEN {
            return Ok(InitiatorStep::NeedMore);
        }
        let eph_secret = self
            .eph_secret
            .take()
            .ok_or(ChannelError::Malformed("handshake already completed"))?;

        let mut responder_static = [0u8; 32];
        responder_static.copy_from_slice(&self.buf[..32]);
        let mut responder_eph = [0u8; 32];
        responder_eph.copy_from_slice(&self.buf[32..64]);
        let sig = &self.buf[64..HELLO_REPLY_LEN];

        let tuple = ephemeral_tuple(&self.eph_public, &responder_eph);
        verify_tuple_signature(&responder_static, &tuple, sig)?;

        let peer_id = NodeId(responder_static);
        pins.check_and_pin(peer_id, responder_static)?;

        let dh = eph_secret.diffie_hellman(&X25519PublicKey::from(responder_eph));
        let keys = derive_session_keys(Role::Initiator, &dh, &self.eph_public, &responder_eph);

        let signature = identity.signing.sign(&tuple);
        let mut auth = Vec::with_capacity(AUTH_LEN);
        auth.extend_from_slice(&identity.verifying_key().to_bytes());
        auth.extend_from_slice(&signature.to_bytes());

        let leftover = self.buf.split_off(HELLO_REPLY_LEN);
        self.buf.clear();

        Ok(InitiatorStep::Established {
            auth,
            link: EstablishedLink { keys, peer_id },
            leftover,
        })
    }
}

enum ResponderState {
    AwaitingHello,
    AwaitingAuth {
        keys: Option<SessionKeys>,
        tuple: [u8; 64],
    },
    Done,
}

/// Responder side: `AwaitingHello → AwaitingAuth → Established`.
pub struct ResponderHandshake {
    buf: Vec<u8>,
    state: ResponderState,
}

/// Progress report from feeding bytes to the responder machine.
#[derive(Debug)]
pub enum ResponderStep {
    NeedMore,
    /// HELLO processed; `reply` (HELLO_REPLY) must be sent back.  The
    /// responder's session keys are already derived at this point.
    Reply(Vec<u8>),
    /// AUTH verified.  Coalesced post-handshake bytes are in `leftover`.
    Established {
        link: EstablishedLink,
        leftover: Vec<u8>,
    },
}

impl Default for ResponderHandshake {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponderHandshake {
    pub fn new() -> Self {
        Self {
            buf: Vec::new(),
            state: ResponderState::AwaitingHello,
        }
    }

    pub fn feed(
        &mut self,
        input: &[u8],
        identity: &NodeIdentity,
        pins: &mut PinBook,
    ) -> Result<ResponderStep, ChannelError> {
        self.feed_at(input, identity, pins, now_unix_secs())
    }

    /// Feed newly arrived bytes, evaluating the HELLO timestamp against
    /// `now_unix_secs`.
    pub fn feed_at(
        &mut self,
        input: &[u8],
        identity: &NodeIdentity,
        pins: &mut PinBook,
        now_unix_secs: u64,
    ) -> Result<ResponderStep, ChannelError> {
        self.buf.extend_from_slice(input);

        match &mut self.state {
            ResponderState::AwaitingHello => {
                if self.buf.len() < HELLO_LEN {
                    return Ok(ResponderStep::NeedMore);
                }
                let mut initiator_eph = [0u8; 32];
                initiator_eph.copy_from_slice(&self.buf[..32]);
                let mut ts_bytes = [0u8; 8];
                ts_bytes.copy_from_slice(&self.buf[32..HELLO_LEN]);
                let timestamp = u64::from_be_bytes(ts_bytes);
                if now_unix_secs.abs_diff(timestamp) > MAX_CLOCK_SKEW_SECS {
                    return Err(ChannelError::ClockSkew);
                }

                let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
                let responder_eph = X25519PublicKey::from(&eph_secret).to_bytes();
                let tuple = ephemeral_tuple(&initiator_eph, &responder_eph);

                // Server-role keys are derived immediately; only AUTH
                // verification remains before the link is usable.
                let dh = eph_secret.diffie_hellman(&X25519PublicKey::from(initiator_eph));
                let keys =
                    derive_session_keys(Role::Responder, &dh, &initiator_eph, &responder_eph);

                let signature = identity.signing.sign(&tuple);
                let mut reply = Vec::with_capacity(HELLO_REPLY_LEN);
                reply.extend_from_slice(&identity.verifying_key().to_bytes());
                reply.extend_from_slice(&responder_eph);
                reply.extend_from_slice(&signature.to_bytes());

                self.buf.drain(..HELLO_LEN);
                self.state = ResponderState::AwaitingAuth {
                    keys: Some(keys),
                    tuple,
                };
                Ok(ResponderStep::Reply(reply))
            }
            ResponderState::AwaitingAuth { keys, tuple } => {
                if self.buf.len() < AUTH_LEN {
                    return Ok(ResponderStep::NeedMore);
                }
                let mut initiator_static = [0u8; 32];
                initiator_static.copy_from_slice(&self.buf[..32]);
                let sig = &self.buf[32..AUTH_LEN];

                verify_tuple_signature(&initiator_static, tuple, sig)?;

                let peer_id = NodeId(initiator_static);
                pins.check_and_pin(peer_id, initiator_static)?;

                let keys = keys
                    .take()
                    .ok_or(ChannelError::Malformed("handshake already completed"))?;
                let leftover = self.buf.split_off(AUTH_LEN);
                self.buf.clear();
                self.state = ResponderState::Done;

                Ok(ResponderStep::Established {
                    link: EstablishedLink { keys, peer_id },
                    leftover,
                })
            }
            ResponderState::Done => Err(ChannelError::Malformed("handshake already completed")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SecureSession;

    fn run_handshake(
        initiator: &NodeIdentity,
        responder: &NodeIdentity,
        initiator_pins: &mut PinBook,
        responder_pins: &mut PinBook,
    ) -> Result<(EstablishedLink, EstablishedLink), ChannelError> {
        let (mut init, hello) = InitiatorHandshake::start();
        let mut resp = ResponderHandshake::new();

        let reply = match resp.feed(&hello, responder, responder_pins)? {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("responder must reply to a complete HELLO"),
        };

        let (auth, init_link) = match init.feed(&reply, initiator, initiator_pins)? {
            InitiatorStep::Established { auth, link, leftover } => {
                assert!(leftover.is_empty());
                (auth, link)
            }
            InitiatorStep::NeedMore => panic!("initiator must complete on full reply"),
        };

        let resp_link = match resp.feed(&auth, responder, responder_pins)? {
            ResponderStep::Established { link, leftover } => {
                assert!(leftover.is_empty());
                link
            }
            _ => panic!("responder must establish on full AUTH"),
        };

        Ok((init_link, resp_link))
    }

    #[test]
    fn handshake_derives_complementary_keys() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let (init_link, resp_link) = run_handshake(
            &a,
            &b,
            &mut PinBook::memory(),
            &mut PinBook::memory(),
        )
        .expect("handshake");

        assert_eq!(init_link.peer_id, b.id);
        assert_eq!(resp_link.peer_id, a.id);
        assert_eq!(init_link.keys.tx.expose(), resp_link.keys.rx.expose());
        assert_eq!(init_link.keys.rx.expose(), resp_link.keys.tx.expose());
    }

    #[test]
    fn established_sessions_interoperate() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let (init_link, resp_link) = run_handshake(
            &a,
            &b,
            &mut PinBook::memory(),
            &mut PinBook::memory(),
        )
        .expect("handshake");

        let init_session = SecureSession::new(&init_link.keys);
        let resp_session = SecureSession::new(&resp_link.keys);

        let packet = init_session.encrypt(b"ahoy").expect("encrypt");
        assert_eq!(resp_session.decrypt(&packet).expect("decrypt"), b"ahoy");
        let packet = resp_session.encrypt(b"ahoy back").expect("encrypt");
        assert_eq!(
            init_session.decrypt(&packet).expect("decrypt"),
            b"ahoy back"
        );
    }

    #[test]
    fn byte_at_a_time_delivery_still_establishes() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let mut a_pins = PinBook::memory();
        let mut b_pins = PinBook::memory();

        let (mut init, hello) = InitiatorHandshake::start();
        let mut resp = ResponderHandshake::new();

        let mut reply = None;
        for byte in &hello {
            match resp.feed(&[*byte], &b, &mut b_pins).expect("feed hello") {
                ResponderStep::NeedMore => {}
                ResponderStep::Reply(r) => reply = Some(r),
                _ => panic!("unexpected establishment"),
            }
        }
        let reply = reply.expect("reply after last hello byte");

        let mut auth = None;
        for byte in &reply {
            match init.feed(&[*byte], &a, &mut a_pins).expect("feed reply") {
                InitiatorStep::NeedMore => {}
                InitiatorStep::Established { auth: pkt, leftover, .. } => {
                    assert!(leftover.is_empty());
                    auth = Some(pkt);
                }
            }
        }
        let auth = auth.expect("auth after last reply byte");

        let mut established = false;
        for byte in &auth {
            match resp.feed(&[*byte], &b, &mut b_pins).expect("feed auth") {
                ResponderStep::NeedMore => {}
                ResponderStep::Established { link, .. } => {
                    assert_eq!(link.peer_id, a.id);
                    established = true;
                }
                _ => panic!("unexpected reply"),
            }
        }
        assert!(established);
    }

    #[test]
    fn coalesced_application_bytes_are_returned() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let mut a_pins = PinBook::memory();
        let mut b_pins = PinBook::memory();

        let (mut init, hello) = InitiatorHandshake::start();
        let mut resp = ResponderHandshake::new();

        let reply = match resp.feed(&hello, &b, &mut b_pins).expect("hello") {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("expected reply"),
        };

        let mut reply_plus = reply.clone();
        reply_plus.extend_from_slice(b"early frame bytes");
        let (auth, leftover) = match init.feed(&reply_plus, &a, &mut a_pins).expect("reply") {
            InitiatorStep::Established { auth, leftover, .. } => (auth, leftover),
            InitiatorStep::NeedMore => panic!("expected establishment"),
        };
        assert_eq!(leftover, b"early frame bytes");

        let mut auth_plus = auth.clone();
        auth_plus.extend_from_slice(b"more app data");
        match resp.feed(&auth_plus, &b, &mut b_pins).expect("auth") {
            ResponderStep::Established { leftover, .. } => {
                assert_eq!(leftover, b"more app data");
            }
            _ => panic!("expected establishment"),
        }
    }

    #[test]
    fn tampered_reply_signature_is_rejected() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();

        // Flip one bit in every signature byte; each must fail.
        for idx in 64..HELLO_REPLY_LEN {
            let (mut init, hello) = InitiatorHandshake::start();
            let mut resp = ResponderHandshake::new();
            let reply = match resp
                .feed(&hello, &b, &mut PinBook::memory())
                .expect("hello")
            {
                ResponderStep::Reply(reply) => reply,
                _ => panic!("expected reply"),
            };
            let mut tampered = reply;
            tampered[idx] ^= 0x40;
            let err = init
                .feed(&tampered, &a, &mut PinBook::memory())
                .expect_err("tampered signature");
            assert_eq!(err, ChannelError::SignatureInvalid, "byte {idx}");
        }
    }

    #[test]
    fn tampered_auth_signature_is_rejected() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let mut a_pins = PinBook::memory();
        let mut b_pins = PinBook::memory();

        let (mut init, hello) = InitiatorHandshake::start();
        let mut resp = ResponderHandshake::new();
        let reply = match resp.feed(&hello, &b, &mut b_pins).expect("hello") {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("expected reply"),
        };
        let auth = match init.feed(&reply, &a, &mut a_pins).expect("reply") {
            InitiatorStep::Established { auth, .. } => auth,
            InitiatorStep::NeedMore => panic!("expected establishment"),
        };

        let mut tampered = auth.clone();
        tampered[AUTH_LEN - 1] ^= 0x01;
        let err = resp
            .feed(&tampered, &b, &mut b_pins)
            .expect_err("tampered auth");
        assert_eq!(err, ChannelError::SignatureInvalid);
    }

    #[test]
    fn pinned_identity_conflict_rejects_responder() {
        let a = NodeIdentity::generate();
        let b = NodeIdentity::generate();
        let mut a_pins = PinBook::memory();
        // Simulate an earlier contact where b's id was bound to another key.
        a_pins
            .check_and_pin(b.id, [0xEEu8; 32])
            .expect("seed conflicting pin");

        let (mut init, hello) = InitiatorHandshake::start();
        let mut resp = ResponderHandshake::new();
        let reply = match resp
            .feed(&hello, &b, &mut PinBook::memory())
            .expect("hello")
        {
            ResponderStep::Reply(reply) => reply,
            _ => panic!("expected reply"),
        };

        let err = init
            .feed(&reply, &a, &mut a_pins)
            .expect_err("conflicting pin");
        assert_eq!(err, ChannelError::IdentityMismatch);
    }

    #[test]
    fn stale_hello_timestamp_is_rejected() {
        let b = NodeIdentity::generate();
        let now = now_unix_secs();
        let (_, hello) = InitiatorHandshake::start_at(now - MAX_CLOCK_SKEW_SECS - 1);
        let mut resp = ResponderHandshake::new();
        let err = resp
            .feed_at(&hello, &b, &mut PinBook::memory(), now)
            .expect_err("stale timestamp");
        assert_eq!(err, ChannelError::ClockSkew);
    }
}
