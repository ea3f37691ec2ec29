// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Anonymous-sender sealed boxes for relay-and-forward messaging.
//!
//! The sender seals plaintext to the recipient's static Ed25519 key
//! converted to its X25519 form, using a fresh ephemeral keypair.  No
//! forward secrecy and no sender authentication at this layer: the
//! deliberate tradeoff for store-less forwarding.
//!
//! Packet layout: `ephemeral_pub (32) ‖ nonce (12) ‖ tag (16) ‖ ciphertext`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use ed25519_dalek::VerifyingKey;
use rand::RngCore;
use x25519_dalek::{EphemeralSecret, PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::config::RELAY_DEDUP_WINDOW;
use crate::error::ChannelError;
use crate::identity::NodeIdentity;
use crate::ids::NodeId;
use crate::session::{NONCE_LEN, TAG_LEN};

const SEAL_KDF_CONTEXT: &str = "archipel v1 relay seal";
const SEAL_OVERHEAD: usize = 32 + NONCE_LEN + TAG_LEN;

fn seal_key(dh: &[u8], ephemeral_pub: &[u8; 32], recipient_x: &[u8; 32]) -> [u8; 32] {
    let mut ikm = Vec::with_capacity(96);
    ikm.extend_from_slice(dh);
    ikm.extend_from_slice(ephemeral_pub);
    ikm.extend_from_slice(recipient_x);
    let key = blake3::derive_key(SEAL_KDF_CONTEXT, &ikm);
    ikm.zeroize();
    key
}

/// Seal `plaintext` so only the holder of `recipient`'s Ed25519 private
/// key can open it.
pub fn seal(recipient: &NodeId, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
    let ed_pubkey =
        VerifyingKey::from_bytes(&recipient.0).map_err(|_| ChannelError::EncryptionFailed)?;
    let recipient_x = ed_pubkey.to_montgomery().to_bytes();

    let eph_secret = EphemeralSecret::random_from_rng(rand::rngs::OsRng);
    let eph_pub = X25519PublicKey::from(&eph_secret).to_bytes();
    let dh = eph_secret.diffie_hellman(&X25519PublicKey::from(recipient_x));

    let key = seal_key(dh.as_bytes(), &eph_pub, &recipient_x);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);

    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
        .map_err(|_| ChannelError::EncryptionFailed)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut packet = Vec::with_capacity(SEAL_OVERHEAD + body.len());
    packet.extend_from_slice(&eph_pub);
    packet.extend_from_slice(&nonce);
    packet.extend_from_slice(tag);
    packet.extend_from_slice(body);
    Ok(packet)
}

/// Attempt to open a sealed packet with the local keypair.
pub fn open(identity: &NodeIdentity, packet: &[u8]) -> Result<Vec<u8>, ChannelError> {
    if packet.len() < SEAL_OVERHEAD {
        return Err(ChannelError::DecryptionFailed);
    }
    let mut eph_pub = [0u8; 32];
    eph_pub.copy_from_slice(&packet[..32]);
    let nonce = &packet[32..32 + NONCE_LEN];
    let tag = &packet[32 + NONCE_LEN..SEAL_OVERHEAD];
    let body = &packet[SEAL_OVERHEAD..];

    // Ed25519 secret scalar reused as the X25519 static secret, matching
    // the public-key Montgomery conversion on the sealing side.
    let scalar = identity.signing.to_scalar_bytes();
    let x_secret = StaticSecret::from(scalar);
    let recipient_x = identity.verifying_key().to_montgomery().to_bytes();
    let dh = x_secret.diffie_hellman(&X25519PublicKey::from(eph_pub));

    let key = seal_key(dh.as_bytes(), &eph_pub, &recipient_x);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload::from(sealed.as_slice()))
        .map_err(|_| ChannelError::DecryptionFailed)
}

/// Duplicate suppression for relay packets.
///
/// A hop computes a key from (from, to, tail of the sealed payload); a
/// repeat inside the window is dropped silently, preventing loops and
/// broadcast storms.  Entries are pruned once they fall out of the window.
#[derive(Debug)]
pub struct RelayDedup {
    window: Duration,
    seen: HashMap<[u8; 32], Instant>,
}

impl Default for RelayDedup {
    fn default() -> Self {
        Self::new(RELAY_DEDUP_WINDOW)
    }
}

impl RelayDedup {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            seen: HashMap::new(),
        }
    }

    /// Record a packet sighting.  Returns `true` if the packet is fresh
    /// and should be processed, `false` if it is a duplicate.
    pub fn check_and_record(
        &mut self,
        from: &NodeId,
        to: &NodeId,
        sealed: &[u8],
        now: Instant,
    ) -> bool {
        self.prune(now);
        let key = dedup_key(from, to, sealed);
        if self.seen.contains_key(&key) {
            return false;
        }
        self.seen.insert(key, now);
        true
    }

    fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.seen
            .retain(|_, seen_at| now.duration_since(*seen_at) < window);
    }
}

fn dedup_key(from: &NodeId, to: &NodeId, sealed: &[u8]) -> [u8; 32] {
    let tail_start = sealed.len().saturating_sub(16);
    let mut hasher = blake3::Hasher::new();
    hasher.update(&from.0);
    hasher.update(&to.0);
    hasher.update(&sealed[tail_start..]);
    *hasher.finalize().as_bytes()
}
