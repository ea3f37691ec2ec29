// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Symmetric session cipher for an established connection.
//!
//! One ChaCha20-Poly1305 cipher per direction; rx/tx are never reused
//! across directions or connections.  Packet layout:
//! `nonce (12) ‖ tag (16) ‖ ciphertext`.

use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::ChannelError;

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;
/// Minimum length of a valid encrypted packet.
pub const PACKET_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// 32 bytes of key material, zeroed on drop.
pub struct SecretBytes(pub(crate) [u8; 32]);

impl SecretBytes {
    pub fn expose(&self) -> &[u8; 32] {
        &self.0
    }
}

impl Drop for SecretBytes {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl std::fmt::Debug for SecretBytes {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBytes(..)")
    }
}

/// Per-direction session keys derived from the handshake.  Each side's tx
/// equals the peer's rx.
#[derive(Debug)]
pub struct SessionKeys {
    pub rx: SecretBytes,
    pub tx: SecretBytes,
}

/// Authenticated encryption over one established connection.
pub struct SecureSession {
    rx: ChaCha20Poly1305,
    tx: ChaCha20Poly1305,
}

impl SecureSession {
    pub fn new(keys: &SessionKeys) -> Self {
        Self {
            rx: ChaCha20Poly1305::new(Key::from_slice(keys.rx.expose())),
            tx: ChaCha20Poly1305::new(Key::from_slice(keys.tx.expose())),
        }
    }

    /// Encrypt `plaintext` under the tx key with a fresh random 96-bit
    /// nonce.  Returns `nonce ‖ tag ‖ ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, ChannelError> {
        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        // The aead crate appends the tag; re-order to the wire layout.
        let sealed = self
            .tx
            .encrypt(Nonce::from_slice(&nonce), Payload::from(plaintext))
            .map_err(|_| ChannelError::EncryptionFailed)?;
        let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

        let mut packet = Vec::with_capacity(PACKET_OVERHEAD + body.len());
        packet.extend_from_slice(&nonce);
        packet.extend_from_slice(tag);
        packet.extend_from_slice(body);
        Ok(packet)
    }

    /// Decrypt a `nonce ‖ tag ‖ ciphertext` packet under the rx key.
    ///
    /// Truncated input and authentication failure both surface as
    /// [`ChannelError::DecryptionFailed`].
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, ChannelError> {
        if packet.len() < PACKET_OVERHEAD {
            return Err(ChannelError::DecryptionFailed);
        }
        let nonce = &packet[..NONCE_LEN];
        let tag = &packet[NONCE_LEN..PACKET_OVERHEAD];
        let body = &packet[PACKET_OVERHEAD..];

        let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
        sealed.extend_from_slice(body);
        sealed.extend_from_slice(tag);

        self.rx
            .decrypt(Nonce::from_slice(nonce), Payload::from(sealed.as_slice()))
            .map_err(|_| ChannelError::DecryptionFailed)
    }
}
