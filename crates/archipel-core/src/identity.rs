// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Static node identity, trust-on-first-use pinning, and the append-only
//! web-of-trust log.
//!
//! All three stores are small JSON dotfiles keyed by the node's listen
//! port, rewritten wholesale on change via a temp-file rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;
use crate::ids::NodeId;

/// A node's static signing keypair.  Generated once per listen port and
/// immutable thereafter.
#[derive(Clone)]
pub struct NodeIdentity {
    pub signing: SigningKey,
    pub id: NodeId,
}

impl NodeIdentity {
    pub fn generate() -> Self {
        let mut rng = rand::rngs::OsRng;
        let signing = SigningKey::generate(&mut rng);
        let id = NodeId::from_pubkey(&signing.verifying_key());
        Self { signing, id }
    }

    /// Load the identity file for `port`, or generate and persist a fresh
    /// keypair if none exists yet.
    pub fn load_or_generate(data_dir: &Path, port: u16) -> anyhow::Result<Self> {
        let path = identity_path(data_dir, port);
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: IdentityFile = serde_json::from_str(&raw)?;
            let secret: [u8; 32] = hex::decode(&file.private_key)?
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("identity private key must be 32 bytes"))?;
            let signing = SigningKey::from_bytes(&secret);
            let id = NodeId::from_pubkey(&signing.verifying_key());
            if id.to_hex() != file.id {
                anyhow::bail!("identity file id does not match keypair");
            }
            return Ok(Self { signing, id });
        }

        let identity = Self::generate();
        let file = IdentityFile {
            public_key: hex::encode(identity.signing.verifying_key().to_bytes()),
            private_key: hex::encode(identity.signing.to_bytes()),
            id: identity.id.to_hex(),
        };
        write_json_atomic(&path, &file)?;
        Ok(identity)
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing.verifying_key()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeIdentity({})", self.id.short())
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    public_key: String,
    private_key: String,
    id: String,
}

fn identity_path(data_dir: &Path, port: u16) -> PathBuf {
    data_dir.join(format!(".archipel_identity_{port}.json"))
}

/// Outcome of a TOFU check against the pin book.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinOutcome {
    /// First contact: the key was pinned.
    Pinned,
    /// The presented key matches the existing pin.
    Known,
}

/// Trust-on-first-use store of peer id → pinned public key.
///
/// Once an id is pinned, any later handshake presenting a different key for
/// that id is rejected with [`ChannelError::IdentityMismatch`].
#[derive(Debug, Default)]
pub struct PinBook {
    path: Option<PathBuf>,
    pins: HashMap<NodeId, [u8; 32]>,
}

impl PinBook {
    /// In-memory pin book (tests, ephemeral nodes).
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn open(data_dir: &Path, port: u16) -> anyhow::Result<Self> {
        let path = data_dir.join(format!(".archipel_trusted_peers_{port}.json"));
        let mut pins = HashMap::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: HashMap<String, String> = serde_json::from_str(&raw)?;
            for (id_hex, key_hex) in file {
                let id = NodeId::from_hex(&id_hex)?;
                let key: [u8; 32] = hex::decode(&key_hex)?
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("pinned key must be 32 bytes"))?;
                pins.insert(id, key);
            }
        }
        Ok(Self {
            path: Some(path),
            pins,
        })
    }

    /// TOFU check: pin on first sight, verify on every later sight.
    pub fn check_and_pin(&mut self, id: NodeId, key: [u8; 32]) -> Result<PinOutcome, ChannelError> {
        match self.pins.get(&id) {
            Some(pinned) if *pinned == key => Ok(PinOutcome::Known),
            Some(_) => Err(ChannelError::IdentityMismatch),
            None => {
                self.pins.insert(id, key);
                self.save();
                Ok(PinOutcome::Pinned)
            }
        }
    }

    pub fn pinned_key(&self, id: &NodeId) -> Option<[u8; 32]> {
        self.pins.get(id).copied()
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        let file: HashMap<String, String> = self
            .pins
            .iter()
            .map(|(id, key)| (id.to_hex(), hex::encode(key)))
            .collect();
        if let Err(err) = write_json_atomic(path, &file) {
            tracing::warn!(path = %path.display(), %err, "failed to persist pin book");
        }
    }
}

/// A signed claim that `signer_id` vouches for the binding of `target_id`
/// to `target_key`.  Self-verifying: the signer's id is its public key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustAssertion {
    pub target_id: NodeId,
    pub target_key: [u8; 32],
    pub signer_id: NodeId,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
    pub timestamp: u64,
}

impl TrustAssertion {
    pub fn sign(identity: &NodeIdentity, target_id: NodeId, target_key: [u8; 32]) -> Self {
        let signature = identity.signing.sign(&signable(&target_id, &target_key));
        Self {
            target_id,
            target_key,
            signer_id: identity.id,
            signature: signature.to_bytes().to_vec(),
            timestamp: unix_now(),
        }
    }

    pub fn verify(&self) -> Result<(), ChannelError> {
        if self.signature.len() != 64 {
            return Err(ChannelError::Malformed("trust signature must be 64 bytes"));
        }
        let pubkey = VerifyingKey::from_bytes(&self.signer_id.0)
            .map_err(|_| ChannelError::SignatureInvalid)?;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&self.signature);
        pubkey
            .verify(
                &signable(&self.target_id, &self.target_key),
                &Signature::from_bytes(&sig),
            )
            .map_err(|_| ChannelError::SignatureInvalid)
    }
}

fn signable(target_id: &NodeId, target_key: &[u8; 32]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(64);
    msg.extend_from_slice(&target_id.0);
    msg.extend_from_slice(target_key);
    msg
}

fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Append-only web-of-trust log.
#[derive(Debug, Default)]
pub struct TrustLog {
    path: Option<PathBuf>,
    assertions: Vec<TrustAssertion>,
}

impl TrustLog {
    pub fn memory() -> Self {
        Self::default()
    }

    pub fn open(data_dir: &Path, port: u16) -> anyhow::Result<Self> {
        let path = data_dir.join(format!(".archipel_web_of_trust_{port}.json"));
        let mut assertions = Vec::new();
        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let file: Vec<AssertionRecord> = serde_json::from_str(&raw)?;
            for record in file {
                assertions.push(record.into_assertion()?);
            }
        }
        Ok(Self {
            path: Some(path),
            assertions,
        })
    }

    /// Append a verified assertion.  Duplicates are ignored.
    pub fn append(&mut self, assertion: TrustAssertion) {
        if self.assertions.contains(&assertion) {
            return;
        }
        self.assertions.push(assertion);
        self.save();
    }

    pub fn assertions_for(&self, target: &NodeId) -> Vec<&TrustAssertion> {
        self.assertions
            .iter()
            .filter(|a| a.target_id == *target)
            .collect()
    }

    pub fn all(&self) -> &[TrustAssertion] {
        &self.assertions
    }

    fn save(&self) {
        let Some(path) = &self.path else { return };
        let file: Vec<AssertionRecord> =
            self.assertions.iter().map(AssertionRecord::from).collect();
        if let Err(err) = write_json_atomic(path, &file) {
            tracing::warn!(path = %path.display(), %err, "failed to persist trust log");
        }
    }
}

#[derive(Serialize, Deserialize)]
struct AssertionRecord {
    target_id: String,
    target_key: String,
    signer_id: String,
    signature: String,
    timestamp: u64,
}

impl AssertionRecord {
    fn into_assertion(self) -> anyhow::Result<TrustAssertion> {
        Ok(TrustAssertion {
            target_id: NodeId::from_hex(&self.target_id)?,
            target_key: hex::decode(&self.target_key)?
                .as_slice()
                .try_into()
                .map_err(|_| anyhow::anyhow!("target key must be 32 bytes"))?,
            signer_id: NodeId::from_hex(&self.signer_id)?,
            signature: hex::decode(&self.signature)?,
            timestamp: self.timestamp,
        })
    }
}

impl From<&TrustAssertion> for AssertionRecord {
    fn from(a: &TrustAssertion) -> Self {
        Self {
            target_id: a.target_id.to_hex(),
            target_key: hex::encode(a.target_key),
            signer_id: a.signer_id.to_hex(),
            signature: hex::encode(&a.signature),
            timestamp: a.timestamp,
        }
    }
}

/// Write `value` as pretty JSON to `path` via a sibling temp file and
/// rename, so readers never observe a half-written file.
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_string_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_survives_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let first = NodeIdentity::load_or_generate(dir.path(), 7777).expect("generate");
        let second = NodeIdentity::load_or_generate(dir.path(), 7777).expect("reload");
        assert_eq!(first.id, second.id);
        assert_eq!(first.signing.to_bytes(), second.signing.to_bytes());
    }

    #[test]
    fn identities_are_per_port() {
        let dir = tempfile::tempdir().expect("tempdir");
        let a = NodeIdentity::load_or_generate(dir.path(), 7777).expect("a");
        let b = NodeIdentity::load_or_generate(dir.path(), 7778).expect("b");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn tofu_pins_first_key_and_rejects_conflicts() {
        let mut pins = PinBook::memory();
        let id = NodeId([7u8; 32]);

        assert_eq!(
            pins.check_and_pin(id, [1u8; 32]).expect("first sight"),
            PinOutcome::Pinned
        );
        assert_eq!(
            pins.check_and_pin(id, [1u8; 32]).expect("same key"),
            PinOutcome::Known
        );
        assert_eq!(
            pins.check_and_pin(id, [2u8; 32]).expect_err("conflicting key"),
            ChannelError::IdentityMismatch
        );
    }

    #[test]
    fn pin_book_persists_across_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = NodeId([9u8; 32]);
        {
            let mut pins = PinBook::open(dir.path(), 7777).expect("open");
            pins.check_and_pin(id, [3u8; 32]).expect("pin");
        }
        let mut pins = PinBook::open(dir.path(), 7777).expect("reopen");
        assert_eq!(
            pins.check_and_pin(id, [4u8; 32]).expect_err("reloaded pin"),
            ChannelError::IdentityMismatch
        );
    }

    #[test]
    fn trust_assertion_sign_verify_roundtrip() {
        let signer = NodeIdentity::generate();
        let target = NodeIdentity::generate();
        let assertion = TrustAssertion::sign(&signer, target.id, target.id.0);
        assertion.verify().expect("valid assertion");

        let mut tampered = assertion.clone();
        tampered.signature[0] ^= 1;
        assert_eq!(
            tampered.verify().expect_err("tampered"),
            ChannelError::SignatureInvalid
        );
    }

    #[test]
    fn trust_log_appends_once_and_reloads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let signer = NodeIdentity::generate();
        let target = NodeIdentity::generate();
        let assertion = TrustAssertion::sign(&signer, target.id, target.id.0);
        {
            let mut log = TrustLog::open(dir.path(), 7777).expect("open");
            log.append(assertion.clone());
            log.append(assertion.clone());
            assert_eq!(log.all().len(), 1);
        }
        let log = TrustLog::open(dir.path(), 7777).expect("reopen");
        assert_eq!(log.all().len(), 1);
        assert_eq!(log.assertions_for(&target.id).len(), 1);
    }
}
