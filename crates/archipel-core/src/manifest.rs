// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Signed, content-addressed file manifests.
//!
//! The file id is the SHA-256 of the whole file, so identical bytes always
//! yield the identical id regardless of the chunk size chosen by the
//! sender.  The signature covers the SHA-256 of the CBOR-encoded unsigned
//! manifest.

use std::path::Path;

use ed25519_dalek::{Signature, Signer, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::ChannelError;
use crate::identity::NodeIdentity;
use crate::ids::{FileId, NodeId};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkInfo {
    pub index: u32,
    pub hash: [u8; 32],
    pub size: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileManifest {
    pub file_id: FileId,
    pub filename: String,
    pub size: u64,
    pub chunk_size: u32,
    pub nb_chunks: u32,
    pub chunks: Vec<ChunkInfo>,
    pub sender_id: NodeId,
    #[serde(with = "serde_bytes")]
    pub signature: Vec<u8>,
}

#[derive(Serialize)]
struct ManifestUnsigned<'a> {
    file_id: &'a FileId,
    filename: &'a str,
    size: u64,
    chunk_size: u32,
    nb_chunks: u32,
    chunks: &'a [ChunkInfo],
    sender_id: &'a NodeId,
}

/// `ceil(size / chunk_size)`.
pub fn chunk_count(size: u64, chunk_size: u32) -> u32 {
    if size == 0 {
        return 0;
    }
    (size.div_ceil(chunk_size as u64)) as u32
}

impl FileManifest {
    /// Build a manifest by streaming `path` once: the whole-file hash and
    /// every per-chunk hash are computed in a single pass.
    pub async fn build(
        path: &Path,
        chunk_size: u32,
        identity: &NodeIdentity,
    ) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be non-zero");
        }
        let filename = path
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("path has no file name: {}", path.display()))?
            .to_string_lossy()
            .into_owned();

        let mut file = tokio::fs::File::open(path).await?;
        let mut file_hasher = Sha256::new();
        let mut chunks = Vec::new();
        let mut size = 0u64;
        let mut buf = vec![0u8; chunk_size as usize];

        loop {
            // Fill up to one chunk; reads may return short counts.
            let mut filled = 0usize;
            while filled < buf.len() {
                let n = file.read(&mut buf[filled..]).await?;
                if n == 0 {
                    break;
                }
                filled += n;
            }
            if filled == 0 {
                break;
            }
            let chunk = &buf[..filled];
            file_hasher.update(chunk);
            chunks.push(ChunkInfo {
                index: chunks.len() as u32,
                hash: Sha256::digest(chunk).into(),
                size: filled as u32,
            });
            size += filled as u64;
            if filled < buf.len() {
                break;
            }
        }

        let file_id = FileId(file_hasher.finalize().into());
        Self::assemble(file_id, filename, size, chunk_size, chunks, identity)
    }

    /// Build a manifest from an in-memory buffer (small files, tests).
    pub fn from_bytes(
        bytes: &[u8],
        filename: &str,
        chunk_size: u32,
        identity: &NodeIdentity,
    ) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk size must be non-zero");
        }
        let chunks = bytes
            .chunks(chunk_size as usize)
            .enumerate()
            .map(|(index, chunk)| ChunkInfo {
                index: index as u32,
                hash: Sha256::digest(chunk).into(),
                size: chunk.len() as u32,
            })
            .collect();
        Self::assemble(
            FileId::from_bytes(bytes),
            filename.to_owned(),
            bytes.len() as u64,
            chunk_size,
            chunks,
            identity,
        )
    }

    fn assemble(
        file_id: FileId,
        filename: String,
        size: u64,
        chunk_size: u32,
        chunks: Vec<ChunkInfo>,
        identity: &NodeIdentity,
    ) -> anyhow::Result<Self> {
        let mut manifest = Self {
            file_id,
            filename,
            size,
            chunk_size,
            nb_chunks: chunks.len() as u32,
            chunks,
            sender_id: identity.id,
            signature: Vec::new(),
        };
        let hash = manifest.manifest_hash()?;
        manifest.signature = identity.signing.sign(&hash).to_bytes().to_vec();
        Ok(manifest)
    }

    /// SHA-256 over the CBOR encoding of the unsigned manifest fields.
    fn manifest_hash(&self) -> anyhow::Result<[u8; 32]> {
        let unsigned = ManifestUnsigned {
            file_id: &self.file_id,
            filename: &self.filename,
            size: self.size,
            chunk_size: self.chunk_size,
            nb_chunks: self.nb_chunks,
            chunks: &self.chunks,
            sender_id: &self.sender_id,
        };
        let bytes = crate::cbor::to_vec(&unsigned)?;
        Ok(Sha256::digest(bytes).into())
    }

    /// Check structural consistency and the sender signature.
    pub fn verify(&self) -> Result<(), ChannelError> {
        if self.nb_chunks as usize != self.chunks.len() {
            return Err(ChannelError::Malformed("chunk count mismatch"));
        }
        if self.chunk_size == 0 {
            return Err(ChannelError::Malformed("zero chunk size"));
        }
        if self.nb_chunks != chunk_count(self.size, self.chunk_size) {
            return Err(ChannelError::Malformed("chunk count does not match size"));
        }
        let mut total = 0u64;
        for (idx, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != idx {
                return Err(ChannelError::Malformed("chunk indices out of order"));
            }
            let expected = self.expected_chunk_size(chunk.index);
            if chunk.size != expected {
                return Err(ChannelError::Malformed("chunk size inconsistent"));
            }
            total += chunk.size as u64;
        }
        if total != self.size {
            return Err(ChannelError::Malformed("chunk sizes do not sum to size"));
        }

        if self.signature.len() != 64 {
            return Err(ChannelError::Malformed("signature must be 64 bytes"));
        }
        let pubkey = VerifyingKey::from_bytes(&self.sender_id.0)
            .map_err(|_| ChannelError::SignatureInvalid)?;
        let mut sig = [0u8; 64];
        sig.copy_from_slice(&self.signature);
        let hash = self
            .manifest_hash()
            .map_err(|_| ChannelError::Malformed("manifest not encodable"))?;
        pubkey
            .verify(&hash, &Signature::from_bytes(&sig))
            .map_err(|_| ChannelError::SignatureInvalid)
    }

    /// Size the chunk at `index` must have according to `size`/`chunk_size`.
    pub fn expected_chunk_size(&self, index: u32) -> u32 {
        let start = index as u64 * self.chunk_size as u64;
        let end = (start + self.chunk_size as u64).min(self.size);
        end.saturating_sub(start) as u32
    }

    /// Byte offset of the chunk at `index`.
    pub fn chunk_offset(&self, index: u32) -> u64 {
        index as u64 * self.chunk_size as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity::generate()
    }

    #[test]
    fn file_id_is_independent_of_chunk_size() {
        let sender = identity();
        let bytes = vec![0x42u8; 10_000];
        let small = FileManifest::from_bytes(&bytes, "a.bin", 1024, &sender).expect("manifest");
        let large = FileManifest::from_bytes(&bytes, "a.bin", 4096, &sender).expect("manifest");
        assert_eq!(small.file_id, large.file_id);
        assert_ne!(small.nb_chunks, large.nb_chunks);
    }

    #[test]
    fn chunk_hashes_are_deterministic() {
        let sender = identity();
        let bytes = vec![7u8; 5_000];
        let a = FileManifest::from_bytes(&bytes, "a.bin", 1024, &sender).expect("manifest");
        let b = FileManifest::from_bytes(&bytes, "a.bin", 1024, &sender).expect("manifest");
        let hashes_a: Vec<_> = a.chunks.iter().map(|c| c.hash).collect();
        let hashes_b: Vec<_> = b.chunks.iter().map(|c| c.hash).collect();
        assert_eq!(hashes_a, hashes_b);
    }

    #[test]
    fn chunk_count_is_ceiling_division() {
        assert_eq!(chunk_count(0, 1024), 0);
        assert_eq!(chunk_count(1, 1024), 1);
        assert_eq!(chunk_count(1024, 1024), 1);
        assert_eq!(chunk_count(1025, 1024), 2);
        assert_eq!(chunk_count(10 * 1024 * 1024, 512 * 1024), 20);
    }

    #[test]
    fn final_chunk_may_be_short() {
        let sender = identity();
        let bytes = vec![1u8; 2_500];
        let manifest = FileManifest::from_bytes(&bytes, "a.bin", 1024, &sender).expect("manifest");
        assert_eq!(manifest.nb_chunks, 3);
        assert_eq!(manifest.chunks[0].size, 1024);
        assert_eq!(manifest.chunks[2].size, 452);
        manifest.verify().expect("valid manifest");
    }

    #[test]
    fn empty_file_has_zero_chunks() {
        let sender = identity();
        let manifest = FileManifest::from_bytes(&[], "empty", 1024, &sender).expect("manifest");
        assert_eq!(manifest.nb_chunks, 0);
        assert_eq!(manifest.size, 0);
        manifest.verify().expect("valid manifest");
    }

    #[test]
    fn tampered_manifest_fails_verification() {
        let sender = identity();
        let bytes = vec![9u8; 3_000];
        let manifest = FileManifest::from_bytes(&bytes, "a.bin", 1024, &sender).expect("manifest");

        let mut wrong_name = manifest.clone();
        wrong_name.filename = "b.bin".to_owned();
        assert_eq!(
            wrong_name.verify().expect_err("renamed"),
            ChannelError::SignatureInvalid
        );

        let mut wrong_sig = manifest.clone();
        wrong_sig.signature[10] ^= 1;
        assert_eq!(
            wrong_sig.verify().expect_err("flipped signature"),
            ChannelError::SignatureInvalid
        );

        let mut wrong_count = manifest.clone();
        wrong_count.nb_chunks = 2;
        assert!(matches!(
            wrong_count.verify().expect_err("bad count"),
            ChannelError::Malformed(_)
        ));
    }

    #[tokio::test]
    async fn streaming_build_matches_in_memory_build() {
        let sender = identity();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("payload.bin");
        let bytes: Vec<u8> = (0..5_000u32).map(|i| (i % 251) as u8).collect();
        tokio::fs::write(&path, &bytes).await.expect("write");

        let streamed = FileManifest::build(&path, 1024, &sender)
            .await
            .expect("streamed manifest");
        let buffered =
            FileManifest::from_bytes(&bytes, "payload.bin", 1024, &sender).expect("manifest");

        assert_eq!(streamed.file_id, buffered.file_id);
        assert_eq!(streamed.size, buffered.size);
        assert_eq!(streamed.chunks, buffered.chunks);
        streamed.verify().expect("valid manifest");
    }
}
