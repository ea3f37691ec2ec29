// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Chunked transfer engine: serving shared files and assembling verified,
//! resumable downloads.
//!
//! Chunks are served straight from the source file on disk (no blob
//! copies).  A download owns a preallocated temp file and a bitfield; a
//! chunk is written only after its SHA-256 matches the manifest entry, and
//! the temp file is atomically renamed into place once the bitfield is
//! full.  Chunk arrival order is unconstrained: duplicates and reordering
//! are absorbed by the bitfield.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tracing::{debug, info, warn};

use crate::identity::write_json_atomic;
use crate::ids::FileId;
use crate::manifest::FileManifest;

/// A locally shared file: its manifest plus where the bytes live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedFile {
    pub manifest: FileManifest,
    pub path: PathBuf,
}

/// An in-progress download.
#[derive(Debug)]
pub struct Download {
    pub manifest: FileManifest,
    bitfield: Vec<bool>,
    remaining: u32,
    in_flight: HashSet<u32>,
    temp_path: PathBuf,
    output_path: PathBuf,
    file: tokio::fs::File,
}

impl Download {
    pub fn completed_chunks(&self) -> u32 {
        self.manifest.nb_chunks - self.remaining
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Result of offering a received chunk to a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    /// Hash matched and the chunk was written.  `complete` is true only on
    /// the transition that fills the bitfield.
    Verified { newly_set: bool, complete: bool },
    /// Hash mismatch: discarded, bitfield unchanged, re-requestable.
    HashMismatch,
    /// No download is tracked for this file id.
    UnknownDownload,
    /// Chunk index beyond the manifest.
    UnknownChunk,
}

/// Owns the shared-file index and all download state.  The on-disk content
/// index (manifests + source paths) is rewritten wholesale on change.
#[derive(Debug)]
pub struct TransferEngine {
    index_path: PathBuf,
    download_dir: PathBuf,
    shared: HashMap<FileId, SharedFile>,
    downloads: HashMap<FileId, Download>,
}

impl TransferEngine {
    pub fn open(data_dir: &Path, download_dir: &Path, port: u16) -> anyhow::Result<Self> {
        let index_path = data_dir.join(format!(".archipel_content_index_{port}.json"));
        let mut shared = HashMap::new();
        if index_path.exists() {
            let raw = std::fs::read_to_string(&index_path)?;
            let entries: Vec<SharedFile> = serde_json::from_str(&raw)?;
            for entry in entries {
                shared.insert(entry.manifest.file_id, entry);
            }
        }
        Ok(Self {
            index_path,
            download_dir: download_dir.to_owned(),
            shared,
            downloads: HashMap::new(),
        })
    }

    // ── Sharing / serving ───────────────────────────────────────────────

    /// Index a manifest + source path for serving.
    pub fn share(&mut self, manifest: FileManifest, path: PathBuf) {
        let file_id = manifest.file_id;
        self.shared.insert(file_id, SharedFile { manifest, path });
        self.persist_index();
        debug!(file_id = %file_id.short(), "file indexed for sharing");
    }

    pub fn shared_manifest(&self, file_id: &FileId) -> Option<&FileManifest> {
        self.shared.get(file_id).map(|entry| &entry.manifest)
    }

    pub fn shared_files(&self) -> Vec<&SharedFile> {
        self.shared.values().collect()
    }

    pub fn is_shared(&self, file_id: &FileId) -> bool {
        self.shared.contains_key(file_id)
    }

    /// Read exactly the recorded chunk at the recorded offset from a
    /// shared file.  Returns `Ok(None)` when the file id is unknown, the
    /// source file is gone, or the region is unavailable; the caller
    /// replies with a negative ack, never fails silently.
    pub async fn read_chunk(&self, file_id: &FileId, index: u32) -> anyhow::Result<Option<Vec<u8>>> {
        let Some(entry) = self.shared.get(file_id) else {
            return Ok(None);
        };
        let Some(chunk) = entry.manifest.chunks.get(index as usize) else {
            return Ok(None);
        };

        let mut file = match tokio::fs::File::open(&entry.path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %entry.path.display(), "shared source file missing");
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        let offset = entry.manifest.chunk_offset(index);
        if file.metadata().await?.len() < offset + chunk.size as u64 {
            warn!(
                file_id = %file_id.short(),
                index,
                "shared source file shorter than manifest region"
            );
            return Ok(None);
        }
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; chunk.size as usize];
        file.read_exact(&mut buf).await?;
        Ok(Some(buf))
    }

    // ── Downloading ─────────────────────────────────────────────────────

    pub fn download(&self, file_id: &FileId) -> Option<&Download> {
        self.downloads.get(file_id)
    }

    pub fn is_downloading(&self, file_id: &FileId) -> bool {
        self.downloads.contains_key(file_id)
    }

    /// Start tracking a download: preallocate the temp file to the full
    /// size and initialize an all-false bitfield of `nb_chunks`.
    ///
    /// Returns `true` if the download is already complete (zero chunks)
    /// and should be finalized immediately.
    pub async fn begin_download(&mut self, manifest: FileManifest) -> anyhow::Result<bool> {
        let file_id = manifest.file_id;
        if self.downloads.contains_key(&file_id) {
            anyhow::bail!("download already in progress for {file_id}");
        }

        tokio::fs::create_dir_all(&self.download_dir).await?;
        let temp_path = self
            .download_dir
            .join(format!(".{}.part", file_id.to_hex()));
        let output_path = self.download_dir.join(sanitize_filename(&manifest.filename));

        let file = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp_path)
            .await?;
        file.set_len(manifest.size).await?;

        let nb_chunks = manifest.nb_chunks;
        info!(
            file_id = %file_id.short(),
            filename = %manifest.filename,
            size = manifest.size,
            nb_chunks,
            "download started"
        );
        self.downloads.insert(
            file_id,
            Download {
                bitfield: vec![false; nb_chunks as usize],
                remaining: nb_chunks,
                in_flight: HashSet::new(),
                temp_path,
                output_path,
                file,
                manifest,
            },
        );
        Ok(nb_chunks == 0)
    }

    /// Pick up to `window - in_flight` missing chunks to request next and
    /// mark them in flight.
    pub fn next_requests(&mut self, file_id: &FileId, window: usize) -> Vec<u32> {
        let Some(download) = self.downloads.get_mut(file_id) else {
            return Vec::new();
        };
        let budget = window.saturating_sub(download.in_flight.len());
        let mut picked = Vec::new();
        for index in 0..download.manifest.nb_chunks {
            if picked.len() >= budget {
                break;
            }
            if !download.bitfield[index as usize] && !download.in_flight.contains(&index) {
                download.in_flight.insert(index);
                picked.push(index);
            }
        }
        picked
    }

    /// A request slot came back empty (negative ack or mismatch); free it
    /// so the chunk can be re-requested.
    pub fn release_request(&mut self, file_id: &FileId, index: u32) {
        if let Some(download) = self.downloads.get_mut(file_id) {
            download.in_flight.remove(&index);
        }
    }

    /// Verify and write one received chunk.  Re-delivery of an already-set
    /// chunk is accepted idempotently: re-verified, re-written, no error.
    pub async fn accept_chunk(
        &mut self,
        file_id: &FileId,
        index: u32,
        data: &[u8],
    ) -> anyhow::Result<ChunkOutcome> {
        let Some(download) = self.downloads.get_mut(file_id) else {
            return Ok(ChunkOutcome::UnknownDownload);
        };
        download.in_flight.remove(&index);
        let Some(expected) = download.manifest.chunks.get(index as usize) else {
            return Ok(ChunkOutcome::UnknownChunk);
        };

        let actual: [u8; 32] = Sha256::digest(data).into();
        if actual != expected.hash || data.len() != expected.size as usize {
            warn!(
                file_id = %file_id.short(),
                index,
                "chunk failed integrity check, discarding"
            );
            return Ok(ChunkOutcome::HashMismatch);
        }

        download
            .file
            .seek(SeekFrom::Start(download.manifest.chunk_offset(index)))
            .await?;
        download.file.write_all(data).await?;

        let newly_set = !download.bitfield[index as usize];
        if newly_set {
            download.bitfield[index as usize] = true;
            download.remaining -= 1;
        }
        Ok(ChunkOutcome::Verified {
            newly_set,
            complete: newly_set && download.remaining == 0,
        })
    }

    /// Promote a complete download: flush, atomically rename the temp file
    /// to its final path, and register the result as a locally shared file
    /// (the downloader becomes a provider).
    pub async fn finalize(&mut self, file_id: &FileId) -> anyhow::Result<PathBuf> {
        let download = self
            .downloads
            .get(file_id)
            .ok_or_else(|| anyhow::anyhow!("no download tracked for {file_id}"))?;
        if !download.is_complete() {
            anyhow::bail!(
                "download incomplete: {}/{} chunks",
                download.completed_chunks(),
                download.manifest.nb_chunks
            );
        }
        let mut download = self
            .downloads
            .remove(file_id)
            .ok_or_else(|| anyhow::anyhow!("no download tracked for {file_id}"))?;

        download.file.flush().await?;
        download.file.sync_all().await?;
        drop(download.file);
        tokio::fs::rename(&download.temp_path, &download.output_path).await?;

        info!(
            file_id = %file_id.short(),
            path = %download.output_path.display(),
            "download complete and verified"
        );
        let output = download.output_path.clone();
        self.share(download.manifest, download.output_path);
        Ok(output)
    }

    fn persist_index(&self) {
        let entries: Vec<&SharedFile> = self.shared.values().collect();
        if let Err(err) = write_json_atomic(&self.index_path, &entries) {
            warn!(path = %self.index_path.display(), %err, "failed to persist content index");
        }
    }
}

/// Reduce a manifest-supplied filename to its final path component so a
/// hostile sender cannot traverse out of the download directory.
fn sanitize_filename(filename: &str) -> String {
    Path::new(filename)
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| name != ".." && !name.is_empty())
        .unwrap_or_else(|| "download.bin".to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeIdentity;

    const TEST_CHUNK: u32 = 16;

    fn engines(dir: &Path) -> (TransferEngine, TransferEngine) {
        let seeder = TransferEngine::open(dir, &dir.join("seeder_dl"), 7777).expect("seeder");
        let leecher = TransferEngine::open(dir, &dir.join("leecher_dl"), 7778).expect("leecher");
        (seeder, leecher)
    }

    async fn seed_file(
        engine: &mut TransferEngine,
        dir: &Path,
        name: &str,
        bytes: &[u8],
    ) -> FileManifest {
        let identity = NodeIdentity::generate();
        let path = dir.join(name);
        tokio::fs::write(&path, bytes).await.expect("write source");
        let manifest = FileManifest::build(&path, TEST_CHUNK, &identity)
            .await
            .expect("manifest");
        engine.share(manifest.clone(), path);
        manifest
    }

    #[tokio::test]
    async fn out_of_order_download_reconstructs_source() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, mut leecher) = engines(dir.path());
        let bytes: Vec<u8> = (0..100u8).collect();
        let manifest = seed_file(&mut seeder, dir.path(), "src.bin", &bytes).await;

        let complete = leecher
            .begin_download(manifest.clone())
            .await
            .expect("begin");
        assert!(!complete);

        // Deliver chunks in reverse order.
        for index in (0..manifest.nb_chunks).rev() {
            let chunk = seeder
                .read_chunk(&manifest.file_id, index)
                .await
                .expect("read")
                .expect("chunk exists");
            let outcome = leecher
                .accept_chunk(&manifest.file_id, index, &chunk)
                .await
                .expect("accept");
            let expected_complete = index == 0;
            assert_eq!(
                outcome,
                ChunkOutcome::Verified {
                    newly_set: true,
                    complete: expected_complete
                }
            );
        }

        let output = leecher.finalize(&manifest.file_id).await.expect("finalize");
        let result = tokio::fs::read(&output).await.expect("read output");
        assert_eq!(result, bytes);
        // Downloader now serves the file itself.
        assert!(leecher.is_shared(&manifest.file_id));
        let served = leecher
            .read_chunk(&manifest.file_id, 0)
            .await
            .expect("read")
            .expect("chunk");
        assert_eq!(&served, &bytes[..TEST_CHUNK as usize]);
    }

    #[tokio::test]
    async fn corrupted_chunk_is_rejected_and_recoverable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, mut leecher) = engines(dir.path());
        let bytes = vec![0xCDu8; 40];
        let manifest = seed_file(&mut seeder, dir.path(), "src.bin", &bytes).await;

        leecher
            .begin_download(manifest.clone())
            .await
            .expect("begin");

        let mut chunk0 = seeder
            .read_chunk(&manifest.file_id, 0)
            .await
            .expect("read")
            .expect("chunk");
        chunk0[0] ^= 0xFF;
        assert_eq!(
            leecher
                .accept_chunk(&manifest.file_id, 0, &chunk0)
                .await
                .expect("accept"),
            ChunkOutcome::HashMismatch
        );
        assert_eq!(
            leecher.download(&manifest.file_id).expect("dl").completed_chunks(),
            0
        );

        // Clean retry plus the rest completes the file untouched by the
        // corrupted delivery.
        for index in 0..manifest.nb_chunks {
            let chunk = seeder
                .read_chunk(&manifest.file_id, index)
                .await
                .expect("read")
                .expect("chunk");
            leecher
                .accept_chunk(&manifest.file_id, index, &chunk)
                .await
                .expect("accept");
        }
        let output = leecher.finalize(&manifest.file_id).await.expect("finalize");
        assert_eq!(tokio::fs::read(&output).await.expect("read"), bytes);
    }

    #[tokio::test]
    async fn duplicate_delivery_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, mut leecher) = engines(dir.path());
        let bytes = vec![0x11u8; 35];
        let manifest = seed_file(&mut seeder, dir.path(), "src.bin", &bytes).await;

        leecher
            .begin_download(manifest.clone())
            .await
            .expect("begin");
        let chunk = seeder
            .read_chunk(&manifest.file_id, 1)
            .await
            .expect("read")
            .expect("chunk");

        assert_eq!(
            leecher
                .accept_chunk(&manifest.file_id, 1, &chunk)
                .await
                .expect("accept"),
            ChunkOutcome::Verified {
                newly_set: true,
                complete: false
            }
        );
        // Same chunk again: accepted, no state change, no completion.
        assert_eq!(
            leecher
                .accept_chunk(&manifest.file_id, 1, &chunk)
                .await
                .expect("accept"),
            ChunkOutcome::Verified {
                newly_set: false,
                complete: false
            }
        );
        assert_eq!(
            leecher.download(&manifest.file_id).expect("dl").completed_chunks(),
            1
        );
    }

    #[tokio::test]
    async fn zero_chunk_file_completes_immediately() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, mut leecher) = engines(dir.path());
        let manifest = seed_file(&mut seeder, dir.path(), "empty.bin", &[]).await;

        let complete = leecher
            .begin_download(manifest.clone())
            .await
            .expect("begin");
        assert!(complete);
        let output = leecher.finalize(&manifest.file_id).await.expect("finalize");
        assert_eq!(tokio::fs::read(&output).await.expect("read").len(), 0);
    }

    #[tokio::test]
    async fn request_window_is_bounded_and_refills() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, mut leecher) = engines(dir.path());
        let bytes = vec![0x77u8; TEST_CHUNK as usize * 6];
        let manifest = seed_file(&mut seeder, dir.path(), "src.bin", &bytes).await;

        leecher
            .begin_download(manifest.clone())
            .await
            .expect("begin");

        let first = leecher.next_requests(&manifest.file_id, 3);
        assert_eq!(first, vec![0, 1, 2]);
        // Window is saturated.
        assert!(leecher.next_requests(&manifest.file_id, 3).is_empty());

        let chunk0 = seeder
            .read_chunk(&manifest.file_id, 0)
            .await
            .expect("read")
            .expect("chunk");
        leecher
            .accept_chunk(&manifest.file_id, 0, &chunk0)
            .await
            .expect("accept");
        // One slot freed: exactly one new request.
        assert_eq!(leecher.next_requests(&manifest.file_id, 3), vec![3]);

        // A negative ack releases its slot for re-request.
        leecher.release_request(&manifest.file_id, 1);
        assert_eq!(leecher.next_requests(&manifest.file_id, 3), vec![1]);
    }

    #[tokio::test]
    async fn serving_unknown_regions_returns_none() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut seeder, _leecher) = engines(dir.path());
        let bytes = vec![5u8; 20];
        let manifest = seed_file(&mut seeder, dir.path(), "src.bin", &bytes).await;

        assert!(seeder
            .read_chunk(&FileId([0u8; 32]), 0)
            .await
            .expect("read")
            .is_none());
        assert!(seeder
            .read_chunk(&manifest.file_id, 99)
            .await
            .expect("read")
            .is_none());

        // Source file removed after sharing: negative, not an error.
        tokio::fs::remove_file(dir.path().join("src.bin"))
            .await
            .expect("remove");
        assert!(seeder
            .read_chunk(&manifest.file_id, 0)
            .await
            .expect("read")
            .is_none());
    }

    #[tokio::test]
    async fn content_index_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let manifest = {
            let mut engine =
                TransferEngine::open(dir.path(), &dir.path().join("dl"), 7777).expect("open");
            seed_file(&mut engine, dir.path(), "kept.bin", &[1, 2, 3, 4]).await
        };
        let engine = TransferEngine::open(dir.path(), &dir.path().join("dl"), 7777).expect("reopen");
        assert!(engine.is_shared(&manifest.file_id));
        assert_eq!(
            engine
                .shared_manifest(&manifest.file_id)
                .expect("manifest")
                .size,
            4
        );
    }

    #[test]
    fn filenames_are_sanitized() {
        assert_eq!(sanitize_filename("report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename(".."), "download.bin");
        assert_eq!(sanitize_filename(""), "download.bin");
    }
}
