// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Length-prefixed framing for the encrypted stream.
//!
//! Every post-handshake unit on the wire is a 4-byte big-endian length
//! prefix followed by that many ciphertext bytes.  The deframer greedily
//! extracts complete frames from an accumulating buffer, retaining any
//! partial trailing bytes for the next arrival.

use crate::error::ChannelError;

/// Upper bound on a single frame.  Large enough for a 512 KiB chunk plus
/// envelope and AEAD overhead.
pub const MAX_FRAME_BYTES: usize = 2 * 1024 * 1024;

const LEN_PREFIX: usize = 4;

/// Prepend the 4-byte big-endian length prefix.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, ChannelError> {
    if payload.len() > MAX_FRAME_BYTES {
        return Err(ChannelError::FrameTooLarge(payload.len()));
    }
    let mut frame = Vec::with_capacity(LEN_PREFIX + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Accumulating frame extractor.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the buffer with bytes that arrived coalesced with the
    /// handshake tail.
    pub fn with_leftover(leftover: Vec<u8>) -> Self {
        Self { buf: leftover }
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Extract the next complete frame, if one has fully arrived.
    ///
    /// An advertised length above [`MAX_FRAME_BYTES`] is a
    /// protocol-structural error and the connection must be closed.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, ChannelError> {
        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let mut len_bytes = [0u8; LEN_PREFIX];
        len_bytes.copy_from_slice(&self.buf[..LEN_PREFIX]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(ChannelError::FrameTooLarge(len));
        }
        if self.buf.len() < LEN_PREFIX + len {
            return Ok(None);
        }
        let frame = self.buf[LEN_PREFIX..LEN_PREFIX + len].to_vec();
        self.buf.drain(..LEN_PREFIX + len);
        Ok(Some(frame))
    }

    /// Bytes currently buffered (partial frame tail).
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}
