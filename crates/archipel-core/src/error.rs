// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use thiserror::Error;

/// Errors raised by the secure channel and its framing layer.
///
/// Handshake-phase failures are connection-fatal; `DecryptionFailed` on an
/// established session is frame-local and the connection stays up.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChannelError {
    #[error("handshake signature verification failed")]
    SignatureInvalid,

    #[error("peer key does not match pinned identity")]
    IdentityMismatch,

    #[error("decryption failed")]
    DecryptionFailed,

    #[error("encryption failed")]
    EncryptionFailed,

    #[error("handshake timestamp outside allowed clock skew")]
    ClockSkew,

    #[error("frame exceeds max size: {0} bytes")]
    FrameTooLarge(usize),

    #[error("malformed packet: {0}")]
    Malformed(&'static str),
}
