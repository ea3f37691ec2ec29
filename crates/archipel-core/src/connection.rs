// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Drives the handshake state machines over a live TCP stream.
//!
//! The transport may split or coalesce segments arbitrarily: each driver
//! reads whatever arrives and feeds it to the machine until the link is
//! established.  Bytes that arrive beyond the handshake tail are returned
//! so the frame deframer can be seeded with them.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::handshake::{
    EstablishedLink, InitiatorHandshake, InitiatorStep, ResponderHandshake, ResponderStep,
};
use crate::identity::{NodeIdentity, PinBook};

const READ_BUF: usize = 4096;

/// Run the initiator side of the handshake on a freshly connected stream.
pub async fn initiate_on(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    pins: &Arc<StdMutex<PinBook>>,
) -> anyhow::Result<(EstablishedLink, Vec<u8>)> {
    let (mut machine, hello) = InitiatorHandshake::start();
    stream.write_all(&hello).await?;

    let mut buf = [0u8; READ_BUF];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed during handshake");
        }
        let step = {
            let mut pins = pins.lock().expect("pin book lock");
            machine.feed(&buf[..n], identity, &mut pins)?
        };
        match step {
            InitiatorStep::NeedMore => {}
            InitiatorStep::Established {
                auth,
                link,
                leftover,
            } => {
                stream.write_all(&auth).await?;
                debug!(peer = %link.peer_id.short(), "secure tunnel established (initiator)");
                return Ok((link, leftover));
            }
        }
    }
}

/// Run the responder side of the handshake on an accepted stream.
pub async fn respond_on(
    stream: &mut TcpStream,
    identity: &NodeIdentity,
    pins: &Arc<StdMutex<PinBook>>,
) -> anyhow::Result<(EstablishedLink, Vec<u8>)> {
    let mut machine = ResponderHandshake::new();
    let mut buf = [0u8; READ_BUF];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            anyhow::bail!("connection closed during handshake");
        }
        let mut input: &[u8] = &buf[..n];
        // One read may carry HELLO and (after the reply round-trip)
        // subsequent calls carry AUTH; feed until this input is consumed.
        loop {
            let step = {
                let mut pins = pins.lock().expect("pin book lock");
                machine.feed(input, identity, &mut pins)?
            };
            input = &[];
            match step {
                ResponderStep::NeedMore => break,
                ResponderStep::Reply(reply) => {
                    stream.write_all(&reply).await?;
                    // Buffered bytes may already contain AUTH; loop once
                    // more on empty input before reading again.
                }
                ResponderStep::Established { link, leftover } => {
                    debug!(peer = %link.peer_id.short(), "secure tunnel established (responder)");
                    return Ok((link, leftover));
                }
            }
        }
    }
}
