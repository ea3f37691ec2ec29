// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Lifecycle events consumed by the operator layer.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::ids::{FileId, NodeId};
use crate::manifest::FileManifest;

#[derive(Debug, Clone)]
pub enum NodeEvent {
    PeerNew {
        id: NodeId,
        ip: IpAddr,
        tcp_port: u16,
    },
    PeerLost {
        id: NodeId,
    },
    Message {
        from: NodeId,
        content: String,
        is_relayed: bool,
    },
    FileShared {
        manifest: FileManifest,
    },
    TransferProgress {
        file_id: FileId,
        completed: u32,
        total: u32,
    },
    TransferComplete {
        file_id: FileId,
        path: PathBuf,
    },
    DhtUpdate {
        file_id: FileId,
        provider: NodeId,
    },
}
