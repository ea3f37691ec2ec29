// Copyright (c) 2025-2026 Archipel Contributors
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Best-effort provider directory: file id → set of known holder ids.
//!
//! Append-only, merged from PROVIDE and FOUND messages.  Lookups are
//! single-hop; there is no global consistency.

use std::collections::{HashMap, HashSet};

use crate::ids::{FileId, NodeId};

#[derive(Debug, Default)]
pub struct ProviderDirectory {
    entries: HashMap<FileId, HashSet<NodeId>>,
}

impl ProviderDirectory {
    /// Record `provider` as a holder of `file_id`.  Returns whether the
    /// binding was new.
    pub fn add(&mut self, file_id: FileId, provider: NodeId) -> bool {
        self.entries.entry(file_id).or_default().insert(provider)
    }

    pub fn providers(&self, file_id: &FileId) -> Vec<NodeId> {
        self.entries
            .get(file_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn known_files(&self) -> usize {
        self.entries.len()
    }
}
