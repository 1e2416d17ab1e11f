// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Size-tiered candidate queues.  Each tier holds bundles whose payload is
//! smaller than its bound, ordered by priority then arrival, packed with no
//! holes.  Activation and slot management live in `fetch.rs`; this module
//! is the container logic only.

use crate::config::TierConfig;
use crate::manifest::BundleManifest;
use crate::peer::FetchPeer;

/// Normal advertisement priority.  Smaller is more important.
pub const DEFAULT_PRIORITY: i32 = 100;

/// A queued fetch that has not been assigned a slot yet.  Owns its
/// manifest; dropping the candidate frees it.
#[derive(Debug)]
pub struct FetchCandidate {
    pub manifest: BundleManifest,
    pub peer: FetchPeer,
    pub priority: i32,
}

#[derive(Debug)]
pub struct FetchTier {
    pub size_limit: Option<u64>,
    depth: usize,
    candidates: Vec<FetchCandidate>,
}

impl FetchTier {
    pub fn new(config: TierConfig) -> Self {
        Self {
            size_limit: config.size_limit,
            depth: config.queue_depth,
            candidates: Vec::with_capacity(config.queue_depth),
        }
    }

    pub fn accepts(&self, payload_length: u64) -> bool {
        match self.size_limit {
            Some(limit) => payload_length < limit,
            None => true,
        }
    }

    pub fn candidates(&self) -> &[FetchCandidate] {
        &self.candidates
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Where a candidate of the given priority would be inserted: before
    /// the first queued candidate that is strictly less important, or at
    /// the tail if there is room.  `None` means the tier is full of
    /// equal-or-higher-priority work and the candidate must be rejected.
    pub fn insertion_index(&self, priority: i32) -> Option<usize> {
        if let Some(idx) = self.candidates.iter().position(|c| c.priority > priority) {
            return Some(idx);
        }
        (self.candidates.len() < self.depth).then_some(self.candidates.len())
    }

    /// Insert at `idx`, shifting later candidates back.  If that overflows
    /// the tier the tail candidate is dropped (its manifest freed).
    pub fn insert(&mut self, idx: usize, candidate: FetchCandidate) {
        self.candidates.insert(idx, candidate);
        if self.candidates.len() > self.depth {
            let dropped = self.candidates.pop().expect("overfull tier");
            tracing::debug!(
                bid = %dropped.manifest.bid.to_hex(),
                "queue full, dropping tail candidate"
            );
        }
    }

    /// Remove and return the candidate at `idx`; later candidates close up
    /// the gap, keeping the queue packed.
    pub fn remove(&mut self, idx: usize) -> FetchCandidate {
        self.candidates.remove(idx)
    }
}

/// Index of the unique tier whose bound accepts the payload, scanning in
/// ascending-bound order.
pub fn tier_for_size(tiers: &[FetchTier], payload_length: u64) -> Option<usize> {
    tiers.iter().position(|t| t.accepts(payload_length))
}
