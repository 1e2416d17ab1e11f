// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Negative cache of manifests not worth looking at for a while: a peer
//! kept advertising something that fails verification.  Entries expire on
//! their own and are never swept.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::ids::BundleId;
use crate::peer::FetchPeer;

const BIN_COUNT: usize = 64;
const BIN_SIZE: usize = 8;

#[derive(Debug, Clone)]
struct Entry {
    bid: BundleId,
    /// Which peer kept advertising the bad manifest; kept for diagnostics.
    #[allow(dead_code)]
    peer: FetchPeer,
    expires_at: Instant,
}

pub struct IgnoreCache {
    bins: Vec<Vec<Entry>>,
}

impl Default for IgnoreCache {
    fn default() -> Self {
        Self::new()
    }
}

impl IgnoreCache {
    pub fn new() -> Self {
        Self {
            bins: vec![Vec::new(); BIN_COUNT],
        }
    }

    fn bin_of(bid: &BundleId) -> usize {
        // High 6 bits of the first id byte.
        (bid.0[0] >> 2) as usize
    }

    pub fn is_ignored(&self, bid: &BundleId) -> bool {
        self.is_ignored_at(bid, Instant::now())
    }

    pub fn is_ignored_at(&self, bid: &BundleId, now: Instant) -> bool {
        self.bins[Self::bin_of(bid)]
            .iter()
            .any(|e| e.bid == *bid && e.expires_at > now)
    }

    pub fn mark(&mut self, bid: &BundleId, peer: FetchPeer, ttl: Duration) {
        self.mark_at(bid, peer, ttl, Instant::now());
    }

    pub fn mark_at(&mut self, bid: &BundleId, peer: FetchPeer, ttl: Duration, now: Instant) {
        let bin = &mut self.bins[Self::bin_of(bid)];
        let entry = Entry {
            bid: *bid,
            peer,
            expires_at: now + ttl,
        };
        if let Some(existing) = bin.iter_mut().find(|e| e.bid == *bid) {
            *existing = entry;
        } else if bin.len() < BIN_SIZE {
            bin.push(entry);
        } else {
            let victim = rand::thread_rng().gen_range(0..BIN_SIZE);
            bin[victim] = entry;
        }
    }
}
