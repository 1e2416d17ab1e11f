// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Set-associative cache of "known bundle id → highest stored version".
//!
//! The bundle database stays authoritative; the table only exists to spare
//! a SQL round trip for bundles that keep getting re-advertised.  On a hit
//! with a stale stored version the entry is refreshed from the database; on
//! a miss the database answer is cached whenever it already holds the same
//! or a newer version.

use rand::Rng;

use crate::ids::BundleId;
use crate::store::BundleStore;

const BIN_COUNT: usize = 128;
const WAYS: usize = 16;
const PREFIX_LEN: usize = 24;

#[derive(Debug, Clone, Copy)]
struct Entry {
    prefix: [u8; PREFIX_LEN],
    version: u64,
}

/// What the engine should do with a freshly advertised (bid, version).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionLookup {
    /// Not stored, or stored strictly older: worth fetching.
    New,
    HaveSameOrNewer,
    HaveNewer,
}

pub struct VersionCache {
    bins: Vec<[Option<Entry>; WAYS]>,
}

impl Default for VersionCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VersionCache {
    pub fn new() -> Self {
        Self {
            bins: vec![[None; WAYS]; BIN_COUNT],
        }
    }

    fn bin_of(bid: &BundleId) -> usize {
        (bid.0[0] >> 1) as usize
    }

    fn prefix_of(bid: &BundleId) -> [u8; PREFIX_LEN] {
        let mut prefix = [0u8; PREFIX_LEN];
        prefix.copy_from_slice(&bid.0[..PREFIX_LEN]);
        prefix
    }

    /// Decide whether a fetch of `(bid, version)` is worth pursuing.
    pub fn lookup(
        &mut self,
        store: &dyn BundleStore,
        bid: &BundleId,
        version: u64,
    ) -> anyhow::Result<VersionLookup> {
        let bin = Self::bin_of(bid);
        let prefix = Self::prefix_of(bid);

        if let Some(way) = self.bins[bin]
            .iter()
            .position(|e| e.is_some_and(|e| e.prefix == prefix))
        {
            let cached = self.bins[bin][way].expect("entry present");
            if version > cached.version {
                // Possibly stale: re-check against the database before
                // letting a fetch through.
                match store.stored_version(bid)? {
                    Some(db_version) => {
                        self.bins[bin][way] = Some(Entry {
                            prefix,
                            version: db_version,
                        });
                    }
                    None => {
                        // The entry outlived the stored bundle.
                        self.bins[bin][way] = None;
                        return Ok(VersionLookup::New);
                    }
                }
            }
            let entry = self.bins[bin][way].expect("entry present");
            return Ok(compare(entry.version, version));
        }

        match store.stored_version(bid)? {
            Some(db_version) if db_version >= version => {
                self.insert(bin, prefix, db_version);
                Ok(compare(db_version, version))
            }
            _ => Ok(VersionLookup::New),
        }
    }

    /// Record a bundle the store now holds, so later advertisements of the
    /// same or older versions are rejected without a query.
    pub fn store(&mut self, bid: &BundleId, version: u64) {
        let bin = Self::bin_of(bid);
        let prefix = Self::prefix_of(bid);
        if let Some(way) = self.bins[bin]
            .iter()
            .position(|e| e.is_some_and(|e| e.prefix == prefix))
        {
            self.bins[bin][way] = Some(Entry { prefix, version });
        } else {
            self.insert(bin, prefix, version);
        }
    }

    fn insert(&mut self, bin: usize, prefix: [u8; PREFIX_LEN], version: u64) {
        // Prefer an empty way; otherwise evict a random one.
        let way = self.bins[bin]
            .iter()
            .position(|e| e.is_none())
            .unwrap_or_else(|| rand::thread_rng().gen_range(0..WAYS));
        self.bins[bin][way] = Some(Entry { prefix, version });
    }
}

fn compare(stored: u64, candidate: u64) -> VersionLookup {
    if stored > candidate {
        VersionLookup::HaveNewer
    } else if stored == candidate {
        VersionLookup::HaveSameOrNewer
    } else {
        VersionLookup::New
    }
}
