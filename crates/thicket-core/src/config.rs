// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
use std::path::PathBuf;
use std::time::Duration;

/// One size tier of the fetch queue set.  A tier accepts payloads strictly
/// smaller than `size_limit`; the last tier is unbounded (`None`).
#[derive(Debug, Clone, Copy)]
pub struct TierConfig {
    pub size_limit: Option<u64>,
    /// How many candidates the tier may hold while its slot is busy.
    pub queue_depth: usize,
}

#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Must be ordered by ascending size limit, unbounded tier last.
    pub tiers: Vec<TierConfig>,
    /// Scratch files for in-flight payloads live here.
    pub import_dir: PathBuf,
    /// Stream transport gives up after this long without observing a byte.
    pub stream_idle_timeout: Duration,
    /// Delay between enqueueing candidates and activating fetches, so a
    /// whole packet's worth of advertisements can be prioritised first.
    pub fetch_delay: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            tiers: vec![
                TierConfig {
                    size_limit: Some(10_000),
                    queue_depth: 5,
                },
                TierConfig {
                    size_limit: Some(100_000),
                    queue_depth: 4,
                },
                TierConfig {
                    size_limit: Some(1_000_000),
                    queue_depth: 3,
                },
                TierConfig {
                    size_limit: Some(10_000_000),
                    queue_depth: 2,
                },
                TierConfig {
                    size_limit: None,
                    queue_depth: 1,
                },
            ],
            import_dir: PathBuf::from("thicket-import"),
            stream_idle_timeout: Duration::from_millis(5000),
            fetch_delay: Duration::from_millis(500),
        }
    }
}
