// Copyright (c) 2024-2026 Vanyo Vanev / Tech Art Ltd
// SPDX-License-Identifier: MPL-2.0
//
// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//! Datagram-side fetch machinery: the dispatch seam to the overlay, and
//! the windowed block receiver that turns out-of-order arrivals into
//! in-order file appends.

use std::time::Duration;

use crate::wire::{OverlayFrame, WINDOW_BLOCKS};

/// Re-request cadence while pulling payload blocks: roughly the time to
/// broadcast 16 KB at the 1 Mbit mesh base rate.
pub const PAYLOAD_RETRANSMIT: Duration = Duration::from_millis(133);
pub const MANIFEST_RETRANSMIT: Duration = Duration::from_millis(100);

/// Give up when nothing has arrived for this long.
pub const PAYLOAD_IDLE_TIMEOUT: Duration = Duration::from_millis(5000);
pub const MANIFEST_IDLE_TIMEOUT: Duration = Duration::from_millis(2000);

/// Outgoing side of the datagram transport.  Routing, framing, and
/// neighbour tables all live behind this seam; the engine only emits
/// request frames and consumes blocks via `received_content`.
pub trait OverlayTransport: Send + Sync {
    fn dispatch(&self, frame: OverlayFrame) -> anyhow::Result<()>;
}

/// Whether an incoming block is the end of the payload (`'T'` on the
/// wire) or has more after it (`'B'`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Body,
    Tail,
}

/// What an arrival produced: bytes that are now contiguous with the file
/// (append at the current offset), and the declared end of file when the
/// arrival carried the tail.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WindowOutcome {
    pub append: Vec<u8>,
    pub tail_len: Option<u64>,
}

/// Receive window over the 32 blocks following the current file offset.
/// Arrivals at exactly the file offset pass straight through; arrivals
/// further ahead are stashed per block and drained once the gap before
/// them fills.  Anything misaligned, behind the file offset, or beyond the
/// window is dropped; the periodic re-request solicits it again.
#[derive(Debug)]
pub struct BlockWindow {
    block_len: usize,
    stashed: Vec<Option<Vec<u8>>>,
}

impl BlockWindow {
    pub fn new(block_len: usize) -> Self {
        Self {
            block_len,
            stashed: vec![None; WINDOW_BLOCKS],
        }
    }

    /// Bitmap for the next block request: bit `i` set means the block at
    /// `file_offset + i * block_len` is already held.
    pub fn bitmap(&self) -> u32 {
        self.stashed
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_some())
            .fold(0u32, |bits, (idx, _)| bits | (1 << idx))
    }

    pub fn accept(
        &mut self,
        written: u64,
        offset: u64,
        bytes: &[u8],
        kind: BlockKind,
    ) -> WindowOutcome {
        let tail_len = (kind == BlockKind::Tail).then(|| offset + bytes.len() as u64);
        if bytes.is_empty() || offset < written {
            return WindowOutcome::default();
        }

        if offset == written {
            let mut append = bytes.to_vec();
            if bytes.len() % self.block_len == 0 {
                self.shift(bytes.len() / self.block_len);
            } else {
                // Stashed blocks no longer line up with the new offset;
                // the next request re-solicits them.
                self.stashed.iter_mut().for_each(|slot| *slot = None);
            }
            while let Some(block) = self.stashed[0].take() {
                let partial = block.len() < self.block_len;
                append.extend_from_slice(&block);
                self.shift(1);
                if partial {
                    // Partial block is the tail; nothing can follow it.
                    break;
                }
            }
            return WindowOutcome { append, tail_len };
        }

        let delta = offset - written;
        if delta % self.block_len as u64 != 0 {
            return WindowOutcome::default();
        }
        let mut idx = (delta / self.block_len as u64) as usize;
        let mut accepted = false;
        let chunks: Vec<&[u8]> = bytes.chunks(self.block_len).collect();
        let last_chunk = chunks.len() - 1;
        for (chunk_no, chunk) in chunks.into_iter().enumerate() {
            if idx >= WINDOW_BLOCKS {
                break;
            }
            if chunk.len() < self.block_len && !(kind == BlockKind::Tail && chunk_no == last_chunk)
            {
                break;
            }
            self.stashed[idx] = Some(chunk.to_vec());
            accepted = true;
            idx += 1;
        }
        WindowOutcome {
            append: Vec::new(),
            tail_len: if accepted { tail_len } else { None },
        }
    }

    fn shift(&mut self, blocks: usize) {
        for _ in 0..blocks.min(WINDOW_BLOCKS) {
            self.stashed.remove(0);
            self.stashed.push(None);
        }
    }
}
