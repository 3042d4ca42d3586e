// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Fixed-block memory for control transfer data stages.
//!
//! A data stage needs somewhere to keep its bytes for as long as the transfer
//! lives, and nothing else. Blocks are handed out contiguously, first fit,
//! from one static arena; there's no heap.
//!
//! Allocations come back as a [`DataBuffer`], which is deliberately not
//! `Clone` or `Copy`: [`BufferPool::release`] consumes it, so a buffer can't
//! be given back twice.

use log::warn;

use crate::config::{POOL_BLOCKS, POOL_BLOCK_SIZE};

/// Handle to an allocation in a [`BufferPool`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a DataBuffer that's dropped instead of released leaks pool blocks"]
pub struct DataBuffer {
    first: u8,
    blocks: u8,
    len: u16,
}

impl DataBuffer {
    pub fn len(&self) -> usize {
        usize::from(self.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn range(&self) -> core::ops::Range<usize> {
        let start = usize::from(self.first) * POOL_BLOCK_SIZE;
        start..start + self.len()
    }
}

#[derive(Debug)]
pub struct BufferPool {
    memory: [u8; POOL_BLOCKS * POOL_BLOCK_SIZE],
    used: [bool; POOL_BLOCKS],
    outstanding: usize,
}

impl BufferPool {
    pub const fn new() -> Self {
        Self {
            memory: [0; POOL_BLOCKS * POOL_BLOCK_SIZE],
            used: [false; POOL_BLOCKS],
            outstanding: 0,
        }
    }

    /// Largest allocation that can ever succeed.
    pub const fn capacity() -> usize {
        POOL_BLOCKS * POOL_BLOCK_SIZE
    }

    /// Allocates `len` zeroed bytes. `None` if no run of free blocks is long
    /// enough. A zero-length allocation still takes one block, so that every
    /// live handle owns something.
    pub fn alloc(&mut self, len: usize) -> Option<DataBuffer> {
        let want = len.div_ceil(POOL_BLOCK_SIZE).max(1);
        if want > POOL_BLOCKS {
            return None;
        }
        let first = (0..=POOL_BLOCKS - want)
            .find(|&i| self.used[i..i + want].iter().all(|u| !u))?;

        self.used[first..first + want].fill(true);
        self.outstanding += 1;
        let buf = DataBuffer {
            first: first as u8,
            blocks: want as u8,
            len: len as u16,
        };
        self.memory[buf.range()].fill(0);
        Some(buf)
    }

    pub fn release(&mut self, buf: DataBuffer) {
        let first = usize::from(buf.first);
        let blocks = &mut self.used[first..first + usize::from(buf.blocks)];
        if blocks.iter().any(|u| !u) {
            warn!("pool release of block {first} that wasn't allocated");
        }
        blocks.fill(false);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub fn bytes(&self, buf: &DataBuffer) -> &[u8] {
        &self.memory[buf.range()]
    }

    pub fn bytes_mut(&mut self, buf: &DataBuffer) -> &mut [u8] {
        &mut self.memory[buf.range()]
    }

    pub fn free_blocks(&self) -> usize {
        self.used.iter().filter(|u| !**u).count()
    }

    /// Number of live allocations.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
