// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Frame Map
//!
//! The frame map resolves an address to the [`Frame`] of its block. Frames
//! are kept in tables of 1024 hung off a lock-free
//! [`SharedTreemap`](stronghold_tx::treemap::SharedTreemap); a table is
//! allocated the first time any of its frames is looked up. The map only
//! grows until teardown.

use log::*;
use stronghold_tx::{error::Result, treemap::SharedTreemap};

use crate::{
    block::BLOCK_BITS,
    frame::Frame,
};

/// log2 of the number of frames per table.
pub const TBL_BITS: u32 = 10;

/// Number of frames per table.
pub const TBL_SIZE: usize = 1 << TBL_BITS;

const TBL_MASK: usize = TBL_SIZE - 1;

/// A table of frames for `TBL_SIZE` consecutive blocks.
struct FrameTbl {
    frames: Box<[Frame]>,
}

impl FrameTbl {
    fn boxed(first_block_index: usize) -> Box<Self> {
        let frames: Vec<Frame> = (0..TBL_SIZE)
            .map(|i| Frame::new(first_block_index + i))
            .collect();

        Box::new(Self {
            frames: frames.into_boxed_slice(),
        })
    }

    fn create(key: u64) -> Result<usize> {
        trace!("TM: NEW FRAME TABLE FOR KEY {:#x}", key);

        let tbl = Self::boxed((key as usize) << TBL_BITS);
        Ok(Box::into_raw(tbl) as usize)
    }

    fn destroy(value: usize) {
        unsafe { drop(Box::from_raw(value as *mut FrameTbl)) };
    }
}

/// Address → frame resolver over the whole address space.
pub struct FrameMap {
    map: SharedTreemap,
}

impl FrameMap {
    pub fn new() -> Self {
        // the low address bits index into the block and its frame table;
        // the treemap handles the remaining high bits
        let key_bits = usize::BITS - TBL_BITS - BLOCK_BITS;

        Self {
            map: SharedTreemap::new(key_bits, 10),
        }
    }

    /// The frame of the block containing `addr`, created on first lookup.
    pub fn lookup(&self, addr: usize) -> Result<&Frame> {
        let key = (addr >> (TBL_BITS + BLOCK_BITS)) as u64;

        let value = self
            .map
            .find_value(key, FrameTbl::create, FrameTbl::destroy)?;
        let tbl = unsafe { &*(value as *const FrameTbl) };

        Ok(&tbl.frames[(addr >> BLOCK_BITS) & TBL_MASK])
    }

    /// Frees every frame table. Requires that no frame is locked or
    /// referenced anymore.
    pub fn clear(&mut self) {
        self.map.clear(FrameTbl::destroy);
    }
}

impl Default for FrameMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::{FrameMap, TBL_SIZE};
    use crate::block::{block_index_at, BLOCK_SIZE};

    #[test]
    fn test_lookup_is_stable() {
        let mut map = FrameMap::new();

        let addr = 0x7f00_1234_5678usize;
        let first = map.lookup(addr).expect("Failed to look up frame") as *const _;
        let second = map.lookup(addr).expect("Failed to look up frame") as *const _;

        assert_eq!(first, second);
        map.clear();
    }

    #[test]
    fn test_frames_carry_their_block_index() {
        let mut map = FrameMap::new();

        for addr in [0usize, 64, 4096, TBL_SIZE * BLOCK_SIZE * 3 + 8] {
            let frame = map.lookup(addr).expect("Failed to look up frame");
            assert_eq!(frame.block_index(), block_index_at(addr));
            assert_eq!(frame.address(), addr & !(BLOCK_SIZE - 1));
        }

        map.clear();
    }

    #[test]
    fn test_adjacent_blocks_share_a_table() {
        let mut map = FrameMap::new();

        let a = map.lookup(0x1000).expect("Failed to look up frame");
        let b = map.lookup(0x1008).expect("Failed to look up frame");

        assert_eq!(a.block_index() + 1, b.block_index());
        map.clear();
    }
}
