// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! The process-wide memory resource of the STM module. [`Vmem`] owns the
//! frame map and is hosted behind the shared-state lifecycle: the first
//! thread that uses transactional memory initializes it, the last one to
//! release its module tears it down.

use stronghold_tx::{
    error::Result,
    shared::{SharedInit, SharedState},
};

use crate::{block::block_address, frame::Frame, framemap::FrameMap};

/// Main memory as the STM module maintains it.
pub struct Vmem {
    frame_map: FrameMap,
}

impl Vmem {
    /// The frame of the block with the given index, created on demand.
    pub fn acquire_frame_by_block(&self, block_index: usize) -> Result<&Frame> {
        self.acquire_frame_by_address(block_address(block_index))
    }

    /// The frame of the block containing `addr`, created on demand.
    pub fn acquire_frame_by_address(&self, addr: usize) -> Result<&Frame> {
        self.frame_map.lookup(addr)
    }
}

impl SharedInit for Vmem {
    fn init() -> Result<Self> {
        Ok(Self {
            frame_map: FrameMap::new(),
        })
    }

    fn uninit(&mut self) {
        self.frame_map.clear();
    }
}

/// The singleton instance; reference-counted by the per-thread modules.
pub static VMEM: SharedState<Vmem> = SharedState::new();
