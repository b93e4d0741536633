// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Memory Frames
//!
//! A [`Frame`] is the global descriptor of one block of main memory. There
//! is exactly one frame per block that any transaction has ever touched;
//! frames are created on first lookup and live until the frame map is torn
//! down. The frame carries the block's reader/writer lock and an owner
//! hint for diagnostics. The block's bytes themselves live in place, in
//! ordinary process memory.

use std::sync::atomic::{AtomicUsize, Ordering};

use stronghold_tx::{
    error::Result,
    rwlock::RwLock,
    rwstate::RwState,
};

use crate::block::{block_address, BLOCK_BITS};

/// Global per-block descriptor: packed block index, owner hint and lock.
#[derive(Debug)]
pub struct Frame {
    /// Block index in the high bits; the low bits are reserved for flags.
    flags: usize,

    /// Non-owning hint at the last transaction that wrote the block. Not
    /// used for mutual exclusion.
    owner: AtomicUsize,

    /// The block's two-phase lock.
    lock: RwLock,
}

impl Frame {
    pub fn new(block_index: usize) -> Self {
        Self {
            flags: block_index << BLOCK_BITS,
            owner: AtomicUsize::new(0),
            lock: RwLock::new(),
        }
    }

    pub fn block_index(&self) -> usize {
        self.flags >> BLOCK_BITS
    }

    /// The first address of the frame's block.
    pub fn address(&self) -> usize {
        block_address(self.block_index())
    }

    /// The block's bytes in live process memory.
    pub fn buffer(&self) -> *mut u8 {
        self.address() as *mut u8
    }

    pub fn lock(&self) -> &RwLock {
        &self.lock
    }

    /// Acquires the reader role on the frame's lock for the given
    /// transaction-local lock state.
    pub fn try_rdlock(&self, state: &mut RwState) -> Result<()> {
        state.try_rdlock(&self.lock)
    }

    /// Acquires the writer role, upgrading a held reader role.
    pub fn try_wrlock(&self, state: &mut RwState) -> Result<()> {
        state.try_wrlock(&self.lock)?;
        self.set_owner_hint(state as *const _ as usize);
        Ok(())
    }

    /// Releases whatever role `state` holds on the frame's lock.
    pub fn unlock(&self, state: &mut RwState) {
        if state.is_wrlocked() {
            self.set_owner_hint(0);
        }
        state.unlock(&self.lock);
    }

    fn set_owner_hint(&self, owner: usize) {
        self.owner.store(owner, Ordering::Relaxed);
    }

    pub fn owner_hint(&self) -> usize {
        self.owner.load(Ordering::Relaxed)
    }
}
