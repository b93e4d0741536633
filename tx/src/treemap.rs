// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Shared Treemap
//!
//! [`SharedTreemap`] maps keys of up to 64 bits to non-zero `usize` values,
//! typically pointers. Concurrent lookup by multiple threads is supported
//! without locks: every slot of the radix tree is a single atomic word that
//! is either null, a directory pointer, or (at the value level) the value
//! itself. Missing directories and values are created lazily during lookup
//! and published with a compare-and-exchange; a thread that loses the race
//! releases its own copy through the caller-supplied destroyer and adopts
//! the winner.
//!
//! The tree only ever grows. Once a key's value has been established, every
//! later lookup observes that same value.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::Result;

/// One directory level. Slots hold child directories, or values at the
/// lowest level; which of the two is known from the slot's depth alone.
struct Dir {
    slots: Box<[AtomicUsize]>,
}

impl Dir {
    fn boxed(len: usize) -> Box<Self> {
        let mut slots = Vec::with_capacity(len);
        slots.resize_with(len, || AtomicUsize::new(0));

        Box::new(Self {
            slots: slots.into_boxed_slice(),
        })
    }
}

/// A lock-free radix tree from ≤64-bit keys to non-zero `usize` values.
///
/// # Example
/// ```
/// use stronghold_tx::treemap::SharedTreemap;
///
/// let map = SharedTreemap::new(16, 8);
/// let value = map
///     .find_value(0x1234, |_| Ok(Box::into_raw(Box::new(7u32)) as usize), |v| unsafe {
///         drop(Box::from_raw(v as *mut u32));
///     })
///     .unwrap();
/// assert_eq!(unsafe { *(value as *const u32) }, 7);
/// # let mut map = map;
/// # map.clear(|v| unsafe { drop(Box::from_raw(v as *mut u32)) });
/// ```
pub struct SharedTreemap {
    /// Either null or the top-level directory (the value itself when the
    /// key width is zero).
    root: AtomicUsize,

    /// Number of directory levels; fixed at creation.
    levels: u32,

    /// Key bits consumed per directory level.
    level_bits: u32,
}

impl SharedTreemap {
    /// Creates a treemap for keys up to `key_bits` wide, consuming
    /// `level_bits` key bits per directory level.
    pub fn new(key_bits: u32, level_bits: u32) -> Self {
        assert!(key_bits <= 64);
        assert!(level_bits >= 1 && level_bits < usize::BITS);

        Self {
            root: AtomicUsize::new(0),
            levels: key_bits.div_ceil(level_bits),
            level_bits,
        }
    }

    fn level_len(&self) -> usize {
        1 << self.level_bits
    }

    fn level_mask(&self) -> usize {
        self.level_len() - 1
    }

    /// Loads the directory in `slot`, creating and publishing it if the
    /// slot is still null. Exactly one creator wins; losers free their
    /// local copy and adopt the winner.
    fn retrieve_dir(&self, slot: &AtomicUsize) -> &Dir {
        let mut entry = slot.load(Ordering::Acquire);

        if entry == 0 {
            let dir = Box::into_raw(Dir::boxed(self.level_len()));

            match slot.compare_exchange(0, dir as usize, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => entry = dir as usize,
                Err(winner) => {
                    unsafe { drop(Box::from_raw(dir)) };
                    entry = winner;
                }
            }
        }

        unsafe { &*(entry as *const Dir) }
    }

    /// Walks to the value slot for `key`, creating directories on demand.
    fn value_slot(&self, key: u64) -> &AtomicUsize {
        debug_assert!(
            self.levels == 0
                || (self.levels * self.level_bits >= 64)
                || (key >> (self.levels * self.level_bits)) == 0,
            "key exceeds the configured width"
        );

        let mut slot = &self.root;

        for level in 0..self.levels {
            let dir = self.retrieve_dir(slot);
            let shift = (self.levels - 1 - level) * self.level_bits;
            let index = (key >> shift) as usize & self.level_mask();
            slot = &dir.slots[index];
        }

        slot
    }

    /// Retrieves the value for `key`, creating it through `create` if the
    /// key has none yet.
    ///
    /// Concurrent lookups of the same missing key may race to create the
    /// value; exactly one wins the slot, and `destroy` releases the losing
    /// copies. Created values must be non-zero.
    pub fn find_value(
        &self,
        key: u64,
        create: impl FnOnce(u64) -> Result<usize>,
        destroy: impl FnOnce(usize),
    ) -> Result<usize> {
        let slot = self.value_slot(key);

        let entry = slot.load(Ordering::Acquire);
        if entry != 0 {
            return Ok(entry);
        }

        let value = create(key)?;
        debug_assert_ne!(value, 0, "treemap values must be non-zero");

        match slot.compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => Ok(value),
            Err(winner) => {
                destroy(value);
                Ok(winner)
            }
        }
    }

    /// Returns the value for `key` without creating one.
    pub fn lookup(&self, key: u64) -> Option<usize> {
        let mut slot = &self.root;

        for level in 0..self.levels {
            let entry = slot.load(Ordering::Acquire);
            if entry == 0 {
                return None;
            }

            let dir = unsafe { &*(entry as *const Dir) };
            let shift = (self.levels - 1 - level) * self.level_bits;
            let index = (key >> shift) as usize & self.level_mask();
            slot = &dir.slots[index];
        }

        match slot.load(Ordering::Acquire) {
            0 => None,
            entry => Some(entry),
        }
    }

    /// Destroys all values and frees all directories.
    ///
    /// Concurrent lookups must have ceased; exclusive access is enforced
    /// through the `&mut` receiver.
    pub fn clear(&mut self, mut destroy: impl FnMut(usize)) {
        let root = *self.root.get_mut();
        if root == 0 {
            return;
        }

        if self.levels == 0 {
            destroy(root);
        } else {
            clear_dir(root as *mut Dir, self.levels, &mut destroy);
        }

        *self.root.get_mut() = 0;
    }
}

/// Destroys the values below `dir` depth-first and frees the directory
/// post-order.
fn clear_dir(dir: *mut Dir, depth: u32, destroy: &mut impl FnMut(usize)) {
    let dir = unsafe { Box::from_raw(dir) };

    for slot in dir.slots.iter() {
        let entry = slot.load(Ordering::Acquire);
        if entry == 0 {
            continue;
        }

        if depth > 1 {
            clear_dir(entry as *mut Dir, depth - 1, destroy);
        } else {
            destroy(entry);
        }
    }
}

impl Drop for SharedTreemap {
    fn drop(&mut self) {
        // values are owned by the caller and must be released through
        // clear(); a plain drop only reclaims the directories
        self.clear(|_| {});
    }
}
