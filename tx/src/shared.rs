// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Shared-State Lifecycle
//!
//! [`SharedState`] hosts a process-wide singleton without life-before-main
//! constructors: the payload is initialized when the reference count goes
//! from zero to one and finalized when it returns to zero. Acquiring and
//! releasing references is thread-safe; a reference that races with a
//! running initializer or finalizer spins until the transition completes.
//!
//! ```
//! use stronghold_tx::shared::{SharedInit, SharedState};
//!
//! struct Registry {
//!     entries: Vec<u32>,
//! }
//!
//! impl SharedInit for Registry {
//!     fn init() -> stronghold_tx::Result<Self> {
//!         Ok(Registry { entries: Vec::new() })
//!     }
//! }
//!
//! static REGISTRY: SharedState<Registry> = SharedState::new();
//!
//! let registry = REGISTRY.acquire().expect("Failed to initialize");
//! assert!(registry.entries.is_empty());
//! REGISTRY.release();
//! ```

use std::{cell::UnsafeCell, sync::atomic::{AtomicU16, Ordering}};

use crate::error::Result;

/// Counter value marking a running initializer or finalizer.
const BUSY: u16 = u16::MAX;

/// Initializer/finalizer pair of a shared state's payload.
pub trait SharedInit: Sized {
    /// Builds the payload on the 0→1 reference transition.
    fn init() -> Result<Self>;

    /// Tears the payload down on the 1→0 transition, before it is dropped.
    fn uninit(&mut self) {}
}

/// A reference-counted process-wide singleton of `T`.
pub struct SharedState<T> {
    count: AtomicU16,
    state: UnsafeCell<Option<T>>,
}

// the busy-sentinel protocol serializes every access to `state`
unsafe impl<T: Send + Sync> Sync for SharedState<T> {}

impl<T: SharedInit> SharedState<T> {
    pub const fn new() -> Self {
        Self {
            count: AtomicU16::new(0),
            state: UnsafeCell::new(None),
        }
    }

    /// Acquires a reference, initializing the payload if this is the first
    /// one. The reference stays valid until the matching [`release`]
    /// returns the count to zero.
    ///
    /// [`release`]: Self::release
    pub fn acquire(&self) -> Result<&T> {
        loop {
            match self.count.load(Ordering::Acquire) {
                // init or fini in progress on another thread
                BUSY => std::hint::spin_loop(),

                0 => {
                    if self
                        .count
                        .compare_exchange(0, BUSY, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }

                    // we own the 0→1 transition
                    match T::init() {
                        Ok(value) => {
                            let state = unsafe { &mut *self.state.get() };
                            *state = Some(value);
                            self.count.store(1, Ordering::Release);

                            return Ok(state.as_ref().expect("state was just initialized"));
                        }
                        Err(err) => {
                            self.count.store(0, Ordering::Release);
                            return Err(err);
                        }
                    }
                }

                n => {
                    debug_assert!(n < BUSY - 1, "shared-state reference overflow");

                    if self
                        .count
                        .compare_exchange(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        let state = unsafe { &*self.state.get() };
                        return Ok(state.as_ref().expect("positive count without state"));
                    }
                }
            }
        }
    }

    /// Releases a reference, finalizing the payload if this was the last
    /// one.
    pub fn release(&self) {
        loop {
            match self.count.load(Ordering::Acquire) {
                BUSY => std::hint::spin_loop(),

                0 => {
                    debug_assert!(false, "shared-state reference underflow");
                    return;
                }

                1 => {
                    if self
                        .count
                        .compare_exchange(1, BUSY, Ordering::AcqRel, Ordering::Acquire)
                        .is_err()
                    {
                        continue;
                    }

                    // we own the 1→0 transition
                    let state = unsafe { &mut *self.state.get() };
                    if let Some(mut value) = state.take() {
                        value.uninit();
                    }
                    self.count.store(0, Ordering::Release);

                    return;
                }

                n => {
                    if self
                        .count
                        .compare_exchange(n, n - 1, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
            }
        }
    }

    /// The current number of references.
    pub fn refs(&self) -> u16 {
        match self.count.load(Ordering::Acquire) {
            BUSY => 0,
            n => n,
        }
    }
}

impl<T: SharedInit> Default for SharedState<T> {
    fn default() -> Self {
        Self::new()
    }
}
