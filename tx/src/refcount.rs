// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Reference Counters
//!
//! Two 16-bit counter flavors with first/final-reference results: [`Ref16`]
//! for single-threaded book-keeping and [`SharedRef16`] for state shared
//! between threads. Counting up past `u16::MAX` or down past zero is a
//! defect and trips a debug assertion.

use std::sync::atomic::{AtomicU16, Ordering};

/// A 16-bit thread-local reference counter.
#[derive(Debug, Default)]
pub struct Ref16 {
    count: u16,
}

impl Ref16 {
    pub const fn new(count: u16) -> Self {
        Self { count }
    }

    /// Increments the counter. Returns true if this was the first
    /// reference.
    pub fn up(&mut self) -> bool {
        debug_assert_ne!(self.count, u16::MAX, "reference counter overflow");
        self.count = self.count.wrapping_add(1);
        self.count == 1
    }

    /// Decrements the counter. Returns true if this was the final
    /// reference.
    pub fn down(&mut self) -> bool {
        debug_assert_ne!(self.count, 0, "reference counter underflow");
        self.count = self.count.wrapping_sub(1);
        self.count == 0
    }

    pub fn count(&self) -> u16 {
        self.count
    }
}

/// A 16-bit shared reference counter.
#[derive(Debug, Default)]
pub struct SharedRef16 {
    count: AtomicU16,
}

impl SharedRef16 {
    pub const fn new(count: u16) -> Self {
        Self {
            count: AtomicU16::new(count),
        }
    }

    /// Increments the counter. Returns true if this was the first
    /// reference.
    pub fn up(&self) -> bool {
        let old = self.count.fetch_add(1, Ordering::AcqRel);
        debug_assert_ne!(old, u16::MAX, "reference counter overflow");

        old == 0
    }

    /// Decrements the counter. Returns true if this was the final
    /// reference.
    pub fn down(&self) -> bool {
        let old = self.count.fetch_sub(1, Ordering::AcqRel);
        debug_assert_ne!(old, 0, "reference counter underflow");

        old == 1
    }

    pub fn count(&self) -> u16 {
        self.count.load(Ordering::Acquire)
    }
}
