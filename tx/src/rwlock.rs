// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Reader/Writer Lock
//!
//! [`RwLock`] is a single-byte lock on a shared resource. It either counts
//! its readers or records one exclusive writer. The lock never blocks and
//! never queues waiters: a failed acquisition is a conflict, and the caller
//! is expected to restart its transaction.
//!
//! The lock does not track *which* transaction holds it. Each transaction
//! keeps its own [`crate::rwstate::RwState`] per lock and must acquire each
//! lock at most once.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::{Error, LockId, Result};

/// Counter value reserved for an exclusive writer.
const WRITER: u8 = u8::MAX;

/// A reader/writer lock of a single byte.
///
/// The value 0 means unlocked, `1..=254` is the number of active readers
/// and 255 marks an exclusive writer.
///
/// # Example
/// ```
/// use stronghold_tx::rwlock::RwLock;
///
/// let lock = RwLock::new();
/// lock.try_rdlock().expect("Failed to acquire reader lock");
/// lock.try_wrlock(true).expect("Failed to upgrade to writer lock");
/// lock.unlock();
/// ```
#[derive(Default, Debug)]
pub struct RwLock {
    n: AtomicU8,
}

impl RwLock {
    pub const fn new() -> Self {
        Self { n: AtomicU8::new(0) }
    }

    /// The token naming this lock in conflict errors.
    pub fn id(&self) -> LockId {
        LockId::of(&self.n)
    }

    /// Tries to acquire a reader lock, failing with a conflict if a writer
    /// is present or the reader count is saturated.
    pub fn try_rdlock(&self) -> Result<()> {
        let mut n = self.n.load(Ordering::Acquire);

        loop {
            // a writer, or one below it would saturate the counter
            if n >= WRITER - 1 {
                return Err(Error::conflicting(Some(self.id())));
            }

            match self
                .n
                .compare_exchange_weak(n, n + 1, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Ok(()),
                Err(current) => n = current,
            }
        }
    }

    /// Tries to acquire the writer lock.
    ///
    /// With `upgrade` set, the caller asserts that it is the lock's sole
    /// reader and its reader lock is exchanged for the writer lock. Any
    /// concurrent user fails the exchange with a conflict.
    pub fn try_wrlock(&self, upgrade: bool) -> Result<()> {
        let expected = u8::from(upgrade);

        self.n
            .compare_exchange(expected, WRITER, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::conflicting(Some(self.id())))
    }

    /// Releases one acquisition; the writer, or one reader.
    ///
    /// Must be called exactly once per successful `try_rdlock`/`try_wrlock`.
    pub fn unlock(&self) {
        let mut n = self.n.load(Ordering::Acquire);

        loop {
            debug_assert_ne!(n, 0, "unlocking an unlocked lock");

            let next = if n == WRITER { 0 } else { n - 1 };

            match self
                .n
                .compare_exchange_weak(n, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(current) => n = current,
            }
        }
    }

    /// Returns true if no reader or writer holds the lock.
    pub fn is_unlocked(&self) -> bool {
        self.n.load(Ordering::Acquire) == 0
    }
}
