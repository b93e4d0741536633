// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Per-Transaction Lock State
//!
//! A [`RwLock`](crate::rwlock::RwLock) does not know who holds it, so every
//! transaction records its own role per lock in a [`RwState`]. The state
//! machine guarantees that each lock is acquired at most once per
//! transaction and that an upgrade is only ever issued by the transaction
//! that already holds the reader role.

use crate::{error::Result, rwlock::RwLock};

/// The role a transaction holds on one lock.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RwStatus {
    #[default]
    Unlocked,
    RdLocked,
    WrLocked,
}

/// Tracks one transaction's role on one lock.
#[derive(Debug, Default)]
pub struct RwState {
    status: RwStatus,
}

impl RwState {
    pub const fn new() -> Self {
        Self {
            status: RwStatus::Unlocked,
        }
    }

    pub fn status(&self) -> RwStatus {
        self.status
    }

    /// True if the transaction holds any role on the lock. A writer role
    /// counts as an implicit reader role.
    pub fn is_rdlocked(&self) -> bool {
        self.status != RwStatus::Unlocked
    }

    pub fn is_wrlocked(&self) -> bool {
        self.status == RwStatus::WrLocked
    }

    /// Acquires the reader role; a no-op if any role is already held.
    pub fn try_rdlock(&mut self, lock: &RwLock) -> Result<()> {
        if self.status != RwStatus::Unlocked {
            return Ok(());
        }

        lock.try_rdlock()?;
        self.status = RwStatus::RdLocked;

        Ok(())
    }

    /// Acquires the writer role, upgrading the reader role if one is held;
    /// a no-op if the writer role is already held.
    pub fn try_wrlock(&mut self, lock: &RwLock) -> Result<()> {
        match self.status {
            RwStatus::WrLocked => Ok(()),
            RwStatus::RdLocked => {
                // only the role holder may request the upgrade
                lock.try_wrlock(true)?;
                self.status = RwStatus::WrLocked;
                Ok(())
            }
            RwStatus::Unlocked => {
                lock.try_wrlock(false)?;
                self.status = RwStatus::WrLocked;
                Ok(())
            }
        }
    }

    /// Releases whatever role is held and returns to `Unlocked`.
    pub fn unlock(&mut self, lock: &RwLock) {
        if self.status == RwStatus::Unlocked {
            return;
        }

        lock.unlock();
        self.status = RwStatus::Unlocked;
    }
}

impl Drop for RwState {
    fn drop(&mut self) {
        // roles must have been handed back through unlock(); skip the
        // check while unwinding, where cleanup runs out of order
        if !std::thread::panicking() {
            debug_assert_eq!(self.status, RwStatus::Unlocked);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RwState, RwStatus};
    use crate::rwlock::RwLock;

    #[test]
    fn test_rdlock_is_idempotent() {
        let lock = RwLock::new();
        let mut state = RwState::new();

        state.try_rdlock(&lock).expect("Failed to acquire reader");
        state.try_rdlock(&lock).expect("Reader re-acquire failed");
        assert_eq!(state.status(), RwStatus::RdLocked);

        state.unlock(&lock);
        assert!(lock.is_unlocked());
    }

    #[test]
    fn test_upgrade_from_reader() {
        let lock = RwLock::new();
        let mut state = RwState::new();

        state.try_rdlock(&lock).expect("Failed to acquire reader");
        state.try_wrlock(&lock).expect("Failed to upgrade");
        assert_eq!(state.status(), RwStatus::WrLocked);

        // rdlock and wrlock are now no-ops
        state.try_rdlock(&lock).expect("Reader no-op failed");
        state.try_wrlock(&lock).expect("Writer no-op failed");

        state.unlock(&lock);
        assert!(lock.is_unlocked());
    }

    #[test]
    fn test_unlock_releases_single_role() {
        let lock = RwLock::new();
        let mut state = RwState::new();

        state.try_wrlock(&lock).expect("Failed to acquire writer");
        state.unlock(&lock);
        state.unlock(&lock);

        assert_eq!(state.status(), RwStatus::Unlocked);
        assert!(lock.is_unlocked());
    }

    #[test]
    fn test_foreign_reader_blocks_upgrade() {
        let lock = RwLock::new();
        let mut ours = RwState::new();
        let mut theirs = RwState::new();

        ours.try_rdlock(&lock).expect("Failed to acquire reader");
        theirs.try_rdlock(&lock).expect("Failed to acquire reader");

        assert!(ours.try_wrlock(&lock).is_err());
        assert_eq!(ours.status(), RwStatus::RdLocked);

        ours.unlock(&lock);
        theirs.unlock(&lock);
    }
}
