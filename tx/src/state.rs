// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Lazily-Initialized State
//!
//! [`LazyState`] manages a single piece of state that is set up on first
//! acquisition and torn down on release. It carries no synchronization of
//! its own; put it inside a `thread_local!` cell to get per-thread state
//! with once-per-thread initialization, the way the transaction engine
//! hosts its per-thread transaction record.

use crate::error::Result;

/// A state cell that initializes at most once until released.
#[derive(Default)]
pub struct LazyState<T> {
    value: Option<T>,
}

impl<T> LazyState<T> {
    pub const fn new() -> Self {
        Self { value: None }
    }

    pub fn is_initialized(&self) -> bool {
        self.value.is_some()
    }

    /// Returns the state, running `init` first if the state has not been
    /// initialized yet. With `initialize` unset, an uninitialized cell
    /// yields `None` instead.
    pub fn acquire(
        &mut self,
        initialize: bool,
        init: impl FnOnce() -> Result<T>,
    ) -> Result<Option<&mut T>> {
        if self.value.is_none() {
            if !initialize {
                return Ok(None);
            }
            self.value = Some(init()?);
        }

        Ok(self.value.as_mut())
    }

    /// Returns the state if it has been initialized.
    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.value.as_mut()
    }

    /// Tears the state down through `uninit` and returns the cell to the
    /// uninitialized state. A no-op on an uninitialized cell.
    pub fn release(&mut self, uninit: impl FnOnce(&mut T)) {
        if let Some(mut value) = self.value.take() {
            uninit(&mut value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::LazyState;

    #[test]
    fn test_initializes_once() {
        let mut state = LazyState::new();
        let mut inits = 0;

        assert!(!state.is_initialized());

        for _ in 0..3 {
            let value = state
                .acquire(true, || {
                    inits += 1;
                    Ok(41)
                })
                .expect("Failed to initialize")
                .expect("No state returned");
            *value += 1;
        }

        assert_eq!(inits, 1);
        assert_eq!(state.get_mut(), Some(&mut 44));
    }

    #[test]
    fn test_acquire_without_initialize() {
        let mut state: LazyState<u32> = LazyState::new();

        let value = state.acquire(false, || Ok(0)).expect("Acquire failed");
        assert!(value.is_none());
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_release_runs_uninit() {
        let mut state = LazyState::new();
        state.acquire(true, || Ok(7)).expect("Failed to initialize");

        let mut released = None;
        state.release(|v| released = Some(*v));

        assert_eq!(released, Some(7));
        assert!(!state.is_initialized());

        // releasing again is a no-op
        state.release(|_| panic!("uninit on empty state"));
    }
}
