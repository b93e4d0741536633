// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transaction Errors
//!
//! Every fallible operation of the transaction manager reports a [`Error`].
//! The error's kind decides what the engine does with a failed transaction:
//! a conflict triggers a restart, a revocability request triggers a restart
//! in irrevocable mode, and everything else travels to the application's
//! recovery branch.

use std::sync::atomic::AtomicU8;

/// Global return type
pub type Result<T> = core::result::Result<T, Error>;

/// Extra error codes for failures that have no useful system error code.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// The exact error is unknown.
    General,
    /// Memory allocation failed.
    OutOfMemory,
    /// The floating-point environment is invalid.
    InvalidFenv,
    /// A memory access was out of bounds.
    OutOfBounds,
}

/// Discriminant of [`Error`], for dispatching on the error's kind after
/// the payload has been consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Status {
    Conflicting,
    Revocable,
    Code,
    Errno,
    KernReturn,
    Signal,
}

/// An opaque token naming the reader/writer lock that caused a conflict.
///
/// The token is derived from the lock's address. It identifies the lock for
/// diagnostics and conflict-resolution heuristics, but cannot be turned back
/// into a reference.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockId(usize);

impl LockId {
    pub(crate) fn of(lock: &AtomicU8) -> Self {
        Self(lock as *const _ as usize)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Kind {
    #[error("Conflict among transactions detected")]
    Conflicting(Option<LockId>),

    #[error("Transaction requires irrevocability to continue")]
    Revocable,

    #[error("Transaction failed ({0:?})")]
    Code(ErrorCode),

    #[error("Transaction failed with system error ({0})")]
    Errno(i32),

    #[error("Transaction failed with kernel error ({0})")]
    KernReturn(i32),

    #[error("Signal {0} received inside transaction")]
    Signal(i32),
}

/// The error value carried through begin, commit and recovery.
#[derive(Debug, thiserror::Error)]
#[error("{kind}{}", .description.as_deref().map(|d| format!(": {}", d)).unwrap_or_default())]
pub struct Error {
    kind: Kind,
    non_recoverable: bool,
    description: Option<String>,
}

impl Error {
    fn new(kind: Kind) -> Self {
        Self {
            kind,
            non_recoverable: false,
            description: None,
        }
    }

    /// A conflict with another transaction, optionally naming the lock it
    /// was detected on. The caller's transaction restarts.
    pub fn conflicting(lock: Option<LockId>) -> Self {
        Self::new(Kind::Conflicting(lock))
    }

    /// The operation cannot run speculatively; the transaction restarts in
    /// irrevocable mode.
    pub fn revocable() -> Self {
        Self::new(Kind::Revocable)
    }

    pub fn code(code: ErrorCode) -> Self {
        Self::new(Kind::Code(code))
    }

    pub fn errno(errno: i32) -> Self {
        Self::new(Kind::Errno(errno))
    }

    pub fn kern_return(value: i32) -> Self {
        Self::new(Kind::KernReturn(value))
    }

    /// An asynchronous signal delivered while the transaction ran.
    pub fn signal(signo: i32) -> Self {
        Self::new(Kind::Signal(signo))
    }

    pub fn status(&self) -> Status {
        match self.kind {
            Kind::Conflicting(_) => Status::Conflicting,
            Kind::Revocable => Status::Revocable,
            Kind::Code(_) => Status::Code,
            Kind::Errno(_) => Status::Errno,
            Kind::KernReturn(_) => Status::KernReturn,
            Kind::Signal(_) => Status::Signal,
        }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    /// Marks the error as fatal for the current transaction. The engine
    /// will not restart but surface the error to the recovery branch.
    pub fn mark_non_recoverable(&mut self) {
        self.non_recoverable = true;
    }

    pub fn into_non_recoverable(mut self) -> Self {
        self.mark_non_recoverable();
        self
    }

    pub fn is_non_recoverable(&self) -> bool {
        self.non_recoverable
    }

    /// Attaches a human-readable description to the error.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = Some(description.into());
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.set_description(description);
        self
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The conflicting lock for a conflict error, if it was known.
    pub fn conflicting_lock(&self) -> Option<LockId> {
        match self.kind {
            Kind::Conflicting(lock) => lock,
            _ => None,
        }
    }

    /// The error code for [`Status::Code`] errors, [`ErrorCode::General`]
    /// otherwise.
    pub fn as_error_code(&self) -> ErrorCode {
        match self.kind {
            Kind::Code(code) => code,
            _ => ErrorCode::General,
        }
    }

    /// The system errno for [`Status::Errno`] errors, 0 otherwise.
    pub fn as_errno(&self) -> i32 {
        match self.kind {
            Kind::Errno(errno) => errno,
            _ => 0,
        }
    }

    /// The signal number for [`Status::Signal`] errors, 0 otherwise.
    pub fn as_signal(&self) -> i32 {
        match self.kind {
            Kind::Signal(signo) => signo,
            _ => 0,
        }
    }
}
