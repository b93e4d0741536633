// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold System-Level Transactions
//!
//! This crate implements a system-level transaction manager. An application
//! brackets a block of operations as a transaction by passing it to
//! [`run`]; the runtime executes it atomically and isolated from the
//! transactions of other threads. On a conflict the transaction rolls back
//! and re-executes, on success all of its effects are applied at once.
//!
//! The manager itself handles no resources. Resources are contributed by
//! modules, providers of transactional operations that register through
//! [`register_module`] and participate in commit and rollback through the
//! [`Module`] callbacks and the per-transaction event log. The crate also
//! ships the shared primitives the modules are built from: reader/writer
//! locks with conflict-and-restart semantics, reference counters, a
//! lock-free treemap and the shared-state lifecycle.
//!
//! ```
//! use stronghold_tx as tx;
//!
//! let value = tx::run(|| {
//!     // transactional operations of registered modules
//!     Ok(2 + 3)
//! })
//! .expect("Transaction failed");
//!
//! assert_eq!(value, 5);
//! ```

pub mod error;
pub mod event;
pub mod module;
pub mod refcount;
pub mod rwlock;
pub mod rwstate;
pub mod shared;
pub mod slist;
pub mod state;
pub mod treemap;
pub mod tx;

pub use error::{Error, ErrorCode, LockId, Result, Status};
pub use event::{Event, EventLog};
pub use module::Module;
pub use tx::{
    append_event, irrevocable, is_irrevocable, number_of_restarts, register_module, release_thread,
    restart, run, set_pending_error, with_module, Mode,
};
