// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Transaction Engine
//!
//! The engine drives one transaction per thread through speculative
//! execution, commit and recovery. The application passes the transaction
//! body as a closure to [`run`]; the engine loops the body until it either
//! commits or fails with an error that cannot be recovered by restarting.
//!
//! A failed attempt is rolled back through the registered modules' undo
//! callbacks before the body runs again. Conflicts restart the transaction
//! as-is; an operation that cannot be executed speculatively restarts it in
//! irrevocable mode, during which no other transaction in the process may
//! run.

use std::{cell::RefCell, sync::RwLock as StdRwLock};

use lazy_static::lazy_static;
use log::*;

use crate::{
    error::{Error, ErrorCode, Result, Status},
    event::EventLog,
    module::{Module, ModuleSlot},
    state::LazyState,
};

/// The mode a transaction attempt starts in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    /// First attempt.
    Start,
    /// Restarted after a conflict.
    Retry,
    /// Restarted with the process-wide exclusive gate held.
    Irrevocable,
    /// The attempt failed for good; the error surfaces to the caller.
    Recovery,
}

/// Per-thread transaction record.
struct TxRecord {
    mode: Mode,
    irrevocable: bool,
    active: bool,
    restarts: usize,
    modules: Vec<ModuleSlot>,
    log: EventLog,
    /// Slot for errors delivered asynchronously, e.g. by a signal handler.
    pending: Option<Error>,
}

impl TxRecord {
    fn new() -> Self {
        Self {
            mode: Mode::Start,
            irrevocable: false,
            active: false,
            restarts: 0,
            modules: Vec::new(),
            log: EventLog::new(),
            pending: None,
        }
    }

    fn release_modules(&mut self) {
        for mut slot in self.modules.drain(..) {
            slot.module.release();
        }
    }
}

impl Drop for TxRecord {
    fn drop(&mut self) {
        self.release_modules();
    }
}

thread_local! {
    static TX: RefCell<LazyState<TxRecord>> = const { RefCell::new(LazyState::new()) };
}

/// Runs `f` on this thread's transaction record, creating the record on
/// first use.
fn with_record<R>(f: impl FnOnce(&mut TxRecord) -> Result<R>) -> Result<R> {
    TX.with(|cell| {
        let mut state = cell.borrow_mut();
        let record = state
            .acquire(true, || Ok(TxRecord::new()))?
            .expect("transaction record was just initialized");
        f(record)
    })
}

lazy_static! {
    /// Serializes irrevocable transactions against all others. Speculative
    /// transactions hold the gate shared for the duration of one attempt,
    /// an irrevocable transaction holds it exclusively.
    static ref GATE: StdRwLock<()> = StdRwLock::new(());
}

enum Gate {
    Shared {
        _guard: std::sync::RwLockReadGuard<'static, ()>,
    },
    Exclusive {
        _guard: std::sync::RwLockWriteGuard<'static, ()>,
    },
}

fn enter_gate(mode: Mode) -> Gate {
    if mode == Mode::Irrevocable {
        Gate::Exclusive {
            _guard: GATE.write().unwrap_or_else(|err| err.into_inner()),
        }
    } else {
        Gate::Shared {
            _guard: GATE.read().unwrap_or_else(|err| err.into_inner()),
        }
    }
}

/// Runs `body` as a transaction.
///
/// The body executes speculatively and may run any number of times: on a
/// conflict with another transaction the engine rolls the attempt back and
/// runs the body again. The body must confine its side effects to
/// transactional operations so that a rolled-back attempt leaves no trace.
///
/// `Ok` from the body commits the transaction. An error from the body, or
/// from the commit, either restarts the transaction (conflicts, requests
/// for irrevocability) or rolls it back for good and surfaces the error to
/// the caller, which serves as the recovery branch.
///
/// # Example
/// ```
/// use stronghold_tx as tx;
///
/// let value = tx::run(|| Ok(21 * 2)).expect("Transaction failed");
/// assert_eq!(value, 42);
/// ```
pub fn run<R>(mut body: impl FnMut() -> Result<R>) -> Result<R> {
    // refuse re-entry before touching any transaction state; the outer
    // transaction must stay intact
    with_record(|record| {
        if record.active {
            return Err(Error::code(ErrorCode::General)
                .with_description("nested transactions are not supported")
                .into_non_recoverable());
        }
        Ok(())
    })?;

    let mut mode = Mode::Start;

    loop {
        let _gate = enter_gate(mode);

        debug!("TX: BEGIN ({:?})", mode);

        let attempt = begin_attempt(mode)
            .and_then(|()| body())
            .and_then(|value| {
                take_pending_error()?;
                Ok(value)
            })
            .and_then(|value| commit_attempt().map(|()| value));

        let mut err = match attempt {
            Ok(value) => {
                debug!("TX: COMMITTED");
                return Ok(value);
            }
            Err(err) => err,
        };

        let was_irrevocable = is_irrevocable();

        err = rollback_attempt(err);

        if was_irrevocable {
            // an irrevocable transaction has no second chance
            err.mark_non_recoverable();
        }

        if !err.is_non_recoverable() {
            // recoverable errors restart the transaction; a request for
            // irrevocability restarts it behind the exclusive gate
            mode = match err.status() {
                Status::Revocable => {
                    debug!("TX: UPGRADING TO IRREVOCABLE");
                    Mode::Irrevocable
                }
                _ => {
                    debug!("TX: RESTARTING ({})", err);
                    Mode::Retry
                }
            };

            note_restart();
            continue;
        }

        debug!("TX: RECOVERY ({})", err);
        let _ = with_record(|record| {
            record.mode = Mode::Recovery;
            Ok(())
        });

        return Err(err);
    }
}

fn begin_attempt(mode: Mode) -> Result<()> {
    with_record(|record| {
        record.active = true;
        record.mode = mode;
        record.irrevocable = mode == Mode::Irrevocable;
        if mode == Mode::Start {
            record.restarts = 0;
        }

        // an error delivered between transactions aborts the attempt
        if let Some(err) = record.pending.take() {
            return Err(err);
        }

        for slot in record.modules.iter_mut() {
            slot.module.begin()?;
        }

        Ok(())
    })
}

/// Commits the current attempt: prepare, apply the event log in order, let
/// the modules flush, then finish. Errors in the apply phase are
/// non-recoverable.
fn commit_attempt() -> Result<()> {
    with_record(|record| {
        let irrevocable = record.irrevocable;

        for slot in record.modules.iter_mut() {
            slot.module.prepare_commit(irrevocable)?;
        }

        for event in record.log.iter() {
            record
                .modules
                .get_mut(event.module)
                .expect("event names an unregistered module")
                .module
                .apply_event(event.head, event.tail)
                .map_err(Error::into_non_recoverable)?;
        }

        for slot in record.modules.iter_mut() {
            slot.module.apply().map_err(Error::into_non_recoverable)?;
        }

        Ok(())
    })?;

    finish_attempt()
}

/// Rolls the current attempt back: undo the event log in reverse, let the
/// modules undo their batched state, then finish. The original error is
/// returned, marked non-recoverable if the rollback itself failed.
fn rollback_attempt(mut err: Error) -> Error {
    let undone = with_record(|record| {
        for event in record.log.iter_rev() {
            record
                .modules
                .get_mut(event.module)
                .expect("event names an unregistered module")
                .module
                .undo_event(event.head, event.tail)?;
        }

        for slot in record.modules.iter_mut().rev() {
            slot.module.undo()?;
        }

        Ok(())
    });

    if let Err(undo_err) = undone {
        error!("TX: ROLLBACK FAILED ({})", undo_err);
        err.mark_non_recoverable();
    }

    if let Err(finish_err) = finish_attempt() {
        error!("TX: FINISH FAILED ({})", finish_err);
        err.mark_non_recoverable();
    }

    err
}

/// Ends the attempt on both the commit and the rollback path: clears the
/// event log, runs every module's `finish` and resets the transaction
/// flags. Lock release happens inside the modules' `finish`.
fn finish_attempt() -> Result<()> {
    with_record(|record| {
        record.log.clear();

        let mut first_err = None;
        for slot in record.modules.iter_mut() {
            if let Err(finish_err) = slot.module.finish() {
                error!("TX: MODULE FINISH FAILED ({})", finish_err);
                first_err.get_or_insert(finish_err.into_non_recoverable());
            }
        }

        record.irrevocable = false;
        record.active = false;

        match first_err {
            None => Ok(()),
            Some(finish_err) => Err(finish_err),
        }
    })
}

fn note_restart() {
    let _ = with_record(|record| {
        record.restarts += 1;
        Ok(())
    });
}

fn take_pending_error() -> Result<()> {
    with_record(|record| match record.pending.take() {
        Some(err) => Err(err),
        None => Ok(()),
    })
}

/// Registers a module on the current thread and returns its index. The
/// index identifies the module in events and [`with_module`] calls, and
/// registration order decides the apply order of the modules' callbacks.
pub fn register_module(module: Box<dyn Module>) -> Result<usize> {
    with_record(|record| {
        record.modules.push(ModuleSlot::new(module));
        let index = record.modules.len() - 1;

        debug!("TX: REGISTERED MODULE #{}", index);

        Ok(index)
    })
}

/// Appends an event to the current transaction's event log.
pub fn append_event(module: usize, head: u16, tail: usize) -> Result<()> {
    with_record(|record| {
        if module >= record.modules.len() {
            return Err(Error::code(ErrorCode::General).with_description("unknown module"));
        }

        record.log.append(module, head, tail);
        Ok(())
    })
}

/// Runs `f` on the registered module `id`, downcast to its concrete type.
pub fn with_module<M: Module, R>(id: usize, f: impl FnOnce(&mut M) -> Result<R>) -> Result<R> {
    with_record(|record| {
        let slot = record
            .modules
            .get_mut(id)
            .ok_or_else(|| Error::code(ErrorCode::General).with_description("unknown module"))?;
        let module = slot
            .downcast_mut::<M>()
            .ok_or_else(|| Error::code(ErrorCode::General).with_description("module type mismatch"))?;

        f(module)
    })
}

/// Requests irrevocability for the current transaction.
///
/// From speculative mode, this returns an error that the caller propagates
/// out of the transaction body; the engine then restarts the transaction in
/// irrevocable mode. Once irrevocable, the call is a no-op.
pub fn irrevocable() -> Result<()> {
    with_record(|record| {
        if record.irrevocable {
            Ok(())
        } else {
            Err(Error::revocable())
        }
    })
}

/// True if the current transaction runs in irrevocable mode.
pub fn is_irrevocable() -> bool {
    TX.with(|cell| {
        cell.borrow_mut()
            .get_mut()
            .map(|record| record.irrevocable)
            .unwrap_or(false)
    })
}

/// The number of restarts the current transaction has gone through.
pub fn number_of_restarts() -> usize {
    TX.with(|cell| {
        cell.borrow_mut()
            .get_mut()
            .map(|record| record.restarts)
            .unwrap_or(0)
    })
}

/// An error that, propagated out of the transaction body, restarts the
/// transaction.
pub fn restart() -> Error {
    Error::conflicting(None)
}

/// Records an asynchronously delivered error, such as a converted signal,
/// on the current thread's transaction. The engine picks it up before the
/// transaction commits and restarts or surfaces it depending on the
/// error's recoverability.
pub fn set_pending_error(err: Error) {
    let _ = with_record(|record| {
        record.pending = Some(err);
        Ok(())
    });
}

/// Releases all per-thread transaction state, running each registered
/// module's `release` callback. Runs implicitly at thread exit.
pub fn release_thread() {
    TX.with(|cell| {
        let mut state = cell.borrow_mut();
        state.release(|record| record.release_modules());
    });
}
