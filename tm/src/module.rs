// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! Wires the memory engine into the transaction manager. Each thread gets
//! one [`MemModule`] holding its [`VmemTx`]; the module registers itself
//! with the engine the first time the thread touches transactional memory
//! and takes a reference on the shared [`Vmem`](crate::vmem::Vmem). The
//! engine drives apply, undo and finish through the module callbacks;
//! thread teardown drops the registration and the memory reference.

use std::cell::Cell;

use log::*;
use stronghold_tx::{self as tx, error::Result, Module};

use crate::{tx::VmemTx, vmem::VMEM};

thread_local! {
    static MODULE_ID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// The STM's per-thread module state.
pub(crate) struct MemModule {
    tx: VmemTx,
}

impl Module for MemModule {
    fn apply(&mut self) -> Result<()> {
        self.tx.apply()
    }

    fn undo(&mut self) -> Result<()> {
        self.tx.undo()
    }

    fn finish(&mut self) -> Result<()> {
        self.tx.finish()
    }

    fn release(&mut self) {
        // thread-local destruction order is unspecified, so the cache may
        // already be gone
        let _ = MODULE_ID.try_with(|id| id.set(None));
        VMEM.release();
    }
}

/// The id of this thread's memory module, registering it on first use.
fn module_id() -> Result<usize> {
    if let Some(id) = MODULE_ID.with(|id| id.get()) {
        return Ok(id);
    }

    let vmem = VMEM.acquire()?;

    let id = match tx::register_module(Box::new(MemModule {
        tx: VmemTx::new(vmem, 0),
    })) {
        Ok(id) => id,
        Err(err) => {
            VMEM.release();
            return Err(err);
        }
    };

    tx::with_module::<MemModule, _>(id, |module| {
        module.tx.set_module(id);
        Ok(())
    })?;

    MODULE_ID.with(|cell| cell.set(Some(id)));
    debug!("TM: REGISTERED AS MODULE #{}", id);

    Ok(id)
}

/// Runs `f` on this thread's memory engine.
pub(crate) fn with_vmem_tx<R>(f: impl FnOnce(&mut VmemTx) -> Result<R>) -> Result<R> {
    let id = module_id()?;
    tx::with_module::<MemModule, _>(id, |module| f(&mut module.tx))
}
