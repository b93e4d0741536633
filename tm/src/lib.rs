// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Stronghold Transactional Memory
//!
//! This crate adds software transactional memory to the stronghold
//! transaction manager. Inside a transaction, any byte of process memory
//! can be loaded, stored, copied or privatized through the functions
//! below; the module keeps concurrent transactions isolated through
//! two-phase locking on 8-byte blocks and rolls uncommitted writes back on
//! abort.
//!
//! Writes are buffered per transaction and flushed at commit
//! (*write-back*). A privatized region is owned exclusively by the calling
//! transaction and accessed in place (*write-through*); the pre-image is
//! kept for rollback.
//!
//! All operations take raw addresses and are `unsafe`: the caller
//! guarantees that the addressed memory is valid for the duration of the
//! transaction, and that non-transactional code does not touch it
//! concurrently.
//!
//! ```
//! use stronghold_tm as tm;
//! use stronghold_tx as tx;
//!
//! let counter = Box::leak(Box::new(0u64));
//! let addr = counter as *mut u64;
//!
//! tx::run(|| {
//!     let value = unsafe { tm::load_value(addr)? };
//!     unsafe { tm::store_value(addr, value + 1)? };
//!     Ok(())
//! })
//! .expect("Transaction failed");
//!
//! assert_eq!(*counter, 1);
//! ```

pub mod block;
pub mod frame;
pub mod framemap;
pub mod page;
pub mod vmem;

mod module;
mod tx;

pub use crate::tx::Privatize;
pub use stronghold_tx::{Error, ErrorCode, Result};

use crate::module::with_vmem_tx;

/// Loads `buf.len()` bytes at `addr` into `buf`.
///
/// # Safety
/// `[addr, addr + buf.len())` must be valid memory that only
/// transactional code accesses.
pub unsafe fn load(addr: *const u8, buf: &mut [u8]) -> Result<()> {
    with_vmem_tx(|tx| tx.ld(addr as usize, buf))
}

/// Stores `buf` at `addr`. The bytes become visible to other transactions
/// when the transaction commits.
///
/// # Safety
/// `[addr, addr + buf.len())` must be valid memory that only
/// transactional code accesses.
pub unsafe fn store(addr: *mut u8, buf: &[u8]) -> Result<()> {
    with_vmem_tx(|tx| tx.st(addr as usize, buf))
}

/// Copies `siz` bytes from `laddr` to `saddr`. The regions may overlap.
///
/// # Safety
/// Both regions must be valid memory that only transactional code
/// accesses.
pub unsafe fn loadstore(laddr: *const u8, saddr: *mut u8, siz: usize) -> Result<()> {
    with_vmem_tx(|tx| tx.ldst(laddr as usize, saddr as usize, siz))
}

/// Privatizes `[addr, addr + siz)` for the remainder of the transaction.
/// The region may then be accessed directly, without going through
/// [`load`] and [`store`]; `flags` declares the intended accesses.
///
/// # Safety
/// The region must be valid memory; until the transaction finishes it
/// must not be touched by other threads except through transactional
/// operations.
pub unsafe fn privatize(addr: *const u8, siz: usize, flags: Privatize) -> Result<()> {
    with_vmem_tx(|tx| tx.privatize(addr as usize, siz, flags))
}

/// Privatizes the region from `addr` up to and including the first byte
/// equal to `c`, e.g. the terminator of a C string.
///
/// # Safety
/// The memory up to and including the first occurrence of `c` must be
/// valid; until the transaction finishes it must not be touched by other
/// threads except through transactional operations.
pub unsafe fn privatize_until_char(addr: *const u8, c: u8, flags: Privatize) -> Result<()> {
    with_vmem_tx(|tx| tx.privatize_c(addr as usize, c, flags))
}

/// Loads a value of a plain type from `addr`.
///
/// # Safety
/// As for [`load`]; `addr` must point to a valid `T`.
pub unsafe fn load_value<T: Copy>(addr: *const T) -> Result<T> {
    let mut value = std::mem::MaybeUninit::<T>::uninit();
    let buf =
        std::slice::from_raw_parts_mut(value.as_mut_ptr() as *mut u8, std::mem::size_of::<T>());

    load(addr as *const u8, buf)?;

    Ok(value.assume_init())
}

/// Stores a value of a plain type at `addr`.
///
/// # Safety
/// As for [`store`]; `addr` must point to a valid `T`.
pub unsafe fn store_value<T: Copy>(addr: *mut T, value: T) -> Result<()> {
    let buf = std::slice::from_raw_parts(&value as *const T as *const u8, std::mem::size_of::<T>());

    store(addr as *mut u8, buf)
}
