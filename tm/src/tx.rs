// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Per-Transaction Memory Engine
//!
//! [`VmemTx`] executes one transaction's loads and stores against the
//! shared frames. Requests of any byte length are split into block-sized
//! chunks; for each chunk the engine acquires the transaction's page,
//! takes the frame's lock in the required role and moves bytes between
//! caller, page buffer and live memory. Locking follows strict two-phase
//! locking: locks accumulate during execution and are only released in
//! [`VmemTx::finish`], after the commit has applied or the rollback has
//! undone every staged write.

use std::ops::BitOr;

use log::*;
use stronghold_tx::{error::Result, slist::SList};

use crate::{
    block::{block_bits, block_index_at, block_offset_at, BLOCK_FULL_MASK, BLOCK_SIZE},
    frame::Frame,
    page::Page,
    vmem::Vmem,
};

/// Privatization flags: how the caller will access the privatized region.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Privatize(u32);

impl Privatize {
    /// The region is read non-transactionally.
    pub const LOAD: Self = Self(1 << 0);

    /// The region is written non-transactionally; a rollback restores the
    /// pre-image.
    pub const STORE: Self = Self(1 << 1);

    /// The region is read and written.
    pub const LOADSTORE: Self = Self(Self::LOAD.0 | Self::STORE.0);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Privatize {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// The transaction-local side of the STM: the pages this transaction has
/// touched, sorted by block index, plus a free list of recycled pages.
pub struct VmemTx {
    vmem: &'static Vmem,
    module: usize,
    active_pages: SList<Page>,
    alloced_pages: SList<Page>,
}

impl VmemTx {
    pub fn new(vmem: &'static Vmem, module: usize) -> Self {
        Self {
            vmem,
            module,
            active_pages: SList::new(),
            alloced_pages: SList::new(),
        }
    }

    pub fn set_module(&mut self, module: usize) {
        self.module = module;
    }

    fn frame(&self, block_index: usize) -> Result<&'static Frame> {
        self.vmem.acquire_frame_by_block(block_index)
    }

    /// Returns the page shadowing `block_index`, creating it on first
    /// touch. Pages are recycled from the free list and kept sorted by
    /// block index.
    fn acquire_page(&mut self, block_index: usize) -> Result<&mut Page> {
        if self
            .active_pages
            .find(|page| page.block_index() == block_index)
            .is_none()
        {
            let page = match self.alloced_pages.dequeue() {
                Some(mut page) => {
                    page.reset(block_index);
                    page
                }
                None => Page::new(block_index),
            };

            self.active_pages
                .enqueue_sorted(page, |a, b| a.block_index() < b.block_index());
        }

        Ok(self
            .active_pages
            .find_mut(|page| page.block_index() == block_index)
            .expect("page was just inserted"))
    }

    /// Loads `buf.len()` bytes from `addr` into `buf`.
    pub fn ld(&mut self, mut addr: usize, mut buf: &mut [u8]) -> Result<()> {
        while !buf.is_empty() {
            let block_index = block_index_at(addr);
            let frame = self.frame(block_index)?;

            // locks are released as part of finish()
            let page = self.acquire_page(block_index)?;
            if !page.has_rdlocked_frame() {
                page.try_rdlock_frame(frame)?;
            }

            let head = block_offset_at(addr);
            let diff = (BLOCK_SIZE - head).min(buf.len());

            page.ld(block_bits(head, diff), frame);

            let (chunk, rest) = std::mem::take(&mut buf).split_at_mut(diff);
            unsafe {
                std::ptr::copy_nonoverlapping(page.buffer().add(head), chunk.as_mut_ptr(), diff)
            };

            addr += diff;
            buf = rest;
        }

        Ok(())
    }

    /// Stores `buf` at `addr`. In write-back mode the bytes stay in the
    /// page buffers until [`apply`](Self::apply).
    pub fn st(&mut self, mut addr: usize, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let block_index = block_index_at(addr);
            let frame = self.frame(block_index)?;

            // locks are released as part of finish()
            let page = self.acquire_page(block_index)?;
            if !page.has_wrlocked_frame() {
                page.try_wrlock_frame(frame)?;
                // the first write completes the buffer, so that commit can
                // flush it and privatization can swap it wholesale
                page.ld(BLOCK_FULL_MASK, frame);
            }

            let head = block_offset_at(addr);
            let diff = (BLOCK_SIZE - head).min(buf.len());

            let (chunk, rest) = buf.split_at(diff);
            unsafe { std::ptr::copy_nonoverlapping(chunk.as_ptr(), page.buffer().add(head), diff) };
            page.mark_written(block_bits(head, diff));

            addr += diff;
            buf = rest;
        }

        Ok(())
    }

    /// Copies `siz` bytes from `laddr` to `saddr` within transactional
    /// memory, chunk by chunk, so that overlapping regions serialize
    /// correctly.
    pub fn ldst(&mut self, mut laddr: usize, mut saddr: usize, mut siz: usize) -> Result<()> {
        while siz > 0 {
            let lblock = block_index_at(laddr);
            let lframe = self.frame(lblock)?;
            let lhead = block_offset_at(laddr);

            let sblock = block_index_at(saddr);
            let sframe = self.frame(sblock)?;
            let shead = block_offset_at(saddr);

            let diff = siz.min(BLOCK_SIZE - lhead).min(BLOCK_SIZE - shead);

            // load side: reader role and valid bytes
            let lpage = self.acquire_page(lblock)?;
            if !lpage.has_rdlocked_frame() {
                lpage.try_rdlock_frame(lframe)?;
            }
            lpage.ld(block_bits(lhead, diff), lframe);
            let lptr = unsafe { lpage.buffer().add(lhead) } as *const u8;

            // store side: writer role and a complete buffer
            let spage = self.acquire_page(sblock)?;
            if !spage.has_wrlocked_frame() {
                spage.try_wrlock_frame(sframe)?;
                spage.ld(BLOCK_FULL_MASK, sframe);
            }
            let sptr = unsafe { spage.buffer().add(shead) };
            spage.mark_written(block_bits(shead, diff));

            // the regions may alias when both addresses share a block
            unsafe { std::ptr::copy(lptr, sptr, diff) };

            laddr += diff;
            saddr += diff;
            siz -= diff;
        }

        Ok(())
    }

    /// Switches one page to write-through mode, capturing the pre-image
    /// and putting staged writes in place.
    fn privatize_page(page: &mut Page, frame: &Frame) -> Result<()> {
        if !page.has_wrlocked_frame() {
            page.try_wrlock_frame(frame)?;
            page.ld(BLOCK_FULL_MASK, frame);
            page.set_write_through();
        } else if !page.is_write_through() {
            // the buffer holds the tentative state; swap it against live
            // memory so the buffer keeps the pre-image instead
            if page.is_written() {
                page.xchg(BLOCK_FULL_MASK, frame);
            }
            page.set_write_through();
        }

        Ok(())
    }

    /// Privatizes `[addr, addr + siz)`: the region becomes exclusively
    /// owned by this transaction and is accessed in place for the rest of
    /// the transaction.
    pub fn privatize(&mut self, mut addr: usize, mut siz: usize, flags: Privatize) -> Result<()> {
        while siz > 0 {
            let block_index = block_index_at(addr);
            let frame = self.frame(block_index)?;

            let page = self.acquire_page(block_index)?;
            Self::privatize_page(page, frame)?;

            if flags.contains(Privatize::STORE) {
                // rollback must restore the whole pre-image
                page.mark_written(BLOCK_FULL_MASK);
            }

            let head = block_offset_at(addr);
            let diff = (BLOCK_SIZE - head).min(siz);

            addr += diff;
            siz -= diff;
        }

        Ok(())
    }

    /// Privatizes the region from `addr` up to and including the first
    /// byte equal to `c`.
    pub fn privatize_c(&mut self, mut addr: usize, c: u8, flags: Privatize) -> Result<()> {
        loop {
            let block_index = block_index_at(addr);
            let frame = self.frame(block_index)?;

            let page = self.acquire_page(block_index)?;
            Self::privatize_page(page, frame)?;

            if flags.contains(Privatize::STORE) {
                page.mark_written(BLOCK_FULL_MASK);
            }

            let head = block_offset_at(addr);
            let diff = BLOCK_SIZE - head;

            // look for the terminator in the privatized chunk
            let found = {
                let chunk =
                    unsafe { std::slice::from_raw_parts(page.buffer().add(head) as *const u8, diff) };
                chunk.contains(&c)
            };
            if found {
                return Ok(());
            }

            addr += diff;
        }
    }

    /// The commit pass: flushes written write-back pages into their
    /// frames. Write-through pages have nothing to do; their writes are
    /// already live.
    pub fn apply(&mut self) -> Result<()> {
        let vmem = self.vmem;
        let mut failure = None;

        self.active_pages.walk_mut(|page| {
            if failure.is_some() || !page.is_written() || page.is_write_through() {
                return;
            }

            match vmem.acquire_frame_by_block(page.block_index()) {
                Ok(frame) => page.st(page.written_bits(), frame),
                Err(err) => failure = Some(err.into_non_recoverable()),
            }
        });

        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// The rollback pass: restores the pre-image of written write-through
    /// pages. Write-back pages just discard their buffers.
    pub fn undo(&mut self) -> Result<()> {
        let vmem = self.vmem;
        let mut failure = None;

        self.active_pages.walk_mut(|page| {
            if failure.is_some() || !page.is_written() || !page.is_write_through() {
                return;
            }

            match vmem.acquire_frame_by_block(page.block_index()) {
                Ok(frame) => page.st(BLOCK_FULL_MASK, frame),
                Err(err) => failure = Some(err.into_non_recoverable()),
            }
        });

        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    /// Releases every page's frame lock and recycles the pages. Runs at
    /// the end of the transaction, on both the commit and rollback path.
    pub fn finish(&mut self) -> Result<()> {
        trace!("TM({}): FINISH, {} PAGES", self.module, self.active_pages.len());

        let vmem = self.vmem;
        let active = &mut self.active_pages;
        let alloced = &mut self.alloced_pages;
        let mut failure = None;

        active.cleanup(|mut page| {
            if page.has_locked_frame() {
                match vmem.acquire_frame_by_block(page.block_index()) {
                    Ok(frame) => page.unlock_frame(frame),
                    Err(err) => {
                        if failure.is_none() {
                            failure = Some(err.into_non_recoverable());
                        }
                    }
                }
            }
            alloced.enqueue_front(page);
        });

        match failure {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}
