// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Pages
//!
//! A [`Page`] is one transaction's private shadow of a block. The global
//! counterpart is the [`Frame`](crate::frame::Frame). In write-back mode,
//! the default, loads fill the page buffer from the block and stores land
//! in the buffer, to be flushed on commit. A privatized page switches to
//! write-through mode: accesses go straight to the block's live memory and
//! the buffer keeps the pre-image for rollback.
//!
//! A page tracks per byte which buffer bytes are valid and which have been
//! written, one bitmap bit per byte.

use stronghold_tx::{error::Result, rwstate::RwState};

use crate::{
    block::{block_address, BLOCK_BITS, BLOCK_FULL_MASK, BLOCK_SIZE},
    frame::Frame,
};

const FLAG_WRITE_THROUGH: usize = 1 << 0;

/// Transaction-local state of one block of memory.
pub struct Page {
    /// Block index and flag bits.
    flags: usize,

    /// Lock state wrt. the frame's lock.
    rwstate: RwState,

    /// Transaction-local buffer: staged writes in write-back mode, the
    /// pre-image in write-through mode.
    buf: [u8; BLOCK_SIZE],

    /// Bitmap of the valid bytes in `buf`.
    valid_bits: u8,

    /// Bitmap of the bytes written by this transaction.
    written_bits: u8,
}

impl Page {
    pub fn new(block_index: usize) -> Self {
        Self {
            flags: block_index << BLOCK_BITS,
            rwstate: RwState::new(),
            buf: [0; BLOCK_SIZE],
            valid_bits: 0,
            written_bits: 0,
        }
    }

    /// Re-initializes a recycled page for another block.
    pub fn reset(&mut self, block_index: usize) {
        debug_assert!(!self.has_locked_frame());

        self.flags = block_index << BLOCK_BITS;
        self.buf = [0; BLOCK_SIZE];
        self.valid_bits = 0;
        self.written_bits = 0;
    }

    pub fn block_index(&self) -> usize {
        self.flags >> BLOCK_BITS
    }

    pub fn address(&self) -> usize {
        block_address(self.block_index())
    }

    /// The buffer the transaction reads and writes: the block's live
    /// memory in write-through mode, the shadow buffer otherwise.
    pub fn buffer(&mut self) -> *mut u8 {
        if self.is_write_through() {
            return self.address() as *mut u8;
        }
        self.buf.as_mut_ptr()
    }

    pub fn is_write_through(&self) -> bool {
        self.flags & FLAG_WRITE_THROUGH != 0
    }

    pub fn set_write_through(&mut self) {
        self.flags |= FLAG_WRITE_THROUGH;
    }

    pub fn valid_bits(&self) -> u8 {
        self.valid_bits
    }

    pub fn is_complete(&self) -> bool {
        self.valid_bits == BLOCK_FULL_MASK
    }

    pub fn written_bits(&self) -> u8 {
        self.written_bits
    }

    pub fn is_written(&self) -> bool {
        self.written_bits != 0
    }

    pub fn mark_written(&mut self, bits: u8) {
        self.written_bits |= bits;
    }

    /// Copies the requested bytes from the frame's memory into the page
    /// buffer. Bytes that are already valid are left untouched.
    pub fn ld(&mut self, bits: u8, frame: &Frame) {
        debug_assert_eq!(self.block_index(), frame.block_index());
        debug_assert!(self.rwstate.is_rdlocked());

        let missing = bits & !self.valid_bits;
        if missing == 0 {
            return;
        }

        let mem = frame.buffer();

        if missing == BLOCK_FULL_MASK {
            unsafe { std::ptr::copy_nonoverlapping(mem, self.buf.as_mut_ptr(), BLOCK_SIZE) };
        } else {
            for (i, byte) in self.buf.iter_mut().enumerate() {
                if missing & (1 << i) != 0 {
                    *byte = unsafe { mem.add(i).read() };
                }
            }
        }

        self.valid_bits |= bits;
    }

    /// Fills the page buffer like [`ld`](Self::ld), byte by byte, stopping
    /// after the first byte equal to `c`. Returns true if the terminator
    /// was found within the requested bytes.
    pub fn ld_c(&mut self, bits: u8, c: u8, frame: &Frame) -> bool {
        debug_assert_eq!(self.block_index(), frame.block_index());
        debug_assert!(self.rwstate.is_rdlocked());

        let mem = frame.buffer();

        for i in 0..BLOCK_SIZE {
            let bit = 1u8 << i;

            if bits & bit != 0 && self.valid_bits & bit == 0 {
                self.buf[i] = unsafe { mem.add(i).read() };
                self.valid_bits |= bit;
            }
            if self.valid_bits & bit != 0 && self.buf[i] == c {
                return true;
            }
        }

        false
    }

    /// Copies the requested valid bytes from the page buffer into the
    /// frame's memory.
    pub fn st(&self, bits: u8, frame: &Frame) {
        debug_assert_eq!(self.block_index(), frame.block_index());
        debug_assert!(self.rwstate.is_wrlocked());

        let bits = bits & self.valid_bits;
        let mem = frame.buffer();

        if bits == BLOCK_FULL_MASK {
            unsafe { std::ptr::copy_nonoverlapping(self.buf.as_ptr(), mem, BLOCK_SIZE) };
        } else {
            for (i, byte) in self.buf.iter().enumerate() {
                if bits & (1 << i) != 0 {
                    unsafe { mem.add(i).write(*byte) };
                }
            }
        }
    }

    /// Swaps the requested valid bytes between the page buffer and the
    /// frame's memory. Used by privatization to put staged writes in
    /// place while keeping the pre-image for rollback.
    pub fn xchg(&mut self, bits: u8, frame: &Frame) {
        debug_assert_eq!(self.block_index(), frame.block_index());
        debug_assert!(self.rwstate.is_wrlocked());

        let bits = bits & self.valid_bits;
        let mem = frame.buffer();

        for i in 0..BLOCK_SIZE {
            if bits & (1 << i) != 0 {
                let live = unsafe { mem.add(i).read() };
                unsafe { mem.add(i).write(self.buf[i]) };
                self.buf[i] = live;
            }
        }
    }

    pub fn has_locked_frame(&self) -> bool {
        self.rwstate.is_rdlocked()
    }

    /// A writer role counts as an implicit reader role.
    pub fn has_rdlocked_frame(&self) -> bool {
        self.rwstate.is_rdlocked()
    }

    pub fn has_wrlocked_frame(&self) -> bool {
        self.rwstate.is_wrlocked()
    }

    pub fn try_rdlock_frame(&mut self, frame: &Frame) -> Result<()> {
        frame.try_rdlock(&mut self.rwstate)
    }

    pub fn try_wrlock_frame(&mut self, frame: &Frame) -> Result<()> {
        frame.try_wrlock(&mut self.rwstate)
    }

    pub fn unlock_frame(&mut self, frame: &Frame) {
        frame.unlock(&mut self.rwstate);
    }
}

#[cfg(test)]
mod tests {
    use super::Page;
    use crate::{
        block::{block_index_at, BLOCK_FULL_MASK, BLOCK_SIZE},
        frame::Frame,
    };

    /// One block's worth of memory, aligned to a block boundary.
    #[repr(align(8))]
    struct Block([u8; BLOCK_SIZE]);

    fn frame_for(mem: &Block) -> Frame {
        Frame::new(block_index_at(mem.0.as_ptr() as usize))
    }

    fn live(frame: &Frame) -> &[u8] {
        unsafe { std::slice::from_raw_parts(frame.buffer(), BLOCK_SIZE) }
    }

    #[test]
    fn test_ld_fills_only_missing_bytes() {
        let mem = Block([1, 2, 3, 4, 5, 6, 7, 8]);
        let frame = frame_for(&mem);
        let mut page = Page::new(frame.block_index());

        page.try_rdlock_frame(&frame).expect("Failed to rdlock");

        page.ld(0b0000_1111, &frame);
        assert_eq!(page.valid_bits(), 0b0000_1111);
        assert_eq!(&page.buf[..4], &[1, 2, 3, 4]);

        // already-valid bytes stay as they are
        page.buf[0] = 0xaa;
        page.ld(BLOCK_FULL_MASK, &frame);
        assert!(page.is_complete());
        assert_eq!(page.buf, [0xaa, 2, 3, 4, 5, 6, 7, 8]);

        page.unlock_frame(&frame);
    }

    #[test]
    fn test_st_flushes_written_bytes() {
        let mem = Block([0; BLOCK_SIZE]);
        let frame = frame_for(&mem);
        let mut page = Page::new(frame.block_index());

        page.try_wrlock_frame(&frame).expect("Failed to wrlock");
        page.ld(BLOCK_FULL_MASK, &frame);

        page.buf[1] = 0x11;
        page.buf[3] = 0x33;
        page.st(0b0000_1010, &frame);

        assert_eq!(live(&frame), &[0, 0x11, 0, 0x33, 0, 0, 0, 0]);

        page.unlock_frame(&frame);
    }

    #[test]
    fn test_xchg_swaps_buffer_and_memory() {
        let mem = Block([9; BLOCK_SIZE]);
        let frame = frame_for(&mem);
        let mut page = Page::new(frame.block_index());

        page.try_wrlock_frame(&frame).expect("Failed to wrlock");
        page.ld(BLOCK_FULL_MASK, &frame);
        page.buf = [1, 2, 3, 4, 5, 6, 7, 8];

        page.xchg(BLOCK_FULL_MASK, &frame);

        assert_eq!(page.buf, [9; BLOCK_SIZE]);
        assert_eq!(live(&frame), &[1, 2, 3, 4, 5, 6, 7, 8]);

        page.unlock_frame(&frame);
    }

    #[test]
    fn test_ld_c_stops_at_terminator() {
        let mem = Block([b'a', b'b', 0, b'c', b'd', b'e', b'f', b'g']);
        let frame = frame_for(&mem);
        let mut page = Page::new(frame.block_index());

        page.try_rdlock_frame(&frame).expect("Failed to rdlock");

        assert!(page.ld_c(BLOCK_FULL_MASK, 0, &frame));
        // bytes past the terminator were not copied
        assert_eq!(page.valid_bits(), 0b0000_0111);

        page.unlock_frame(&frame);
    }

    #[test]
    fn test_write_through_buffer_is_live_memory() {
        let mem = Block([0; BLOCK_SIZE]);
        let frame = frame_for(&mem);
        let mut page = Page::new(frame.block_index());

        assert_eq!(page.buffer(), page.buf.as_mut_ptr());

        page.set_write_through();
        assert!(page.is_write_through());
        assert_eq!(page.buffer() as usize, page.address());
        assert_eq!(page.address(), mem.0.as_ptr() as usize);
    }
}
