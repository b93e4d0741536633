// Copyright 2020-2022 IOTA Stiftung
// SPDX-License-Identifier: Apache-2.0

//! # Event Log
//!
//! Each transaction owns one [`EventLog`], an append-only sequence of
//! module events. An event names its module, a module-defined opcode in
//! `head` and an argument word in `tail`; the word is either an immediate
//! value or an index into the module's own argument storage. The log is
//! replayed front to back on commit and back to front on rollback.

/// One logged module event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    /// Index of the module that owns the event.
    pub module: usize,

    /// Module-defined opcode.
    pub head: u16,

    /// Immediate argument, or an index into module-local argument storage.
    pub tail: usize,
}

/// The transaction's append-only event sequence.
#[derive(Default)]
pub struct EventLog {
    events: Vec<Event>,
}

impl EventLog {
    pub const fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub fn append(&mut self, module: usize, head: u16, tail: usize) {
        self.events.push(Event { module, head, tail });
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Events in append order, for the apply pass.
    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    /// Events in reverse order, for the undo pass.
    pub fn iter_rev(&self) -> impl Iterator<Item = &Event> {
        self.events.iter().rev()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}
