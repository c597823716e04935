//! Shadow of the Debug Module's instruction RAM.
//!
//! The cache keeps one line per 32-bit RAM word with valid/dirty tracking;
//! flushing it to the target (and optionally running the staged program)
//! is the transport's business, see
//! [`RiscvCommunicationInterface::cache_write`](crate::RiscvCommunicationInterface).

use crate::dbus::{DEBUG_RAM_START, DEBUG_ROM_RESUME};

/// Number of cache lines. Debug RAM may be larger; words beyond the cache
/// are accessed uncached.
pub(crate) const DRAM_CACHE_SIZE: usize = 16;

/// An xlen-agnostic name for a data word in Debug RAM used to pass values
/// in and out of snippets.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Slot {
    Slot0,
    Slot1,
    Last,
}

/// Map a slot to its Debug RAM word index.
///
/// The last word doubles as the exception-code slot written by the debug
/// ROM; on 64-bit harts slots occupy two consecutive words.
pub(crate) fn slot_offset(xlen: u32, dramsize: usize, slot: Slot) -> usize {
    match (xlen, slot) {
        (32, Slot::Slot0) => 4,
        (32, Slot::Slot1) => 5,
        (32, Slot::Last) => dramsize - 1,
        (64, Slot::Slot0) => 4,
        (64, Slot::Slot1) => 6,
        (64, Slot::Last) => dramsize - 2,
        _ => unreachable!("no slot layout for xlen {xlen}"),
    }
}

/// Debug bus address of Debug RAM word `index`. The first 16 words live at
/// the start of the address space; the rest are remapped above the DM
/// registers.
pub(crate) fn dram_address(index: usize) -> u16 {
    if index < 0x10 {
        index as u16
    } else {
        (0x40 + index - 0x10) as u16
    }
}

/// A `jal x0` from Debug RAM word `index` back to the debug ROM resume
/// entry.
pub(crate) fn jump_to_resume(index: usize) -> u32 {
    crate::assembly::jal(
        0,
        DEBUG_ROM_RESUME - (DEBUG_RAM_START + 4 * index as u32),
    )
}

/// An xlen-sized load of `reg` from a slot, `lw` or `ld` as appropriate.
pub(crate) fn load_slot_op(xlen: u32, dramsize: usize, reg: u32, slot: Slot) -> u32 {
    let offset = DEBUG_RAM_START + 4 * slot_offset(xlen, dramsize, slot) as u32;
    match xlen {
        32 => crate::assembly::lw(reg, crate::assembly::ZERO, offset),
        _ => crate::assembly::ld(reg, crate::assembly::ZERO, offset),
    }
}

/// An xlen-sized store of `reg` to a slot, `sw` or `sd` as appropriate.
pub(crate) fn store_slot_op(xlen: u32, dramsize: usize, reg: u32, slot: Slot) -> u32 {
    let offset = DEBUG_RAM_START + 4 * slot_offset(xlen, dramsize, slot) as u32;
    match xlen {
        32 => crate::assembly::sw(reg, crate::assembly::ZERO, offset),
        _ => crate::assembly::sd(reg, crate::assembly::ZERO, offset),
    }
}

#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct CacheLine {
    pub data: u32,
    pub valid: bool,
    pub dirty: bool,
}

#[derive(Debug)]
pub(crate) struct DramCache {
    lines: [CacheLine; DRAM_CACHE_SIZE],
}

impl DramCache {
    pub fn new() -> Self {
        DramCache {
            lines: [CacheLine::default(); DRAM_CACHE_SIZE],
        }
    }

    pub fn line(&self, index: usize) -> &CacheLine {
        &self.lines[index]
    }

    pub fn set32(&mut self, index: usize, data: u32) {
        tracing::debug!("cache[{:#x}] = {:#010x}", index, data);
        self.lines[index] = CacheLine {
            data,
            valid: true,
            dirty: true,
        };
    }

    pub fn fill(&mut self, index: usize, data: u32) {
        self.lines[index] = CacheLine {
            data,
            valid: true,
            dirty: false,
        };
    }

    /// Index of the highest dirty line, if any.
    pub fn last_dirty(&self) -> Option<usize> {
        (0..DRAM_CACHE_SIZE).rev().find(|&i| self.lines[i].dirty)
    }

    pub fn dirty_lines(&self) -> impl Iterator<Item = (usize, u32)> + '_ {
        self.lines
            .iter()
            .enumerate()
            .filter(|(_, l)| l.dirty)
            .map(|(i, l)| (i, l.data))
    }

    pub fn invalidate(&mut self) {
        for line in &mut self.lines {
            line.valid = false;
            line.dirty = false;
        }
    }

    /// Mark everything clean after a flush. A program run may have mutated
    /// any word from 4 up, so those lines are dropped too.
    pub fn clean(&mut self, ran: bool) {
        for (i, line) in self.lines.iter_mut().enumerate() {
            if ran && i >= 4 {
                line.valid = false;
            }
            line.dirty = false;
        }
    }
}
