//! A pre-allocated batch of dbus scans, queued to the probe as a unit and
//! harvested positionally.
//!
//! Every queued scan carries its own run-test/idle padding computed from
//! the adaptive delay counters at queue time, so a batch built after a
//! delay bump is automatically slower.

use crate::cache::{jump_to_resume, load_slot_op, store_slot_op, Slot};
use crate::dbus::{
    pack_dbus_scan, unpack_dbus_scan, DbusOp, DbusResponse, DBUS, DMCONTROL_HALTNOT,
    DMCONTROL_INTERRUPT,
};
use crate::probe::JtagWriteCommand;

#[derive(Debug)]
pub(crate) struct ScanBatch {
    commands: Vec<JtagWriteCommand>,
    results: Vec<Vec<u8>>,
    scan_size: usize,
    capacity: usize,
    addrbits: u8,
    xlen: u32,
    dramsize: usize,
    idle_base: u8,
    interrupt_idle: u8,
}

impl ScanBatch {
    pub fn new(
        capacity: usize,
        addrbits: u8,
        xlen: u32,
        dramsize: usize,
        dbus_busy_delay: u32,
        interrupt_high_delay: u32,
    ) -> Self {
        ScanBatch {
            commands: Vec::with_capacity(capacity),
            results: Vec::new(),
            scan_size: 2 + xlen as usize / 8,
            capacity,
            addrbits,
            xlen,
            dramsize,
            idle_base: 1u32.saturating_add(dbus_busy_delay).min(u8::MAX as u32) as u8,
            interrupt_idle: interrupt_high_delay.min(u8::MAX as u32) as u8,
        }
    }

    /// Drop all queued scans and results, picking up the current delay
    /// counters for the next fill.
    pub fn reset(&mut self, dbus_busy_delay: u32, interrupt_high_delay: u32) {
        self.commands.clear();
        self.results.clear();
        self.idle_base = 1u32.saturating_add(dbus_busy_delay).min(u8::MAX as u32) as u8;
        self.interrupt_idle = interrupt_high_delay.min(u8::MAX as u32) as u8;
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn commands(&self) -> &[JtagWriteCommand] {
        &self.commands
    }

    pub fn set_results(&mut self, results: Vec<Vec<u8>>) {
        self.results = results;
    }

    fn add_scan(&mut self, op: DbusOp, address: u16, data: u64) {
        debug_assert!(self.commands.len() < self.capacity);
        tracing::debug!("op={:?} address={:#04x} data={:#011x}", op, address, data);

        let mut out = vec![0u8; self.scan_size];
        pack_dbus_scan(&mut out, op, data, address, self.addrbits);

        let mut idle_cycles = self.idle_base;
        if data & DMCONTROL_INTERRUPT != 0 {
            idle_cycles = idle_cycles.saturating_add(self.interrupt_idle);
        }

        self.commands.push(JtagWriteCommand {
            address: DBUS,
            data: out,
            len: self.addrbits as u32 + 36,
            idle_cycles,
        });
    }

    pub fn add_write32(&mut self, address: u16, data: u32, set_interrupt: bool) {
        let interrupt = if set_interrupt { DMCONTROL_INTERRUPT } else { 0 };
        self.add_scan(
            DbusOp::Write,
            address,
            interrupt | DMCONTROL_HALTNOT | data as u64,
        );
    }

    /// Queue a write of the jump-back-to-ROM terminator at `address`.
    pub fn add_write_jump(&mut self, address: u16, set_interrupt: bool) {
        self.add_write32(address, jump_to_resume(address as usize), set_interrupt);
    }

    pub fn add_write_load(&mut self, address: u16, reg: u32, slot: Slot, set_interrupt: bool) {
        let op = load_slot_op(self.xlen, self.dramsize, reg, slot);
        self.add_write32(address, op, set_interrupt);
    }

    pub fn add_write_store(&mut self, address: u16, reg: u32, slot: Slot, set_interrupt: bool) {
        let op = store_slot_op(self.xlen, self.dramsize, reg, slot);
        self.add_write32(address, op, set_interrupt);
    }

    pub fn add_read32(&mut self, address: u16, set_interrupt: bool) {
        let interrupt = if set_interrupt { DMCONTROL_INTERRUPT } else { 0 };
        self.add_scan(DbusOp::Read, address, interrupt | DMCONTROL_HALTNOT);
    }

    /// Queue a read of a whole slot; on 64-bit harts this is two scans of
    /// consecutive words with the interrupt flag on the last.
    pub fn add_read(&mut self, slot: Slot, set_interrupt: bool) {
        let offset = crate::cache::slot_offset(self.xlen, self.dramsize, slot) as u16;
        match self.xlen {
            32 => self.add_read32(offset, set_interrupt),
            _ => {
                self.add_read32(offset, false);
                self.add_read32(offset + 1, set_interrupt);
            }
        }
    }

    pub fn get_u32(&self, index: usize, first: usize, num: usize) -> u32 {
        crate::dbus::buf_get(&self.results[index], first, num) as u32
    }

    pub fn get_u64(&self, index: usize, first: usize, num: usize) -> u64 {
        crate::dbus::buf_get(&self.results[index], first, num)
    }

    pub fn response(&self, index: usize) -> DbusResponse {
        unpack_dbus_scan(&self.results[index], self.addrbits)
    }
}
