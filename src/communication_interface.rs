//! Debug bus communication with a Debug Module.
//!
//! Since almost everything is accomplished by scanning the dbus register,
//! all functions here assume the bus is already selected; the probe
//! re-selects IR as needed when a different register is addressed.
//!
//! Two quirks of the bus shape everything in this module:
//!
//! * The DM pipelines reads by one: the data for a read arrives in the
//!   *next* scan, so single reads loop until the echoed address matches
//!   and batches discard their first harvested result.
//! * Any scan can come back BUSY. The driver reacts by growing two idle
//!   counters (`dbus_busy_delay`, `interrupt_high_delay`) that are never
//!   decayed or capped; they converge on the worst case for the board.

use std::time::{Duration, Instant};

use crate::assembly::{self, S0, S1, ZERO};
use crate::cache::{
    dram_address, jump_to_resume, load_slot_op, store_slot_op, DramCache, Slot, DRAM_CACHE_SIZE,
};
use crate::dbus::{
    buf_get, pack_dbus_scan, unpack_dbus_scan, DbusOp, DbusResponse, DbusStatus, Dminfo, Dtminfo,
    DBUS, DBUS_DATA_SIZE, DBUS_DATA_START, DMCONTROL, DMCONTROL_HALTNOT, DMCONTROL_INTERRUPT,
    DMINFO, DEBUG_RAM_START, DTMINFO, DTMINFO_WIDTH,
};
use crate::error::RiscvError;
use crate::probe::JtagAccess;
use crate::registers::{Dcsr, CSR_DCSR, CSR_DPC, CSR_DSCRATCH, CSR_MISA, CSR_TSELECT};
use crate::scans::ScanBatch;
use crate::triggers::MAX_HWBPS;

/// Wall-clock bound for every wait loop.
pub(crate) const RISCV_TIMEOUT: Duration = Duration::from_secs(2);

/// Passing this as the read-back address to [`cache_write`] suppresses the
/// trailing read scans.
pub(crate) const CACHE_NO_READ: u16 = 128;

/// Poison value for the GPR cache while the hart is running.
const GPR_POISON: u64 = 0xbadbad;

/// Outcome of a harvested batch that may need to be retried with larger
/// delays.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum Harvest {
    Complete,
    Retry,
}

/// The `haltnot` and `interrupt` latches of the DM.
#[derive(Debug, Copy, Clone)]
pub(crate) struct DebugBits {
    pub haltnot: bool,
    pub interrupt: bool,
}

#[derive(Debug)]
pub(crate) struct RiscvSessionState {
    /// Number of address bits in the dbus register.
    pub addrbits: u8,
    /// Width of a GPR (and many other things) in bits.
    pub xlen: u32,
    /// Number of 32-bit words in Debug RAM.
    pub dramsize: usize,
    pub dcsr: Dcsr,
    pub dpc: u64,
    pub misa: u64,
    pub tselect: u64,
    /// True when the hardware `tselect` may differ from the shadow.
    pub tselect_dirty: bool,

    pub dram_cache: DramCache,

    /// Write-through GPR shadow, only meaningful while the target is
    /// halted and the bulk drain has run.
    pub gpr_cache: [u64; 32],

    /// Owner of each physical trigger slot.
    pub trigger_unique_id: [Option<u32>; MAX_HWBPS],

    /// Incremented every time a dbus access comes back BUSY; sets how many
    /// run-test/idle cycles to feed the target between accesses.
    pub dbus_busy_delay: u32,

    /// Incremented every time the debug interrupt is still high at harvest
    /// time; adds idle cycles after scans that set the interrupt.
    pub interrupt_high_delay: u32,

    pub need_strict_step: bool,
}

impl RiscvSessionState {
    fn new() -> Self {
        RiscvSessionState {
            addrbits: 0,
            xlen: 32,
            dramsize: DRAM_CACHE_SIZE,
            dcsr: Dcsr(0),
            dpc: 0,
            misa: 0,
            tselect: 0,
            tselect_dirty: false,
            dram_cache: DramCache::new(),
            gpr_cache: [0; 32],
            trigger_unique_id: [None; MAX_HWBPS],
            dbus_busy_delay: 0,
            interrupt_high_delay: 0,
            need_strict_step: false,
        }
    }
}

/// One debug session against a single hart.
pub struct RiscvCommunicationInterface {
    probe: Box<dyn JtagAccess>,
    pub(crate) state: RiscvSessionState,
}

impl RiscvCommunicationInterface {
    pub fn new(probe: Box<dyn JtagAccess>) -> Self {
        RiscvCommunicationInterface {
            probe,
            state: RiscvSessionState::new(),
        }
    }

    pub(crate) fn state(&self) -> &RiscvSessionState {
        &self.state
    }

    pub(crate) fn state_mut(&mut self) -> &mut RiscvSessionState {
        &mut self.state
    }

    pub(crate) fn dramsize(&self) -> usize {
        self.state.dramsize
    }

    pub fn xlen(&self) -> u32 {
        self.state.xlen
    }

    pub(crate) fn increase_dbus_busy_delay(&mut self) {
        self.state.dbus_busy_delay += 1;
        tracing::info!(
            "increment dbus_busy_delay to {}",
            self.state.dbus_busy_delay
        );
    }

    pub(crate) fn increase_interrupt_high_delay(&mut self) {
        self.state.interrupt_high_delay += 1;
        tracing::info!(
            "increment interrupt_high_delay to {}",
            self.state.interrupt_high_delay
        );
    }

    pub(crate) fn new_batch(&self, capacity: usize) -> ScanBatch {
        ScanBatch::new(
            capacity,
            self.state.addrbits,
            self.state.xlen,
            self.state.dramsize,
            self.state.dbus_busy_delay,
            self.state.interrupt_high_delay,
        )
    }

    pub(crate) fn execute_batch(&mut self, scans: &mut ScanBatch) -> Result<(), RiscvError> {
        let results = self.probe.write_register_batch(scans.commands())?;
        scans.set_results(results);
        Ok(())
    }

    /*** Single-scan transport. ***/

    fn dbus_scan(
        &mut self,
        op: DbusOp,
        address_out: u16,
        data_out: u64,
    ) -> Result<DbusResponse, RiscvError> {
        debug_assert!(self.state.addrbits != 0);

        let mut out = [0u8; 8];
        pack_dbus_scan(&mut out, op, data_out, address_out, self.state.addrbits);

        let mut idle = 1 + self.state.dbus_busy_delay;
        if data_out & DMCONTROL_INTERRUPT != 0 {
            idle += self.state.interrupt_high_delay;
        }
        self.probe.set_idle_cycles(idle.min(u8::MAX as u32) as u8);

        let num_bits = self.state.addrbits as u32 + 36;
        let in_value = self.probe.write_register(DBUS, &out, num_bits)?;
        let resp = unpack_dbus_scan(&in_value, self.state.addrbits);

        static OP_STRING: [&str; 4] = ["nop", "r", "w", "?"];
        static STATUS_STRING: [&str; 4] = ["+", "?", "F", "b"];
        tracing::debug!(
            "dbus scan {}b {} {:09x} @{:02x} -> {} {:09x} @{:02x}",
            num_bits,
            OP_STRING[op as usize],
            data_out,
            address_out,
            STATUS_STRING[resp.status as usize & 3],
            resp.data,
            resp.address
        );

        Ok(resp)
    }

    /// Read one dbus word. The DM pipelines reads by one, so this loops
    /// until the echoed address matches the request.
    pub(crate) fn dbus_read(&mut self, address: u16) -> Result<u64, RiscvError> {
        let start = Instant::now();
        loop {
            let resp = self.dbus_scan(DbusOp::Read, address, 0)?;
            if resp.status != DbusStatus::Busy as u8 && resp.address == address {
                return Ok(resp.data);
            }
            if start.elapsed() > RISCV_TIMEOUT {
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Write one dbus word, retrying while the bus is busy. A FAILED
    /// status is logged but not retried.
    pub(crate) fn dbus_write(&mut self, address: u16, value: u64) -> Result<(), RiscvError> {
        let start = Instant::now();
        let mut status = DbusStatus::Busy as u8;
        while status == DbusStatus::Busy as u8 {
            status = self.dbus_scan(DbusOp::Write, address, value)?.status;
            if start.elapsed() > RISCV_TIMEOUT {
                return Err(RiscvError::Timeout);
            }
        }
        if status != DbusStatus::Success as u8 {
            tracing::error!(
                "dbus_write failed write {:#x} to {:#x}; status={}",
                value,
                address,
                status
            );
        }
        Ok(())
    }

    /// Read the `haltnot` and `interrupt` latches, skipping stale pipeline
    /// responses.
    pub(crate) fn read_bits(&mut self) -> Result<DebugBits, RiscvError> {
        let start = Instant::now();
        let value = loop {
            let resp = self.dbus_scan(DbusOp::Read, 0, 0)?;
            if resp.status != DbusStatus::Busy as u8
                && !(resp.address > 0x10 && resp.address != DMCONTROL)
            {
                break resp.data;
            }
            if start.elapsed() > RISCV_TIMEOUT {
                return Err(RiscvError::Timeout);
            }
        };

        Ok(DebugBits {
            haltnot: value & DMCONTROL_HALTNOT != 0,
            interrupt: value & DMCONTROL_INTERRUPT != 0,
        })
    }

    /// Poll until the debug interrupt clears. If `ignore_first`, one
    /// sample is discarded first: it carries the state from just before
    /// the interrupt was set.
    pub(crate) fn wait_for_debugint_clear(&mut self, ignore_first: bool) -> Result<(), RiscvError> {
        let start = Instant::now();
        if ignore_first {
            self.read_bits()?;
        }
        loop {
            let bits = self.read_bits()?;
            if !bits.interrupt {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("timed out waiting for debug int to clear");
                return Err(RiscvError::DebugInterruptStuck);
            }
        }
    }

    /*** Debug RAM access. ***/

    pub(crate) fn dram_read32(&mut self, index: usize) -> Result<u32, RiscvError> {
        Ok(self.dbus_read(dram_address(index))? as u32)
    }

    pub(crate) fn dram_write32(
        &mut self,
        index: usize,
        value: u32,
        set_interrupt: bool,
    ) -> Result<(), RiscvError> {
        let mut dbus_value = DMCONTROL_HALTNOT | value as u64;
        if set_interrupt {
            dbus_value |= DMCONTROL_INTERRUPT;
        }
        self.dbus_write(dram_address(index), dbus_value)
    }

    /// Write the instruction that jumps from Debug RAM word `index` back
    /// to the resume entry of the debug ROM.
    pub(crate) fn dram_write_jump(
        &mut self,
        index: usize,
        set_interrupt: bool,
    ) -> Result<(), RiscvError> {
        self.dram_write32(index, jump_to_resume(index), set_interrupt)
    }

    fn dram_check32(&mut self, index: usize, expected: u32) -> Result<(), RiscvError> {
        let actual = self.dram_read32(index)?;
        if expected != actual {
            tracing::error!(
                "wrote {:#x} to Debug RAM at {}, but read back {:#x}",
                expected,
                index,
                actual
            );
            return Err(RiscvError::DramMismatch {
                index,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub(crate) fn dump_debug_ram(&mut self) {
        for i in 0..DRAM_CACHE_SIZE {
            match self.dram_read32(i) {
                Ok(value) => tracing::error!("Debug RAM {:#x}: {:#010x}", i, value),
                Err(e) => tracing::error!("Debug RAM {:#x}: <read failed: {}>", i, e),
            }
        }
    }

    /*** Debug RAM cache. ***/

    pub(crate) fn cache_set32(&mut self, index: usize, data: u32) {
        self.state.dram_cache.set32(index, data);
    }

    /// Stage an xlen-sized value into a slot, one or two words.
    pub(crate) fn cache_set(&mut self, slot: Slot, data: u64) {
        let offset = crate::cache::slot_offset(self.state.xlen, self.state.dramsize, slot);
        self.cache_set32(offset, data as u32);
        if self.state.xlen > 32 {
            self.cache_set32(offset + 1, (data >> 32) as u32);
        }
    }

    pub(crate) fn cache_set_jump(&mut self, index: usize) {
        self.cache_set32(index, jump_to_resume(index));
    }

    pub(crate) fn cache_set_load(&mut self, index: usize, reg: u32, slot: Slot) {
        let op = load_slot_op(self.state.xlen, self.state.dramsize, reg, slot);
        self.cache_set32(index, op);
    }

    pub(crate) fn cache_set_store(&mut self, index: usize, reg: u32, slot: Slot) {
        let op = store_slot_op(self.state.xlen, self.state.dramsize, reg, slot);
        self.cache_set32(index, op);
    }

    /// Read a cached RAM word, refilling the line on a miss. Words beyond
    /// the cache capacity are read uncached.
    pub(crate) fn cache_get32(&mut self, index: usize) -> Result<u32, RiscvError> {
        if index >= DRAM_CACHE_SIZE {
            return self.dram_read32(index);
        }
        if !self.state.dram_cache.line(index).valid {
            let data = self.dram_read32(index)?;
            self.state.dram_cache.fill(index, data);
        }
        Ok(self.state.dram_cache.line(index).data)
    }

    pub(crate) fn cache_get(&mut self, slot: Slot) -> Result<u64, RiscvError> {
        let offset = crate::cache::slot_offset(self.state.xlen, self.state.dramsize, slot);
        let mut value = self.cache_get32(offset)? as u64;
        if self.state.xlen > 32 {
            value |= (self.cache_get32(offset + 1)? as u64) << 32;
        }
        Ok(value)
    }

    pub(crate) fn cache_invalidate(&mut self) {
        self.state.dram_cache.invalidate();
    }

    /// Flush all dirty lines to the target in one batch, optionally
    /// kicking the hart into the staged program, then read back the word
    /// at `address` (unless it is [`CACHE_NO_READ`]).
    ///
    /// The fast path sets the interrupt on the last write only; on any
    /// BUSY it falls back to careful word-at-a-time writes followed by a
    /// wait for the interrupt to clear.
    pub(crate) fn cache_write(&mut self, address: u16, run: bool) -> Result<(), RiscvError> {
        tracing::debug!("cache_write(address={:#x}, run={})", address, run);

        let mut scans = self.new_batch(DRAM_CACHE_SIZE + 2);
        let last = self.state.dram_cache.last_dirty();

        match last {
            None => {
                // Nothing needs to be written to RAM.
                self.dbus_write(DMCONTROL, DMCONTROL_HALTNOT | DMCONTROL_INTERRUPT)?;
            }
            Some(last) => {
                let dirty: Vec<(usize, u32)> = self.state.dram_cache.dirty_lines().collect();
                for (i, data) in dirty {
                    debug_assert!(i < self.state.dramsize);
                    let set_interrupt = i == last && run;
                    scans.add_write32(i as u16, data, set_interrupt);
                }
            }
        }

        if run || address < CACHE_NO_READ {
            // The first read returns the result of whatever was on the
            // pipeline before the interrupt was set; only the second one
            // is worth looking at.
            scans.add_read32(address, false);
            scans.add_read32(address, false);
        }

        self.execute_batch(&mut scans)?;

        let mut busy = 0;
        for i in 0..scans.len() {
            let status = scans.response(i).status;
            match DbusStatus::parse(status) {
                Some(DbusStatus::Success) => {}
                Some(DbusStatus::Busy) => busy += 1,
                Some(DbusStatus::Failed) | None => {
                    tracing::error!("Debug RAM write failed. Hardware error?");
                    return Err(RiscvError::DbusTransfer(DbusStatus::Failed));
                }
            }
        }

        if busy > 0 {
            self.increase_dbus_busy_delay();

            // Try again, using the slow careful code.
            for i in 0..DRAM_CACHE_SIZE.min(self.state.dramsize) {
                let data = self.state.dram_cache.line(i).data;
                let set_interrupt = Some(i) == last && run;
                self.dram_write32(i, data, set_interrupt)?;
            }
            self.state.dram_cache.clean(run);

            if self.wait_for_debugint_clear(true).is_err() {
                tracing::error!("debug interrupt didn't clear");
                self.dump_debug_ram();
                return Err(RiscvError::DebugInterruptStuck);
            }
        } else {
            self.state.dram_cache.clean(run);

            if run || address < CACHE_NO_READ {
                let last_scan = scans.len() - 1;
                let interrupt = scans.get_u32(last_scan, DBUS_DATA_START + 33, 1);
                let resp = scans.response(last_scan);
                if interrupt != 0 {
                    self.increase_interrupt_high_delay();
                    if self.wait_for_debugint_clear(false).is_err() {
                        tracing::error!("debug interrupt didn't clear");
                        self.dump_debug_ram();
                        return Err(RiscvError::DebugInterruptStuck);
                    }
                } else {
                    // That last scan read a useful value.
                    if resp.address != address {
                        tracing::info!(
                            "got data from {:#x} but expected it from {:#x}",
                            resp.address,
                            address
                        );
                    }
                    if (resp.address as usize) < DRAM_CACHE_SIZE {
                        self.state
                            .dram_cache
                            .fill(resp.address as usize, resp.data as u32);
                    }
                }
            }
        }

        Ok(())
    }

    /// Read back every clean valid line and compare against the shadow.
    pub(crate) fn cache_check(&mut self) -> Result<(), RiscvError> {
        let mut first_error = None;
        for i in 0..DRAM_CACHE_SIZE {
            let line = *self.state.dram_cache.line(i);
            if line.valid && !line.dirty {
                if let Err(e) = self.dram_check32(i, line.data) {
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            self.dump_debug_ram();
            return Err(e);
        }
        Ok(())
    }

    /*** Program injection primitives. ***/

    pub(crate) fn read_csr(&mut self, csr: u32) -> Result<u64, RiscvError> {
        self.cache_set32(0, assembly::csrr(S0, csr));
        self.cache_set_store(1, S0, Slot::Slot0);
        self.cache_set_jump(2);
        self.cache_write(4, true)?;
        let value = self.cache_get(Slot::Slot0)?;

        if csr == CSR_TSELECT {
            self.state.tselect = value;
            self.state.tselect_dirty = true;
        }

        Ok(value)
    }

    pub(crate) fn write_csr(&mut self, csr: u32, value: u64) -> Result<(), RiscvError> {
        self.cache_set_load(0, S0, Slot::Slot0);
        self.cache_set32(1, assembly::csrw(csr, S0));
        self.cache_set_jump(2);
        self.cache_set(Slot::Slot0, value);
        self.cache_write(4, true)?;

        if csr == CSR_TSELECT {
            self.state.tselect = value;
            self.state.tselect_dirty = false;
        }

        Ok(())
    }

    pub(crate) fn write_gpr(&mut self, gpr: u32, value: u64) -> Result<(), RiscvError> {
        self.cache_set_load(0, gpr, Slot::Slot0);
        self.cache_set_jump(1);
        self.cache_set(Slot::Slot0, value);
        self.cache_write(4, true)
    }

    /// Capture the hardware `tselect` into the shadow before trigger code
    /// is about to change it.
    pub(crate) fn maybe_read_tselect(&mut self) -> Result<(), RiscvError> {
        if !self.state.tselect_dirty {
            self.read_csr(CSR_TSELECT)?;
        }
        Ok(())
    }

    /// Restore the hardware `tselect` from the shadow if it may differ.
    pub(crate) fn maybe_write_tselect(&mut self) -> Result<(), RiscvError> {
        if self.state.tselect_dirty {
            let tselect = self.state.tselect;
            self.write_csr(CSR_TSELECT, tselect)?;
        }
        Ok(())
    }

    /*** Examination. ***/

    /// Identify the DTM and DM, prove Debug RAM round-trips, and discover
    /// the hart's xlen by running a shift probe on it.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        let dtminfo_raw = self.probe.read_register(DTMINFO, DTMINFO_WIDTH)?;
        let dtminfo = Dtminfo(buf_get(&dtminfo_raw, 0, 32) as u32);
        tracing::debug!("dtminfo={:#010x} {:?}", dtminfo.0, dtminfo);

        if dtminfo.0 == 0 {
            return Err(RiscvError::DtmNotPresent);
        }
        if dtminfo.version() != 0 {
            tracing::error!("unsupported DTM version {}", dtminfo.version());
            return Err(RiscvError::UnsupportedDtmVersion(dtminfo.version() as u8));
        }
        self.state.addrbits = dtminfo.addrbits() as u8;

        let dminfo = Dminfo(self.dbus_read(DMINFO)? as u32);
        tracing::debug!("dminfo={:#010x} {:?}", dminfo.0, dminfo);

        if dminfo.version() != 1 {
            tracing::error!(
                "only Debug Module version 1 is supported, not {} (dminfo={:#x})",
                dminfo.version(),
                dminfo.0
            );
            return Err(RiscvError::UnsupportedDebugModuleVersion(
                dminfo.version() as u8
            ));
        }

        self.state.dramsize = dminfo.dramsize() as usize + 1;

        if dminfo.authtype() != 0 {
            tracing::error!(
                "target requires authentication, which is not supported (dminfo={:#x})",
                dminfo.0
            );
            return Err(RiscvError::AuthenticationRequired(dminfo.authtype() as u8));
        }

        // Figure out xlen by shifting an all-ones register right twice and
        // watching what lands in the first two RAM words.
        self.cache_set32(0, assembly::xori(S1, ZERO, 0xffff_ffff));
        self.cache_set32(1, assembly::srli(S1, S1, 31));
        self.cache_set32(2, assembly::sw(S1, ZERO, DEBUG_RAM_START));
        self.cache_set32(3, assembly::srli(S1, S1, 31));
        self.cache_set32(4, assembly::sw(S1, ZERO, DEBUG_RAM_START + 4));
        self.cache_set_jump(5);

        self.cache_write(0, false)?;

        // Check that we can actually read and write Debug RAM.
        self.cache_check()?;

        self.cache_write(0, true)?;
        self.cache_invalidate();

        let word0 = self.cache_get32(0)?;
        let word1 = self.cache_get32(1)?;
        let xlen = match (word0, word1) {
            (1, 0) => 32,
            (0xffff_ffff, 3) => 64,
            (0xffff_ffff, 0xffff_ffff) => 128,
            _ => {
                let exception = self.cache_get32(self.state.dramsize - 1)?;
                tracing::error!(
                    "failed to discover xlen; word0={:#x}, word1={:#x}, exception={:#x}",
                    word0,
                    word1,
                    exception
                );
                self.dump_debug_ram();
                return Err(RiscvError::XlenDetectionFailed {
                    word0,
                    word1,
                    exception,
                });
            }
        };
        tracing::debug!("discovered xlen is {}", xlen);

        if xlen == 128 {
            return Err(RiscvError::UnsupportedXlen(xlen));
        }
        self.state.xlen = xlen;

        self.state.misa = self.read_csr(CSR_MISA).map_err(|e| {
            tracing::error!("failed to read misa");
            e
        })?;

        Ok(())
    }

    /*** Halt-time bulk register drain. ***/

    /// Read every GPR, then the saved S1 and S0, then DPC and DCSR, in one
    /// large scan batch. Returns [`Harvest::Retry`] after bumping the
    /// matching delay if the batch saw a BUSY or a still-high interrupt.
    pub(crate) fn handle_halt_routine(&mut self) -> Result<Harvest, RiscvError> {
        let mut scans = self.new_batch(256);

        // Read all GPRs as fast as we can, because the remote debugger is
        // going to ask for them anyway.

        // The terminator lives at word 1; each kick runs a single store at
        // word 0 followed by it.
        scans.add_write_jump(1, false);
        for reg in 1..32 {
            if reg == S0 || reg == S1 {
                continue;
            }
            scans.add_write_store(0, reg, Slot::Slot0, true);
            scans.add_read(Slot::Slot0, false);
        }

        // From here on the program is store-S0 at word 1, jump at word 2.
        scans.add_write_store(1, S0, Slot::Slot0, false);
        scans.add_write_jump(2, false);

        // The ROM parked S1 in the last slot.
        scans.add_write_load(0, S0, Slot::Last, true);
        scans.add_read(Slot::Slot0, false);

        // And S0 in dscratch; then the debug CSRs.
        for csr in [CSR_DSCRATCH, CSR_DPC, CSR_DCSR] {
            scans.add_write32(0, assembly::csrr(S0, csr), true);
            scans.add_read(Slot::Slot0, false);
        }

        // Final read to flush the last value out of the pipeline.
        scans.add_read32(4, false);

        self.execute_batch(&mut scans)?;

        let mut dbus_busy = false;
        let mut interrupt_set = false;
        let mut result = 0;
        // 29 plain GPRs, S1, S0, DPC, DCSR.
        let mut values = [0u64; 33];

        // The first scan result is left over from something old.
        for i in 1..scans.len() {
            let resp = scans.response(i);
            let data = scans.get_u64(i, DBUS_DATA_START, DBUS_DATA_SIZE);
            tracing::debug!(
                "read scan={} result={} data={:09x} address={:02x}",
                i,
                resp.status,
                data,
                resp.address
            );
            match DbusStatus::parse(resp.status) {
                Some(DbusStatus::Success) => {}
                Some(DbusStatus::Busy) => {
                    dbus_busy = true;
                    break;
                }
                Some(DbusStatus::Failed) | None => {
                    tracing::error!("debug access failed. Hardware error?");
                    return Err(RiscvError::DbusTransfer(DbusStatus::Failed));
                }
            }
            if data & DMCONTROL_INTERRUPT != 0 {
                interrupt_set = true;
                break;
            }
            if resp.address == 4 || resp.address == 5 {
                if result >= values.len() {
                    tracing::error!("harvested more drain results than expected");
                    return Err(RiscvError::DbusTransfer(DbusStatus::Failed));
                }
                let data = data & 0xffff_ffff;
                if self.state.xlen == 32 {
                    values[result] = data;
                    result += 1;
                } else if resp.address == 4 {
                    values[result] = data;
                } else {
                    values[result] |= data << 32;
                    result += 1;
                }
            }
        }

        self.cache_invalidate();

        if dbus_busy {
            self.increase_dbus_busy_delay();
            return Ok(Harvest::Retry);
        }
        if interrupt_set {
            self.increase_interrupt_high_delay();
            return Ok(Harvest::Retry);
        }

        self.state.gpr_cache[0] = 0;
        for (slot, value) in values.iter().enumerate() {
            match slot {
                0..=6 => self.state.gpr_cache[slot + 1] = *value,
                7..=28 => self.state.gpr_cache[slot + 3] = *value,
                29 => self.state.gpr_cache[S1 as usize] = *value,
                30 => self.state.gpr_cache[S0 as usize] = *value,
                31 => self.state.dpc = *value,
                _ => self.state.dcsr = Dcsr(*value as u32),
            }
        }

        Ok(Harvest::Complete)
    }

    /*** Resume. ***/

    /// Write DPC, push the updated DCSR through a staged program, and let
    /// the hart go (optionally for a single step).
    pub(crate) fn execute_resume(&mut self, step: bool) -> Result<(), RiscvError> {
        tracing::debug!("resume(step={})", step);

        self.maybe_write_tselect()?;

        self.cache_set_load(0, S0, Slot::Slot0);
        self.cache_set32(1, assembly::csrw(CSR_DPC, S0));
        self.cache_set_jump(2);
        let dpc = self.state.dpc;
        self.cache_set(Slot::Slot0, dpc);
        self.cache_write(4, true)?;

        let mut dcsr = self.state.dcsr;
        dcsr.set_ebreakm(true);
        dcsr.set_ebreakh(true);
        dcsr.set_ebreaks(true);
        dcsr.set_ebreaku(true);
        dcsr.set_halt(false);
        dcsr.set_step(step);
        self.state.dcsr = dcsr;

        self.dram_write32(0, assembly::lw(S0, ZERO, DEBUG_RAM_START + 16), false)?;
        self.dram_write32(1, assembly::csrw(CSR_DCSR, S0), false)?;
        self.dram_write32(2, assembly::FENCE_I, false)?;
        self.dram_write_jump(3, false)?;

        // Write the DCSR value, set interrupt and clear haltnot.
        let dbus_value = DMCONTROL_INTERRUPT | dcsr.0 as u64;
        self.dbus_write(dram_address(4), dbus_value)?;

        self.cache_invalidate();

        if self.wait_for_debugint_clear(true).is_err() {
            tracing::error!("debug interrupt didn't clear");
            return Err(RiscvError::DebugInterruptStuck);
        }

        for value in &mut self.state.gpr_cache {
            *value = GPR_POISON;
        }

        Ok(())
    }
}
