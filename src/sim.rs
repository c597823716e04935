//! A golden Debug Module simulator for tests.
//!
//! The simulator implements [`JtagAccess`] and behaves like a DM with an
//! attached hart: dbus scans are pipelined by one (each capture carries
//! the response to the previous operation), writes with the interrupt bit
//! actually execute the staged Debug-RAM program on a small RV32/RV64
//! interpreter, and the debug ROM contract (s0/s1 parking, exception
//! word, resume gating on `dcsr.halt`) is modelled faithfully. BUSY
//! responses and a configurable interrupt latency can be scheduled to
//! exercise the retry paths.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::rc::Rc;

use crate::dbus::{buf_get, buf_set, DEBUG_RAM_START, DEBUG_ROM_RESUME, SETHALTNOT};
use crate::probe::{DebugProbeError, JtagAccess, JtagWriteCommand};
use crate::registers::{
    CSR_DCSR, CSR_DPC, CSR_DSCRATCH, CSR_MHARTID, CSR_MISA, CSR_TDATA1, CSR_TDATA2, CSR_TSELECT,
    DCSR_CAUSE_DEBUGINT, DCSR_CAUSE_HALT, DCSR_CAUSE_STEP,
};

const DTMINFO_IR: u32 = 0x10;
const DBUS_IR: u32 = 0x11;

const DCSR_NDRESET: u32 = 1 << 29;
const DCSR_FULLRESET: u32 = 1 << 28;
const DCSR_HALT: u32 = 1 << 3;
const DCSR_STEP: u32 = 1 << 2;

const CAUSE_ILLEGAL: u32 = 2;
const CAUSE_LOAD_FAULT: u32 = 5;
const CAUSE_STORE_FAULT: u32 = 7;

const RESET_VECTOR: u64 = 0x1000;

pub(crate) struct Dm {
    addrbits: u8,
    pub xlen: u32,
    pub dramsize: usize,
    pub dtminfo: u32,
    pub dram: [u32; 64],

    pub haltnot: bool,
    interrupt: bool,

    // One-deep response pipeline.
    resp_status: u8,
    resp_data: u32,
    resp_addr: u16,

    // Hart state.
    pub gpr: [u128; 32],
    pub fpr: [u64; 32],
    pub pc: u64,
    pub dpc: u64,
    pub dcsr: u32,
    pub dscratch: u64,
    pub misa: u64,
    mhartid: u64,
    pub tselect: u64,
    pub triggers: Vec<(u64, u64)>,
    pub in_debug_mode: bool,
    pending_reset: bool,

    pub memory: HashMap<u64, u8>,

    scan_count: usize,
    busy_scans: BTreeSet<usize>,
    /// Number of scans the interrupt reads high after a kick.
    pub interrupt_latency: usize,
    interrupt_high_until: usize,
    idle_cycles: u8,

    /// When set, the staged program's stores are corrupted; used to drive
    /// the xlen-detection failure path.
    pub corrupt_stores: bool,

    /// Replaces the computed `dminfo` value when set.
    pub dminfo_override: Option<u32>,
}

impl Dm {
    pub fn new(xlen: u32, ntriggers: usize) -> Self {
        let dramsize = 16;
        Dm {
            addrbits: 5,
            xlen,
            dramsize,
            // addrbits 5, version 0
            dtminfo: 0x50,
            dram: [0; 64],
            haltnot: false,
            interrupt: false,
            resp_status: 0,
            resp_data: 0,
            resp_addr: 0x1f,
            gpr: [0; 32],
            fpr: [0; 32],
            pc: 0x8000_0000,
            dpc: 0,
            dcsr: 0,
            dscratch: 0,
            // I, M, S and U present
            misa: (1 << 8) | (1 << 12) | (1 << 18) | (1 << 20),
            mhartid: 0,
            tselect: 0,
            triggers: vec![(0, 0); ntriggers],
            in_debug_mode: false,
            pending_reset: false,
            memory: HashMap::new(),
            scan_count: 0,
            busy_scans: BTreeSet::new(),
            interrupt_latency: 0,
            interrupt_high_until: 0,
            idle_cycles: 0,
            corrupt_stores: false,
            dminfo_override: None,
        }
    }

    pub fn dminfo(&self) -> u32 {
        // version 1, no auth, 32/64-bit access
        ((self.dramsize as u32 - 1) << 10) | (1 << 5) | (1 << 18) | (1 << 19) | 1
    }

    fn xlen_mask(&self) -> u128 {
        match self.xlen {
            32 => 0xffff_ffff,
            64 => u64::MAX as u128,
            _ => u128::MAX,
        }
    }

    pub fn set_memory(&mut self, address: u64, bytes: &[u8]) {
        for (i, byte) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, *byte);
        }
    }

    pub fn memory_bytes(&self, address: u64, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| *self.memory.get(&(address + i as u64)).unwrap_or(&0))
            .collect()
    }

    /// Answer BUSY to the n-th dbus operation from now (1 = the next one).
    pub fn schedule_busy_in(&mut self, n: usize) {
        self.busy_scans.insert(self.scan_count + n);
    }

    /// Put the hart into debug mode as if a trigger had fired.
    pub fn trap_with_cause(&mut self, cause: u32) {
        self.trap(cause);
    }

    /// A trap entry halts the hart: the halt bit goes up so the ROM keeps
    /// it parked across snippet runs, and the DM is notified.
    fn trap(&mut self, cause: u32) {
        self.enter_debug_mode(cause);
        self.dcsr |= DCSR_HALT;
        self.haltnot = true;
    }

    fn interrupt_reads_high(&self) -> bool {
        self.interrupt || self.scan_count < self.interrupt_high_until
    }

    /*** Dbus front end. ***/

    fn scan(&mut self, out: &[u8]) -> Vec<u8> {
        let op = buf_get(out, 0, 2) as u8;
        let data = buf_get(out, 2, 34);
        let address = buf_get(out, 36, self.addrbits as usize) as u16;

        // The capture returns the response to the previous operation,
        // with the live latch bits on top.
        let mut in_value = vec![0u8; out.len()];
        buf_set(&mut in_value, 0, 2, self.resp_status as u64);
        let mut resp_data = self.resp_data as u64;
        if self.haltnot {
            resp_data |= 1 << 32;
        }
        if self.interrupt_reads_high() {
            resp_data |= 1 << 33;
        }
        buf_set(&mut in_value, 2, 34, resp_data);
        buf_set(&mut in_value, 36, self.addrbits as usize, self.resp_addr as u64);

        self.scan_count += 1;

        if self.busy_scans.remove(&self.scan_count) {
            self.resp_status = 3;
            self.resp_data = 0;
            self.resp_addr = address;
            return in_value;
        }

        match op {
            1 => {
                self.resp_status = 0;
                self.resp_data = self.bus_read(address);
                self.resp_addr = address;
            }
            2 => {
                // A write latches the pre-write content of the word.
                self.resp_status = 0;
                self.resp_data = self.bus_read(address);
                self.resp_addr = address;
                self.bus_write(address, data);
            }
            _ => {}
        }

        in_value
    }

    fn dram_index(&self, address: u16) -> Option<usize> {
        if address < 0x10 {
            Some(address as usize)
        } else if (0x40..0x40 + (self.dramsize.max(0x10) - 0x10) as u16).contains(&address) {
            Some((address - 0x40) as usize + 0x10)
        } else {
            None
        }
    }

    fn bus_read(&self, address: u16) -> u32 {
        if let Some(index) = self.dram_index(address) {
            self.dram[index]
        } else if address == crate::dbus::DMINFO {
            self.dminfo_override.unwrap_or_else(|| self.dminfo())
        } else {
            0
        }
    }

    fn bus_write(&mut self, address: u16, data: u64) {
        // The haltnot latch is write-zero-to-clear; only the hart sets it,
        // through a store to SETHALTNOT.
        if data & (1 << 32) == 0 {
            self.haltnot = false;
        }
        if let Some(index) = self.dram_index(address) {
            self.dram[index] = data as u32;
        }
        if data & (1 << 33) != 0 {
            self.kick();
        }
    }

    /*** Debug ROM model. ***/

    fn slot_last(&self) -> usize {
        match self.xlen {
            32 => self.dramsize - 1,
            _ => self.dramsize - 2,
        }
    }

    /// Park s0 in dscratch and s1 in the last RAM slot so snippets can
    /// clobber them.
    fn enter_debug_mode(&mut self, cause: u32) {
        self.dscratch = self.gpr[8] as u64;
        let s1 = self.gpr[9];
        if self.xlen == 32 {
            self.dram[self.slot_last()] = s1 as u32;
        } else {
            let slot = self.slot_last();
            self.dram[slot] = s1 as u32;
            self.dram[slot + 1] = (s1 >> 32) as u32;
        }
        self.dpc = self.pc;
        self.dcsr = (self.dcsr & !(7 << 6)) | (cause << 6);
        self.in_debug_mode = true;
    }

    fn leave_debug_mode(&mut self) {
        self.gpr[8] = self.dscratch as u128;
        let slot = self.slot_last();
        let mut s1 = self.dram[slot] as u64;
        if self.xlen > 32 {
            s1 |= (self.dram[slot + 1] as u64) << 32;
        }
        self.gpr[9] = s1 as u128;
        self.in_debug_mode = false;
        self.pc = self.dpc;
    }

    fn kick(&mut self) {
        self.interrupt = true;
        if !self.in_debug_mode {
            self.enter_debug_mode(DCSR_CAUSE_DEBUGINT);
        }
        self.run_program();
        self.interrupt = false;
        self.interrupt_high_until = self.scan_count + self.interrupt_latency;
    }

    fn exception(&mut self, cause: u32) {
        self.dram[self.dramsize - 1] = cause;
        self.in_debug_mode = true;
        self.dcsr |= DCSR_HALT;
        self.haltnot = true;
    }

    fn run_program(&mut self) {
        let mut pc = DEBUG_RAM_START as u64;
        for _ in 0..1000 {
            if self.pending_reset {
                self.pending_reset = false;
                self.take_reset();
                return;
            }
            if pc == DEBUG_ROM_RESUME as u64 {
                self.finish_resume();
                return;
            }
            let offset = pc.wrapping_sub(DEBUG_RAM_START as u64) as usize;
            if offset % 4 != 0 || offset / 4 >= self.dramsize {
                self.exception(CAUSE_ILLEGAL);
                return;
            }
            let insn = self.dram[offset / 4];
            match self.execute(insn, pc) {
                Ok(Some(target)) => pc = target,
                Ok(None) => pc += 4,
                Err(cause) => {
                    self.exception(cause);
                    return;
                }
            }
        }
        self.exception(CAUSE_ILLEGAL);
    }

    fn finish_resume(&mut self) {
        if self.dcsr & DCSR_HALT != 0 {
            // Halt intent: stay parked in the debug ROM wait loop.
            return;
        }
        self.leave_debug_mode();
        if self.dcsr & DCSR_STEP != 0 {
            // One instruction of progress, then back into debug mode.
            self.pc += 4;
            self.trap(DCSR_CAUSE_STEP);
        }
    }

    fn take_reset(&mut self) {
        let fullreset = self.dcsr & DCSR_FULLRESET != 0;
        self.pc = RESET_VECTOR;
        self.dcsr &= !(DCSR_NDRESET | DCSR_FULLRESET);
        if fullreset {
            // A full reset wipes the debug state, halt intent included.
            self.dcsr = 0;
        }
        self.interrupt = false;
        if self.dcsr & DCSR_HALT != 0 {
            self.enter_debug_mode(DCSR_CAUSE_HALT);
            self.haltnot = true;
        } else {
            self.in_debug_mode = false;
            self.haltnot = false;
        }
    }

    /*** Instruction interpreter. ***/

    fn execute(&mut self, insn: u32, pc: u64) -> Result<Option<u64>, u32> {
        let opcode = insn & 0x7f;
        let rd = ((insn >> 7) & 0x1f) as usize;
        let rs1 = ((insn >> 15) & 0x1f) as usize;
        let rs2 = ((insn >> 20) & 0x1f) as usize;
        let funct3 = (insn >> 12) & 7;

        match opcode {
            // jal
            0b110_1111 => {
                let imm = ((insn >> 31) as u64) << 20
                    | (((insn >> 12) & 0xff) as u64) << 12
                    | (((insn >> 20) & 1) as u64) << 11
                    | (((insn >> 21) & 0x3ff) as u64) << 1;
                let imm = ((imm << 43) as i64 >> 43) as u64;
                if rd != 0 {
                    self.set_gpr(rd, pc.wrapping_add(4) as u128);
                }
                Ok(Some(pc.wrapping_add(imm)))
            }
            // loads
            0b000_0011 => {
                let imm = ((insn as i32) >> 20) as i128 as u128;
                let address = (self.gpr[rs1].wrapping_add(imm) & self.xlen_mask()) as u64;
                let size = 1usize << (funct3 & 3);
                let value = self.load_mem(address, size)?;
                // lb/lh/lw sign-extend
                let shift = 64 - 8 * size as u32;
                let value = ((value << shift) as i64 >> shift) as i128 as u128;
                self.set_gpr(rd, value);
                Ok(None)
            }
            // stores
            0b010_0011 => {
                let imm =
                    ((insn & 0xfe00_0000) as i32 >> 20) as i128 as u128 | ((insn >> 7) & 0x1f) as u128;
                let address = (self.gpr[rs1].wrapping_add(imm) & self.xlen_mask()) as u64;
                let size = 1usize << (funct3 & 3);
                let value = self.gpr[rs2] as u64;
                self.store_mem(address, size, value)?;
                Ok(None)
            }
            // op-imm
            0b001_0011 => {
                let imm = ((insn as i32) >> 20) as i128 as u128;
                let value = match funct3 {
                    0b000 => self.gpr[rs1].wrapping_add(imm),
                    0b100 => self.gpr[rs1] ^ imm,
                    0b101 => {
                        let shamt = (insn >> 20) & 0x3f;
                        (self.gpr[rs1] & self.xlen_mask()) >> shamt
                    }
                    _ => return Err(CAUSE_ILLEGAL),
                };
                self.set_gpr(rd, value);
                Ok(None)
            }
            // system: csr accesses
            0b111_0011 => {
                let csr = insn >> 20;
                match funct3 {
                    // csrrw
                    0b001 => {
                        let value = self.gpr[rs1] as u64;
                        if rd != 0 {
                            let old = self.csr_read(csr)?;
                            self.set_gpr(rd, old as u128);
                        }
                        self.csr_write(csr, value)?;
                    }
                    // csrrs
                    0b010 => {
                        let old = self.csr_read(csr)?;
                        if rs1 != 0 {
                            self.csr_write(csr, old | self.gpr[rs1] as u64)?;
                        }
                        self.set_gpr(rd, old as u128);
                    }
                    // csrrsi
                    0b110 => {
                        let old = self.csr_read(csr)?;
                        if rs1 != 0 {
                            self.csr_write(csr, old | rs1 as u64)?;
                        }
                        if rd != 0 {
                            self.set_gpr(rd, old as u128);
                        }
                    }
                    _ => return Err(CAUSE_ILLEGAL),
                }
                Ok(None)
            }
            // fence, fence.i
            0b000_1111 => Ok(None),
            // store-fp (fsw)
            0b010_0111 => {
                let imm =
                    ((insn & 0xfe00_0000) as i32 >> 20) as i128 as u128 | ((insn >> 7) & 0x1f) as u128;
                let address = (self.gpr[rs1].wrapping_add(imm) & self.xlen_mask()) as u64;
                self.store_mem(address, 4, self.fpr[rs2])?;
                Ok(None)
            }
            // load-fp (flw)
            0b000_0111 => {
                let imm = ((insn as i32) >> 20) as i128 as u128;
                let address = (self.gpr[rs1].wrapping_add(imm) & self.xlen_mask()) as u64;
                self.fpr[rd] = self.load_mem(address, 4)?;
                Ok(None)
            }
            _ => Err(CAUSE_ILLEGAL),
        }
    }

    fn set_gpr(&mut self, index: usize, value: u128) {
        if index != 0 {
            self.gpr[index] = value & self.xlen_mask();
        }
    }

    fn load_mem(&mut self, address: u64, size: usize) -> Result<u64, u32> {
        let dram_end = DEBUG_RAM_START as u64 + 4 * self.dramsize as u64;
        if (DEBUG_RAM_START as u64..dram_end).contains(&address) {
            let mut value = 0u64;
            for i in 0..size {
                let offset = (address - DEBUG_RAM_START as u64) as usize + i;
                let byte = (self.dram[offset / 4] >> (8 * (offset % 4))) & 0xff;
                value |= (byte as u64) << (8 * i);
            }
            return Ok(value);
        }
        let mut value = 0u64;
        for i in 0..size {
            match self.memory.get(&(address + i as u64)) {
                Some(byte) => value |= (*byte as u64) << (8 * i),
                None => return Err(CAUSE_LOAD_FAULT),
            }
        }
        Ok(value)
    }

    fn store_mem(&mut self, address: u64, size: usize, value: u64) -> Result<(), u32> {
        if self.corrupt_stores {
            return Ok(());
        }
        let dram_end = DEBUG_RAM_START as u64 + 4 * self.dramsize as u64;
        if (DEBUG_RAM_START as u64..dram_end).contains(&address) {
            for i in 0..size {
                let offset = (address - DEBUG_RAM_START as u64) as usize + i;
                let word = &mut self.dram[offset / 4];
                let shift = 8 * (offset % 4);
                *word = (*word & !(0xff << shift)) | ((value >> (8 * i)) as u32 & 0xff) << shift;
            }
            return Ok(());
        }
        if address == SETHALTNOT as u64 {
            self.haltnot = true;
            return Ok(());
        }
        if (0..size).all(|i| self.memory.contains_key(&(address + i as u64))) {
            for i in 0..size {
                self.memory
                    .insert(address + i as u64, (value >> (8 * i)) as u8);
            }
            return Ok(());
        }
        Err(CAUSE_STORE_FAULT)
    }

    fn effective_tselect(&self) -> usize {
        (self.tselect as usize).min(self.triggers.len() - 1)
    }

    fn mcontrol_type_bits(&self) -> u64 {
        2 << (self.xlen - 4)
    }

    fn csr_read(&self, csr: u32) -> Result<u64, u32> {
        match csr {
            CSR_MISA => Ok(self.misa),
            CSR_MHARTID => Ok(self.mhartid),
            CSR_DCSR => Ok(self.dcsr as u64),
            CSR_DPC => Ok(self.dpc),
            CSR_DSCRATCH => Ok(self.dscratch),
            CSR_TSELECT => Ok(self.effective_tselect() as u64),
            CSR_TDATA1 => Ok(self.triggers[self.effective_tselect()].0 | self.mcontrol_type_bits()),
            CSR_TDATA2 => Ok(self.triggers[self.effective_tselect()].1),
            _ => Err(CAUSE_ILLEGAL),
        }
    }

    fn csr_write(&mut self, csr: u32, value: u64) -> Result<(), u32> {
        match csr {
            CSR_DCSR => {
                self.dcsr = value as u32;
                if value as u32 & (DCSR_NDRESET | DCSR_FULLRESET) != 0 {
                    self.pending_reset = true;
                }
            }
            CSR_DPC => self.dpc = value & self.xlen_mask() as u64,
            CSR_DSCRATCH => self.dscratch = value,
            CSR_TSELECT => self.tselect = value,
            CSR_TDATA1 => {
                let accepted = (1 << (self.xlen - 5)) // dmode
                    | (0x3f << 12) // action
                    | (0xf << 7) // match
                    | 0x7f; // m/h/s/u, execute, store, load
                let slot = self.effective_tselect();
                self.triggers[slot].0 = value & accepted;
            }
            CSR_TDATA2 => {
                let slot = self.effective_tselect();
                self.triggers[slot].1 = value;
            }
            _ => return Err(CAUSE_ILLEGAL),
        }
        Ok(())
    }
}

/// Cloneable probe handle over the simulated DM.
#[derive(Clone)]
pub(crate) struct SimDm(pub Rc<RefCell<Dm>>);

impl SimDm {
    pub fn new(xlen: u32, ntriggers: usize) -> Self {
        SimDm(Rc::new(RefCell::new(Dm::new(xlen, ntriggers))))
    }

    pub fn dm(&self) -> std::cell::RefMut<'_, Dm> {
        self.0.borrow_mut()
    }
}

impl JtagAccess for SimDm {
    fn read_register(&mut self, address: u32, _len: u32) -> Result<Vec<u8>, DebugProbeError> {
        match address {
            DTMINFO_IR => Ok(self.0.borrow().dtminfo.to_le_bytes().to_vec()),
            _ => Err(DebugProbeError::Probe(format!(
                "unexpected register read at {address:#x}"
            ))),
        }
    }

    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        _len: u32,
    ) -> Result<Vec<u8>, DebugProbeError> {
        match address {
            DBUS_IR => Ok(self.0.borrow_mut().scan(data)),
            _ => Err(DebugProbeError::Probe(format!(
                "unexpected register write at {address:#x}"
            ))),
        }
    }

    fn write_register_batch(
        &mut self,
        commands: &[JtagWriteCommand],
    ) -> Result<Vec<Vec<u8>>, DebugProbeError> {
        let mut dm = self.0.borrow_mut();
        Ok(commands.iter().map(|cmd| dm.scan(&cmd.data)).collect())
    }

    fn set_idle_cycles(&mut self, cycles: u8) {
        self.0.borrow_mut().idle_cycles = cycles;
    }

    fn idle_cycles(&self) -> u8 {
        self.0.borrow().idle_cycles
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::assembly;

    fn scan_write(dm: &mut Dm, address: u16, data: u64) {
        let mut out = [0u8; 8];
        crate::dbus::pack_dbus_scan(&mut out, crate::dbus::DbusOp::Write, data, address, 5);
        dm.scan(&out);
    }

    #[test]
    fn staged_program_runs_on_interrupt() {
        let mut dm = Dm::new(32, 4);
        // addi x5, x0, 7 at word 0, jump back at word 1
        scan_write(&mut dm, 0, (1 << 32) | assembly::addi(5, 0, 7) as u64);
        let jump = crate::cache::jump_to_resume(1);
        scan_write(&mut dm, 1, (1 << 33) | (1 << 32) | jump as u64);
        assert_eq!(dm.gpr[5], 7);
        // No halt intent, so the hart resumed.
        assert!(!dm.in_debug_mode);
    }

    #[test]
    fn exceptions_land_in_the_last_ram_word() {
        let mut dm = Dm::new(32, 4);
        // load from unmapped memory
        scan_write(&mut dm, 0, (1 << 32) | assembly::lw(5, 0, 0x100) as u64);
        let jump = crate::cache::jump_to_resume(1);
        scan_write(&mut dm, 1, (1 << 33) | (1 << 32) | jump as u64);
        assert_eq!(dm.dram[15], CAUSE_LOAD_FAULT);
    }

    #[test]
    fn sethaltnot_store_sets_the_latch() {
        let mut dm = Dm::new(32, 4);
        assert!(!dm.haltnot);
        scan_write(&mut dm, 0, (1 << 32) | assembly::sw(0, 0, SETHALTNOT) as u64);
        let jump = crate::cache::jump_to_resume(1);
        scan_write(&mut dm, 1, (1 << 33) | (1 << 32) | jump as u64);
        assert!(dm.haltnot);
    }
}
