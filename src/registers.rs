//! Architectural register numbering, naming, and access routing.
//!
//! The register list follows the remote debugger's expected order exactly:
//! `x0..x31`, `pc`, `f0..f31`, `csr0..csr4095`, `priv` — indices 0..4161.

use bitfield::bitfield;

use crate::assembly::{self, S0, S1};
use crate::cache::Slot;
use crate::communication_interface::RiscvCommunicationInterface;
use crate::dbus::DEBUG_RAM_START;
use crate::error::RiscvError;

pub const REG_XPR0: u32 = 0;
pub const REG_XPR31: u32 = 31;
pub const REG_PC: u32 = 32;
pub const REG_FPR0: u32 = 33;
pub const REG_FPR31: u32 = 64;
pub const REG_CSR0: u32 = 65;
pub const REG_CSR4095: u32 = 4160;
pub const REG_PRIV: u32 = 4161;
pub const REG_COUNT: usize = 4162;

pub const CSR_MISA: u32 = 0x301;
pub const CSR_TSELECT: u32 = 0x7a0;
pub const CSR_TDATA1: u32 = 0x7a1;
pub const CSR_TDATA2: u32 = 0x7a2;
pub const CSR_DCSR: u32 = 0x7b0;
pub const CSR_DPC: u32 = 0x7b1;
pub const CSR_DSCRATCH: u32 = 0x7b2;
pub const CSR_MHARTID: u32 = 0xf14;

/// The `halt` bit of `dcsr`, as a `csrsi` immediate.
pub const DCSR_HALT: u32 = 1 << 3;

pub const DCSR_CAUSE_SWBP: u32 = 1;
pub const DCSR_CAUSE_HWBP: u32 = 2;
pub const DCSR_CAUSE_DEBUGINT: u32 = 3;
pub const DCSR_CAUSE_STEP: u32 = 4;
pub const DCSR_CAUSE_HALT: u32 = 5;

bitfield! {
    /// The `dcsr` debug control and status register.
    ///
    /// The driver keeps a shadow copy; the `halt` bit mirrors intended
    /// policy rather than live hardware.
    #[derive(Copy, Clone)]
    pub struct Dcsr(u32);
    impl Debug;

    pub xdebugver, _: 31, 30;
    pub ndreset, set_ndreset: 29;
    pub fullreset, set_fullreset: 28;
    pub ebreakm, set_ebreakm: 15;
    pub ebreakh, set_ebreakh: 14;
    pub ebreaks, set_ebreaks: 13;
    pub ebreaku, set_ebreaku: 12;
    pub cause, set_cause: 8, 6;
    pub debugint, _: 5;
    pub halt, set_halt: 3;
    pub step, set_step: 2;
    pub prv, set_prv: 1, 0;
}

/// A framework-visible register description, bound to this session.
#[derive(Debug, Clone)]
pub struct RiscvRegister {
    pub name: String,
    pub number: u32,
    pub size_in_bits: u32,
}

/// Build the full gdb-ordered register list. Sizes start at 32 bits and
/// are fixed up once xlen is discovered.
pub fn build_reg_list() -> Vec<RiscvRegister> {
    let mut list = Vec::with_capacity(REG_COUNT);
    for i in 0..REG_COUNT as u32 {
        let name = if i <= REG_XPR31 {
            format!("x{i}")
        } else if i == REG_PC {
            "pc".to_string()
        } else if (REG_FPR0..=REG_FPR31).contains(&i) {
            format!("f{}", i - REG_FPR0)
        } else if (REG_CSR0..=REG_CSR4095).contains(&i) {
            format!("csr{}", i - REG_CSR0)
        } else {
            "priv".to_string()
        };
        list.push(RiscvRegister {
            name,
            number: i,
            size_in_bits: 32,
        });
    }
    list
}

/// Update register sizes to the discovered xlen. `priv` is always 8 bits.
pub fn update_reg_list(list: &mut [RiscvRegister], xlen: u32) {
    for reg in list.iter_mut() {
        reg.size_in_bits = if reg.number == REG_PRIV { 8 } else { xlen };
    }
}

impl RiscvCommunicationInterface {
    /// Read an architectural register by its gdb number.
    ///
    /// GPRs are served from the halt-time cache, PC and PRIV from the
    /// shadow CSRs; FPRs and CSRs require an injected snippet.
    pub fn register_read(&mut self, number: u32) -> Result<u64, RiscvError> {
        self.maybe_write_tselect()?;

        if number <= REG_XPR31 {
            let value = self.state().gpr_cache[number as usize];
            tracing::debug!("x{}={:#x} (cached)", number, value);
            return Ok(value);
        } else if number == REG_PC {
            tracing::debug!("pc={:#x} (cached)", self.state().dpc);
            return Ok(self.state().dpc);
        } else if number == REG_PRIV {
            let prv = self.state().dcsr.prv() as u64;
            tracing::debug!("priv={} (cached)", prv);
            return Ok(prv);
        } else if (REG_FPR0..=REG_FPR31).contains(&number) {
            self.cache_set32(
                0,
                assembly::fsw(number - REG_FPR0, assembly::ZERO, DEBUG_RAM_START + 16),
            );
            self.cache_set_jump(1);
        } else if (REG_CSR0..=REG_CSR4095).contains(&number) {
            self.cache_set32(0, assembly::csrr(S0, number - REG_CSR0));
            self.cache_set_store(1, S0, Slot::Slot0);
            self.cache_set_jump(2);
        } else {
            tracing::error!("don't know how to read register {}", number);
            return Err(RiscvError::UnknownRegister(number));
        }

        self.cache_write(4, true)?;
        let value = self.cache_get(Slot::Slot0)?;

        if (REG_CSR0..=REG_CSR4095).contains(&number) && number - REG_CSR0 == CSR_TSELECT {
            self.state_mut().tselect = value;
            self.state_mut().tselect_dirty = true;
        }

        let exception = self.cache_get32(self.dramsize() - 1)?;
        if exception != 0 {
            tracing::error!(
                "got exception {:#x} when reading register {}",
                exception,
                number
            );
            return Err(RiscvError::HartException(exception));
        }

        tracing::debug!("reg{}={:#x}", number, value);
        Ok(value)
    }

    /// Write an architectural register by its gdb number.
    ///
    /// S0 and S1 are routed through `dscratch` and the last RAM slot:
    /// the debug ROM holds their live values there while the hart is in
    /// debug mode.
    pub fn register_write(&mut self, number: u32, value: u64) -> Result<(), RiscvError> {
        self.maybe_write_tselect()?;

        if number == S0 {
            self.cache_set_load(0, S0, Slot::Slot0);
            self.cache_set32(1, assembly::csrw(CSR_DSCRATCH, S0));
            self.cache_set_jump(2);
        } else if number == S1 {
            self.cache_set_load(0, S0, Slot::Slot0);
            self.cache_set_store(1, S0, Slot::Last);
            self.cache_set_jump(2);
        } else if number <= REG_XPR31 {
            self.cache_set_load(0, number, Slot::Slot0);
            self.cache_set_jump(1);
        } else if number == REG_PC {
            self.state_mut().dpc = value;
            return Ok(());
        } else if (REG_FPR0..=REG_FPR31).contains(&number) {
            self.cache_set32(
                0,
                assembly::flw(number - REG_FPR0, assembly::ZERO, DEBUG_RAM_START + 16),
            );
            self.cache_set_jump(1);
        } else if (REG_CSR0..=REG_CSR4095).contains(&number) {
            self.cache_set_load(0, S0, Slot::Slot0);
            self.cache_set32(1, assembly::csrw(number - REG_CSR0, S0));
            self.cache_set_jump(2);
        } else if number == REG_PRIV {
            let mut dcsr = self.state().dcsr;
            dcsr.set_prv(value as u32);
            self.state_mut().dcsr = dcsr;
            return Ok(());
        } else {
            tracing::error!("don't know how to write register {}", number);
            return Err(RiscvError::UnknownRegister(number));
        }

        if number <= REG_XPR31 {
            self.state_mut().gpr_cache[number as usize] = value;
        }
        if (REG_CSR0..=REG_CSR4095).contains(&number) && number - REG_CSR0 == CSR_TSELECT {
            self.state_mut().tselect = value;
            self.state_mut().tselect_dirty = false;
        }

        self.cache_set(Slot::Slot0, value);
        self.cache_write(4, true)
    }
}
