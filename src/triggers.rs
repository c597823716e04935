//! Allocation and configuration of hardware triggers.
//!
//! Triggers are a bounded pool selected through `tselect`; slot `i` is in
//! use iff it has a recorded owner. Slots already claimed by user code
//! (any of the execute/store/load bits set in `tdata1`) are never touched.

use crate::communication_interface::RiscvCommunicationInterface;
use crate::error::RiscvError;
use crate::registers::{CSR_TDATA1, CSR_TDATA2, CSR_TSELECT};

pub const MAX_HWBPS: usize = 16;

pub(crate) const MCONTROL_ACTION: u64 = 0x3f << 12;
pub(crate) const MCONTROL_MATCH: u64 = 0xf << 7;
pub(crate) const MCONTROL_M: u64 = 1 << 6;
pub(crate) const MCONTROL_H: u64 = 1 << 5;
pub(crate) const MCONTROL_S: u64 = 1 << 4;
pub(crate) const MCONTROL_U: u64 = 1 << 3;
pub(crate) const MCONTROL_EXECUTE: u64 = 1 << 2;
pub(crate) const MCONTROL_STORE: u64 = 1 << 1;
pub(crate) const MCONTROL_LOAD: u64 = 1 << 0;

pub(crate) const MCONTROL_ACTION_DEBUG_MODE: u64 = 1;
pub(crate) const MCONTROL_MATCH_EQUAL: u64 = 0;

/// The trigger type field sits in the top nibble of `tdata1`.
pub(crate) fn mcontrol_type(xlen: u32) -> u64 {
    0xf << (xlen - 4)
}

pub(crate) fn mcontrol_dmode(xlen: u32) -> u64 {
    1 << (xlen - 5)
}

pub(crate) fn get_field(reg: u64, mask: u64) -> u64 {
    (reg & mask) >> mask.trailing_zeros()
}

pub(crate) fn set_field(reg: u64, mask: u64, value: u64) -> u64 {
    (reg & !mask) | ((value << mask.trailing_zeros()) & mask)
}

/// What a breakpoint or watchpoint asks of a physical trigger.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub address: u64,
    pub length: u32,
    pub mask: u64,
    pub value: u64,
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Identity shared across the breakpoint and watchpoint namespaces.
    pub unique_id: u32,
}

impl RiscvCommunicationInterface {
    /// Claim the first free physical trigger that supports the requested
    /// access mix. Returns the slot index.
    pub(crate) fn add_trigger(&mut self, trigger: &Trigger) -> Result<usize, RiscvError> {
        self.maybe_read_tselect()?;

        let xlen = self.state().xlen;
        for i in 0..MAX_HWBPS {
            if self.state().trigger_unique_id[i].is_some() {
                continue;
            }

            self.write_csr(CSR_TSELECT, i as u64)?;
            let tselect_rb = self.read_csr(CSR_TSELECT)?;
            if tselect_rb != i as u64 {
                // We've run out of triggers.
                tracing::error!(
                    "couldn't find an available hardware trigger ({:#x} != {:#x})",
                    tselect_rb,
                    i
                );
                return Err(RiscvError::TriggerNotAvailable);
            }

            let tdata1 = self.read_csr(CSR_TDATA1)?;
            let trigger_type = get_field(tdata1, mcontrol_type(xlen));
            if trigger_type != 2 {
                continue;
            }
            if tdata1 & (MCONTROL_EXECUTE | MCONTROL_STORE | MCONTROL_LOAD) != 0 {
                // Trigger is already in use, presumably by user code.
                continue;
            }

            // Address match trigger firing into debug mode.
            let mut tdata1 = tdata1 | mcontrol_dmode(xlen);
            tdata1 = set_field(tdata1, MCONTROL_ACTION, MCONTROL_ACTION_DEBUG_MODE);
            tdata1 = set_field(tdata1, MCONTROL_MATCH, MCONTROL_MATCH_EQUAL);
            tdata1 |= MCONTROL_M;
            let misa = self.state().misa;
            if misa & (1 << (b'H' - b'A')) != 0 {
                tdata1 |= MCONTROL_H;
            }
            if misa & (1 << (b'S' - b'A')) != 0 {
                tdata1 |= MCONTROL_S;
            }
            if misa & (1 << (b'U' - b'A')) != 0 {
                tdata1 |= MCONTROL_U;
            }

            if trigger.execute {
                tdata1 |= MCONTROL_EXECUTE;
            }
            if trigger.read {
                tdata1 |= MCONTROL_LOAD;
            }
            if trigger.write {
                tdata1 |= MCONTROL_STORE;
            }

            self.write_csr(CSR_TDATA1, tdata1)?;
            let tdata1_rb = self.read_csr(CSR_TDATA1)?;
            tracing::debug!("tdata1={:#x}", tdata1_rb);

            if tdata1 != tdata1_rb {
                // This slot doesn't support the requested mix.
                tracing::debug!(
                    "trigger {} doesn't support what we need; after writing {:#x} to tdata1 it contains {:#x}",
                    i,
                    tdata1,
                    tdata1_rb
                );
                self.write_csr(CSR_TDATA1, 0)?;
                continue;
            }

            self.write_csr(CSR_TDATA2, trigger.address)?;

            tracing::debug!("using resource {} for bp {}", i, trigger.unique_id);
            self.state_mut().trigger_unique_id[i] = Some(trigger.unique_id);
            return Ok(i);
        }

        tracing::error!("couldn't find an available hardware trigger");
        Err(RiscvError::TriggerNotAvailable)
    }

    /// Release the physical trigger owned by `unique_id`.
    pub(crate) fn remove_trigger(&mut self, unique_id: u32) -> Result<(), RiscvError> {
        self.maybe_read_tselect()?;

        let slot = self
            .state()
            .trigger_unique_id
            .iter()
            .position(|&id| id == Some(unique_id))
            .ok_or_else(|| {
                tracing::error!("couldn't find the hardware resources used by the trigger");
                RiscvError::TriggerNotFound(unique_id)
            })?;

        tracing::debug!("stop using resource {} for bp {}", slot, unique_id);
        self.write_csr(CSR_TSELECT, slot as u64)?;
        self.write_csr(CSR_TDATA1, 0)?;
        self.state_mut().trigger_unique_id[slot] = None;

        Ok(())
    }
}
