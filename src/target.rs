//! The framework-facing target: hart lifecycle, breakpoint bookkeeping,
//! and the entry points the host debugger calls.

use std::time::Instant;

use crate::assembly::{self, S0};
use crate::communication_interface::{Harvest, RiscvCommunicationInterface, RISCV_TIMEOUT};
use crate::dbus::{DEBUG_RAM_START, SETHALTNOT};
use crate::error::RiscvError;
use crate::probe::JtagAccess;
use crate::registers::{
    self, RiscvRegister, CSR_DCSR, CSR_MHARTID, DCSR_CAUSE_DEBUGINT, DCSR_CAUSE_HWBP,
    DCSR_CAUSE_STEP, DCSR_CAUSE_SWBP, DCSR_HALT,
};
use crate::triggers::Trigger;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetState {
    Unknown,
    Running,
    Halted,
    /// The hart is executing an injected debug snippet.
    DebugRunning,
    Reset,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DebugReason {
    DebugRequest,
    Breakpoint,
    /// A data trigger fired; the remote debugger needs help stepping past
    /// it.
    WatchpointAndBreakpoint,
    SingleStep,
    Undefined,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    Halted,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BreakpointKind {
    Software,
    Hardware,
}

#[derive(Debug, Clone)]
pub struct Breakpoint {
    pub address: u32,
    /// 4 for a full `ebreak`, 2 for `c.ebreak`.
    pub length: u32,
    pub kind: BreakpointKind,
    pub unique_id: u32,
    orig_instr: [u8; 4],
    set: bool,
}

impl Breakpoint {
    pub fn new(address: u32, length: u32, kind: BreakpointKind, unique_id: u32) -> Self {
        Breakpoint {
            address,
            length,
            kind,
            unique_id,
            orig_instr: [0; 4],
            set: false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.set
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum WatchpointKind {
    Read,
    Write,
    Access,
}

#[derive(Debug, Clone)]
pub struct Watchpoint {
    pub address: u32,
    pub length: u32,
    pub mask: u64,
    pub value: u64,
    pub kind: WatchpointKind,
    pub unique_id: u32,
    set: bool,
}

impl Watchpoint {
    pub fn new(
        address: u32,
        length: u32,
        mask: u64,
        value: u64,
        kind: WatchpointKind,
        unique_id: u32,
    ) -> Self {
        Watchpoint {
            address,
            length,
            mask,
            value,
            kind,
            unique_id,
            set: false,
        }
    }

    pub fn is_set(&self) -> bool {
        self.set
    }
}

impl Trigger {
    /// Breakpoints and watchpoints share one unique-id namespace.
    fn from_breakpoint(bp: &Breakpoint) -> Self {
        Trigger {
            address: bp.address as u64,
            length: bp.length,
            mask: !0,
            value: 0,
            read: false,
            write: false,
            execute: true,
            unique_id: bp.unique_id,
        }
    }

    fn from_watchpoint(wp: &Watchpoint) -> Self {
        Trigger {
            address: wp.address as u64,
            length: wp.length,
            mask: wp.mask,
            value: wp.value,
            read: matches!(wp.kind, WatchpointKind::Read | WatchpointKind::Access),
            write: matches!(wp.kind, WatchpointKind::Write | WatchpointKind::Access),
            execute: false,
            unique_id: wp.unique_id,
        }
    }
}

/// Which register set the remote debugger asked for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RegisterClass {
    General,
    All,
}

/// One debuggable RISC-V hart, as seen by the host debugger framework.
pub struct RiscvTarget {
    interface: RiscvCommunicationInterface,
    state: TargetState,
    debug_reason: DebugReason,
    reset_halt: bool,
    examined: bool,
    breakpoints: Vec<Breakpoint>,
    watchpoints: Vec<Watchpoint>,
    reg_list: Vec<RiscvRegister>,
    event_callback: Option<Box<dyn FnMut(TargetEvent)>>,
}

impl RiscvTarget {
    pub fn new(probe: Box<dyn JtagAccess>) -> Self {
        tracing::debug!("init target");
        RiscvTarget {
            interface: RiscvCommunicationInterface::new(probe),
            state: TargetState::Unknown,
            debug_reason: DebugReason::Undefined,
            reset_halt: false,
            examined: false,
            breakpoints: Vec::new(),
            watchpoints: Vec::new(),
            reg_list: registers::build_reg_list(),
            event_callback: None,
        }
    }

    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn debug_reason(&self) -> DebugReason {
        self.debug_reason
    }

    /// Whether reset should leave the hart halted at its first
    /// instruction.
    pub fn set_reset_halt(&mut self, reset_halt: bool) {
        self.reset_halt = reset_halt;
    }

    pub fn set_event_callback(&mut self, callback: Box<dyn FnMut(TargetEvent)>) {
        self.event_callback = Some(callback);
    }

    pub fn interface(&mut self) -> &mut RiscvCommunicationInterface {
        &mut self.interface
    }

    /// Identify the DTM and DM and discover the hart's properties.
    pub fn examine(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("examine");
        if self.examined {
            return Ok(());
        }
        self.interface.examine()?;

        // Update the register list to match the discovered xlen.
        registers::update_reg_list(&mut self.reg_list, self.interface.xlen());
        self.examined = true;
        Ok(())
    }

    /*** Polling and halt handling. ***/

    pub fn poll(&mut self) -> Result<(), RiscvError> {
        self.poll_target(true)
    }

    fn poll_target(&mut self, announce: bool) -> Result<(), RiscvError> {
        let bits = self.interface.read_bits()?;

        if bits.haltnot && bits.interrupt {
            self.state = TargetState::DebugRunning;
            tracing::debug!("debug running");
        } else if bits.haltnot && !bits.interrupt {
            if self.state != TargetState::Halted {
                return self.handle_halt(announce);
            }
        } else if !bits.haltnot && bits.interrupt {
            // Target is halting. There is no state for that, so don't
            // change anything.
            tracing::debug!("halting");
        } else {
            self.state = TargetState::Running;
            tracing::debug!("running");
        }

        Ok(())
    }

    fn handle_halt(&mut self, announce: bool) -> Result<(), RiscvError> {
        self.state = TargetState::Halted;

        loop {
            match self.interface.handle_halt_routine()? {
                Harvest::Complete => break,
                Harvest::Retry => continue,
            }
        }

        let dcsr = self.interface.state().dcsr;
        let cause = dcsr.cause();
        tracing::debug!("halt cause is {}; dcsr={:#x}", cause, dcsr.0);
        match cause {
            DCSR_CAUSE_SWBP => self.debug_reason = DebugReason::Breakpoint,
            DCSR_CAUSE_HWBP => {
                self.debug_reason = DebugReason::WatchpointAndBreakpoint;
                // The remote debugger doesn't know to do the
                // disable-triggers-step-reenable dance after a data
                // trigger.
                self.interface.state_mut().need_strict_step = true;
            }
            DCSR_CAUSE_DEBUGINT => self.debug_reason = DebugReason::DebugRequest,
            DCSR_CAUSE_STEP => self.debug_reason = DebugReason::SingleStep,
            cause => {
                tracing::error!("invalid halt cause {} in DCSR ({:#x})", cause, dcsr.0);
            }
        }

        if announce {
            if let Some(callback) = self.event_callback.as_mut() {
                callback(TargetEvent::Halted);
            }
        }

        tracing::debug!("halted at {:#x}", self.interface.state().dpc);
        Ok(())
    }

    /*** Run control. ***/

    /// Ask the hart to trap into debug mode at its next instruction.
    pub fn halt(&mut self) -> Result<(), RiscvError> {
        tracing::debug!("halt");
        self.interface
            .cache_set32(0, assembly::csrsi(CSR_DCSR, DCSR_HALT));
        self.interface
            .cache_set32(1, assembly::csrr(S0, CSR_MHARTID));
        self.interface
            .cache_set32(2, assembly::sw(S0, assembly::ZERO, SETHALTNOT));
        self.interface.cache_set_jump(3);

        self.interface.cache_write(4, true).map_err(|e| {
            tracing::error!("cache_write() failed");
            e
        })
    }

    fn check_resume_mode(
        current: bool,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        if !current {
            tracing::error!("resuming at a fixed address is not supported");
            return Err(RiscvError::UnsupportedResumeMode("current=false"));
        }
        if handle_breakpoints {
            tracing::error!("resume with handle_breakpoints is not supported");
            return Err(RiscvError::UnsupportedResumeMode("handle_breakpoints"));
        }
        if debug_execution {
            tracing::error!("resume with debug_execution is not supported");
            return Err(RiscvError::UnsupportedResumeMode("debug_execution"));
        }
        Ok(())
    }

    fn do_resume(&mut self, step: bool) -> Result<(), RiscvError> {
        self.interface.execute_resume(step)?;
        self.state = TargetState::Running;
        Ok(())
    }

    pub fn resume(
        &mut self,
        current: bool,
        handle_breakpoints: bool,
        debug_execution: bool,
    ) -> Result<(), RiscvError> {
        if self.interface.state().need_strict_step {
            self.strict_step(false)?;
        }
        Self::check_resume_mode(current, handle_breakpoints, debug_execution)?;
        self.do_resume(false)
    }

    pub fn step(&mut self, current: bool, handle_breakpoints: bool) -> Result<(), RiscvError> {
        if self.interface.state().need_strict_step {
            self.strict_step(true)
        } else {
            Self::check_resume_mode(current, handle_breakpoints, false)?;
            self.do_resume(true)
        }
    }

    /// Execute one step and wait for reentry into debug mode.
    fn full_step(&mut self, announce: bool) -> Result<(), RiscvError> {
        self.do_resume(true)?;
        let start = Instant::now();
        loop {
            self.poll_target(announce)?;
            if self.state != TargetState::DebugRunning {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("timed out waiting for step to complete");
                return Err(RiscvError::Timeout);
            }
        }
    }

    /// Step with every trigger removed, then reinstall them. Needed to get
    /// past a data-match trigger hit.
    fn strict_step(&mut self, announce: bool) -> Result<(), RiscvError> {
        tracing::debug!("strict step");

        let mut breakpoints = std::mem::take(&mut self.breakpoints);
        let mut watchpoints = std::mem::take(&mut self.watchpoints);
        for bp in breakpoints.iter_mut() {
            let _ = self.uninstall_breakpoint(bp);
        }
        for wp in watchpoints.iter_mut() {
            let _ = self.uninstall_watchpoint(wp);
        }

        let result = self.full_step(announce);

        for bp in breakpoints.iter_mut() {
            let _ = self.install_breakpoint(bp);
        }
        for wp in watchpoints.iter_mut() {
            let _ = self.install_watchpoint(wp);
        }
        self.breakpoints = breakpoints;
        self.watchpoints = watchpoints;

        result?;
        self.interface.state_mut().need_strict_step = false;
        Ok(())
    }

    /*** Reset. ***/

    pub fn assert_reset(&mut self) -> Result<(), RiscvError> {
        // The only assumption we can make is that the TAP was reset.
        if self.interface.wait_for_debugint_clear(true).is_err() {
            tracing::error!("debug interrupt didn't clear");
            return Err(RiscvError::DebugInterruptStuck);
        }

        let mut dcsr = self.interface.state().dcsr;
        dcsr.set_ebreakm(true);
        dcsr.set_ebreakh(true);
        dcsr.set_ebreaks(true);
        dcsr.set_ebreaku(true);
        dcsr.set_halt(true);
        if self.reset_halt {
            dcsr.set_ndreset(true);
        } else {
            dcsr.set_fullreset(true);
        }
        self.interface.state_mut().dcsr = dcsr;

        self.interface
            .dram_write32(0, assembly::lw(S0, assembly::ZERO, DEBUG_RAM_START + 16), false)?;
        self.interface
            .dram_write32(1, assembly::csrw(CSR_DCSR, S0), false)?;
        // We shouldn't actually need the jump because a reset should
        // happen.
        self.interface.dram_write_jump(2, false)?;
        self.interface.dram_write32(4, dcsr.0, true)?;
        self.interface.cache_invalidate();

        self.state = TargetState::Reset;
        Ok(())
    }

    pub fn deassert_reset(&mut self) -> Result<(), RiscvError> {
        if self.reset_halt {
            self.wait_for_state(TargetState::Halted)
        } else {
            self.wait_for_state(TargetState::Running)
        }
    }

    fn wait_for_state(&mut self, state: TargetState) -> Result<(), RiscvError> {
        let start = Instant::now();
        loop {
            self.poll()?;
            if self.state == state {
                return Ok(());
            }
            if start.elapsed() > RISCV_TIMEOUT {
                tracing::error!("timed out waiting for state {:?}", state);
                return Err(RiscvError::Timeout);
            }
        }
    }

    /*** Registers and memory. ***/

    /// Registers in the order the remote debugger expects.
    pub fn get_gdb_reg_list(&self, class: RegisterClass) -> &[RiscvRegister] {
        match class {
            RegisterClass::General => &self.reg_list[..32],
            RegisterClass::All => &self.reg_list,
        }
    }

    pub fn read_register(&mut self, number: u32) -> Result<u64, RiscvError> {
        self.interface.register_read(number)
    }

    pub fn write_register(&mut self, number: u32, value: u64) -> Result<(), RiscvError> {
        self.interface.register_write(number, value)
    }

    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        self.interface.read_memory(address, size, count, buffer)
    }

    pub fn write_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        self.interface.write_memory(address, size, count, buffer)
    }

    pub fn arch_state(&self) -> Result<(), RiscvError> {
        tracing::debug!(
            "state={:?} reason={:?} dpc={:#x}",
            self.state,
            self.debug_reason,
            self.interface.state().dpc
        );
        Ok(())
    }

    /*** Breakpoints and watchpoints. ***/

    fn install_breakpoint(&mut self, bp: &mut Breakpoint) -> Result<(), RiscvError> {
        match bp.kind {
            BreakpointKind::Software => {
                if bp.length != 2 && bp.length != 4 {
                    return Err(RiscvError::UnsupportedBreakpointKind);
                }
                let length = bp.length as usize;
                let mut orig = [0u8; 4];
                self.interface
                    .read_memory(bp.address, bp.length, 1, &mut orig[..length])
                    .map_err(|e| {
                        tracing::error!(
                            "failed to read original instruction at {:#x}",
                            bp.address
                        );
                        e
                    })?;
                bp.orig_instr = orig;

                let result = if bp.length == 4 {
                    self.interface
                        .write_memory(bp.address, 4, 1, &assembly::EBREAK.to_le_bytes())
                } else {
                    self.interface
                        .write_memory(bp.address, 2, 1, &assembly::EBREAK_C.to_le_bytes())
                };
                result.map_err(|e| {
                    tracing::error!(
                        "failed to write {}-byte breakpoint instruction at {:#x}",
                        bp.length,
                        bp.address
                    );
                    e
                })?;
            }
            BreakpointKind::Hardware => {
                let trigger = Trigger::from_breakpoint(bp);
                self.interface.add_trigger(&trigger)?;
            }
        }
        bp.set = true;
        Ok(())
    }

    fn uninstall_breakpoint(&mut self, bp: &mut Breakpoint) -> Result<(), RiscvError> {
        match bp.kind {
            BreakpointKind::Software => {
                let length = bp.length as usize;
                let orig = bp.orig_instr;
                self.interface
                    .write_memory(bp.address, bp.length, 1, &orig[..length])
                    .map_err(|e| {
                        tracing::error!(
                            "failed to restore instruction for {}-byte breakpoint at {:#x}",
                            bp.length,
                            bp.address
                        );
                        e
                    })?;
            }
            BreakpointKind::Hardware => {
                self.interface.remove_trigger(bp.unique_id)?;
            }
        }
        bp.set = false;
        Ok(())
    }

    pub fn add_breakpoint(&mut self, mut breakpoint: Breakpoint) -> Result<(), RiscvError> {
        self.install_breakpoint(&mut breakpoint)?;
        self.breakpoints.push(breakpoint);
        Ok(())
    }

    pub fn remove_breakpoint(&mut self, unique_id: u32) -> Result<(), RiscvError> {
        let index = self
            .breakpoints
            .iter()
            .position(|bp| bp.unique_id == unique_id)
            .ok_or(RiscvError::TriggerNotFound(unique_id))?;
        let mut breakpoint = self.breakpoints.remove(index);
        self.uninstall_breakpoint(&mut breakpoint)
    }

    fn install_watchpoint(&mut self, wp: &mut Watchpoint) -> Result<(), RiscvError> {
        let trigger = Trigger::from_watchpoint(wp);
        self.interface.add_trigger(&trigger)?;
        wp.set = true;
        Ok(())
    }

    fn uninstall_watchpoint(&mut self, wp: &mut Watchpoint) -> Result<(), RiscvError> {
        self.interface.remove_trigger(wp.unique_id)?;
        wp.set = false;
        Ok(())
    }

    pub fn add_watchpoint(&mut self, mut watchpoint: Watchpoint) -> Result<(), RiscvError> {
        self.install_watchpoint(&mut watchpoint)?;
        self.watchpoints.push(watchpoint);
        Ok(())
    }

    pub fn remove_watchpoint(&mut self, unique_id: u32) -> Result<(), RiscvError> {
        let index = self
            .watchpoints
            .iter()
            .position(|wp| wp.unique_id == unique_id)
            .ok_or(RiscvError::TriggerNotFound(unique_id))?;
        let mut watchpoint = self.watchpoints.remove(index);
        self.uninstall_watchpoint(&mut watchpoint)
    }
}
