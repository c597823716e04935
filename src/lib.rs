//! Debug-target driver for RISC-V harts exposing the Debug-RAM flavour of
//! the debug bus (DTM version 0, Debug Module version 1).
//!
//! The driver talks to the Debug Module by scanning `[op, data, address]`
//! words through the JTAG DR while IR selects the debug bus. All higher
//! level operations — halting, stepping, register and memory access,
//! hardware triggers — are built from one primitive: stage a short
//! instruction snippet in the module's Debug RAM, kick the hart with the
//! debug interrupt, and harvest the results from the RAM data slots.
//!
//! The bus is pipelined by one scan and any transaction may come back BUSY;
//! the transport learns the required idle padding at runtime and only ever
//! grows it.

pub mod assembly;
pub mod dbus;
pub mod error;
pub mod probe;
pub mod registers;
pub mod target;
pub mod triggers;

pub(crate) mod cache;
pub(crate) mod scans;

mod communication_interface;
mod memory_interface;

#[cfg(test)]
pub(crate) mod sim;

pub use communication_interface::RiscvCommunicationInterface;
pub use error::RiscvError;
pub use probe::{DebugProbeError, JtagAccess};
pub use registers::RiscvRegister;
pub use target::{
    Breakpoint, BreakpointKind, DebugReason, RegisterClass, RiscvTarget, TargetEvent, TargetState,
    Watchpoint, WatchpointKind,
};
pub use triggers::Trigger;
