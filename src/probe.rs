//! Interface to the low-level JTAG scan layer.
//!
//! The scan layer owns the TAP: it knows the declared IR length, queues
//! IR/DR scans and drains them in order. The driver only ever addresses
//! JTAG data registers by their IR value and shifts LSB-first bit strings
//! through them.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DebugProbeError {
    #[error("probe communication failed: {0}")]
    Probe(String),
    #[error("the scan queue failed to drain: {0}")]
    QueueDrain(String),
}

/// A single queued DR scan against the JTAG register `address`.
///
/// `data` is an LSB-first bit string of `len` bits; `idle_cycles` run-test/
/// idle clocks are inserted after the scan so the target can retire the
/// access before the next one arrives.
#[derive(Debug, Clone)]
pub struct JtagWriteCommand {
    pub address: u32,
    pub data: Vec<u8>,
    pub len: u32,
    pub idle_cycles: u8,
}

/// Access to a JTAG TAP as a set of addressable registers.
///
/// Selecting IR is the implementation's business: every call names the
/// target register and the probe re-selects as needed. The captured DR
/// bits are returned for every scan, including writes — on the debug bus
/// the capture carries the response to the *previous* operation.
pub trait JtagAccess {
    /// Shift `len` bits out of the register at `address`.
    fn read_register(&mut self, address: u32, len: u32) -> Result<Vec<u8>, DebugProbeError>;

    /// Shift `data` into the register at `address`, returning the captured
    /// bits.
    fn write_register(
        &mut self,
        address: u32,
        data: &[u8],
        len: u32,
    ) -> Result<Vec<u8>, DebugProbeError>;

    /// Execute a batch of DR scans strictly in order and return the
    /// captured bits of each, positionally.
    fn write_register_batch(
        &mut self,
        commands: &[JtagWriteCommand],
    ) -> Result<Vec<Vec<u8>>, DebugProbeError>;

    /// Number of run-test/idle cycles inserted after single scans.
    fn set_idle_cycles(&mut self, cycles: u8);

    fn idle_cycles(&self) -> u8;
}
