//! Error taxonomy for the driver.
//!
//! Transport-recoverable conditions (BUSY, interrupt still high) never show
//! up here; they are consumed inside the retry loops and only grow the idle
//! delay counters. Everything below is surfaced to the framework.

use crate::dbus::DbusStatus;
use crate::probe::DebugProbeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RiscvError {
    #[error("error during a dbus access: {0:?}")]
    DbusTransfer(DbusStatus),
    #[error("debug probe error")]
    DebugProbe(#[from] DebugProbeError),
    #[error("timeout while waiting for the target")]
    Timeout,
    #[error("dtminfo register read as 0; check JTAG connectivity and board power")]
    DtmNotPresent,
    #[error("unsupported DTM version {0}")]
    UnsupportedDtmVersion(u8),
    #[error("unsupported Debug Module version {0}")]
    UnsupportedDebugModuleVersion(u8),
    #[error("target requires authentication (authtype {0})")]
    AuthenticationRequired(u8),
    #[error("failed to discover xlen: word0={word0:#x}, word1={word1:#x}, exception={exception:#x}")]
    XlenDetectionFailed {
        word0: u32,
        word1: u32,
        exception: u32,
    },
    #[error("{0}-bit harts are not supported beyond detection")]
    UnsupportedXlen(u32),
    #[error("Debug RAM did not read back the value written to word {index}: wrote {expected:#010x}, read {actual:#010x}")]
    DramMismatch {
        index: usize,
        expected: u32,
        actual: u32,
    },
    #[error("hart raised exception {0:#x} while executing a debug snippet")]
    HartException(u32),
    #[error("debug interrupt did not clear")]
    DebugInterruptStuck,
    #[error("no hardware trigger available")]
    TriggerNotAvailable,
    #[error("no hardware trigger owns unique id {0}")]
    TriggerNotFound(u32),
    #[error("unsupported resume mode: {0}")]
    UnsupportedResumeMode(&'static str),
    #[error("don't know how to access register {0}")]
    UnknownRegister(u32),
    #[error("unsupported memory access size: {0}")]
    UnsupportedAccessSize(u32),
    #[error("breakpoint kind not supported")]
    UnsupportedBreakpointKind,
}
