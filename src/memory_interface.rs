//! Bulk target memory access through generated load/store snippets.
//!
//! A four-word preamble is staged once; each batch iteration then only
//! rewrites the address (reads) or data (writes) slot with the interrupt
//! bit set, so the hart re-executes the preamble per element while the
//! scans stream through the probe. Results trail the requests by two
//! scans.

use crate::assembly::{self, S0, S1, T0, ZERO};
use crate::cache::{dram_address, Slot};
use crate::communication_interface::{RiscvCommunicationInterface, CACHE_NO_READ};
use crate::dbus::{DbusStatus, DBUS_DATA_START, DEBUG_RAM_START, DMCONTROL_INTERRUPT};
use crate::error::RiscvError;

const MAX_BATCH_SIZE: usize = 256;

impl RiscvCommunicationInterface {
    /// Read `count` elements of `size` bytes (1, 2 or 4) starting at
    /// `address` into `buffer`.
    pub fn read_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &mut [u8],
    ) -> Result<(), RiscvError> {
        debug_assert!(buffer.len() >= (size * count) as usize);

        self.cache_set32(0, assembly::lw(S0, ZERO, DEBUG_RAM_START + 16));
        match size {
            1 => self.cache_set32(1, assembly::lb(S1, S0, 0)),
            2 => self.cache_set32(1, assembly::lh(S1, S0, 0)),
            4 => self.cache_set32(1, assembly::lw(S1, S0, 0)),
            _ => {
                tracing::error!("unsupported size: {}", size);
                return Err(RiscvError::UnsupportedAccessSize(size));
            }
        }
        self.cache_set32(2, assembly::sw(S1, ZERO, DEBUG_RAM_START + 16));
        self.cache_set_jump(3);
        self.cache_write(CACHE_NO_READ, false)?;

        let exception_addr = dram_address(self.dramsize() - 1);
        let mut scans = self.new_batch(MAX_BATCH_SIZE);

        let mut result_value = 0x777u32;
        let mut i = 0u32;
        while i < count + 3 {
            let batch_size = ((count + 3 - i) as usize).min(MAX_BATCH_SIZE);
            scans.reset(
                self.state().dbus_busy_delay,
                self.state().interrupt_high_delay,
            );

            for j in 0..batch_size as u32 {
                let k = i + j;
                if k == count {
                    // Just insert a read so we can scan out the last value.
                    scans.add_read32(4, false);
                } else if k >= count + 1 {
                    // And check for errors.
                    scans.add_read32(exception_addr, false);
                } else {
                    // Write the next address and kick the hart.
                    scans.add_write32(4, address + size * k, true);
                }
            }

            self.execute_batch(&mut scans)?;

            let mut dbus_busy = false;
            let mut execute_busy = false;
            for j in 0..batch_size {
                let resp = scans.response(j);
                match DbusStatus::parse(resp.status) {
                    Some(DbusStatus::Success) => {}
                    Some(DbusStatus::Busy) => dbus_busy = true,
                    Some(DbusStatus::Failed) | None => {
                        tracing::error!("Debug RAM write failed. Hardware error?");
                        return Err(RiscvError::DbusTransfer(DbusStatus::Failed));
                    }
                }
                if resp.data & DMCONTROL_INTERRUPT != 0 {
                    execute_busy = true;
                }
                let k = i + j as u32;
                if k == count + 2 {
                    result_value = resp.data as u32;
                } else if k > 1 {
                    // The data for element n arrives two scans after its
                    // address went out.
                    let offset = (size * (k - 2)) as usize;
                    let bytes = (resp.data as u32).to_le_bytes();
                    buffer[offset..offset + size as usize]
                        .copy_from_slice(&bytes[..size as usize]);
                }
                tracing::debug!("j={} status={} data={:09x}", j, resp.status, resp.data);
            }

            if dbus_busy {
                self.increase_dbus_busy_delay();
            }
            if execute_busy {
                self.increase_interrupt_high_delay();
            }
            if dbus_busy || execute_busy {
                self.wait_for_debugint_clear(false)?;
                tracing::info!(
                    "retrying memory read starting from {:#x} with more delays",
                    address + size * i
                );
            } else {
                i += batch_size as u32;
            }
        }

        self.state_mut().dram_cache.clean(true);

        if result_value != 0 {
            tracing::error!(
                "core got an exception ({:#x}) while reading from {:#x}",
                result_value,
                address + size * count.saturating_sub(1)
            );
            if count > 1 {
                tracing::error!(
                    "(it may have failed between {:#x} and {:#x} as well, but we didn't check then)",
                    address,
                    address + size * (count - 1) - 1
                );
            }
            return Err(RiscvError::HartException(result_value));
        }

        Ok(())
    }

    fn setup_write_memory(&mut self, size: u32) -> Result<(), RiscvError> {
        match size {
            1 => {
                self.cache_set32(0, assembly::lb(S0, ZERO, DEBUG_RAM_START + 16));
                self.cache_set32(1, assembly::sb(S0, T0, 0));
            }
            2 => {
                self.cache_set32(0, assembly::lh(S0, ZERO, DEBUG_RAM_START + 16));
                self.cache_set32(1, assembly::sh(S0, T0, 0));
            }
            4 => {
                self.cache_set32(0, assembly::lw(S0, ZERO, DEBUG_RAM_START + 16));
                self.cache_set32(1, assembly::sw(S0, T0, 0));
            }
            _ => {
                tracing::error!("unsupported size: {}", size);
                return Err(RiscvError::UnsupportedAccessSize(size));
            }
        }
        self.cache_set32(2, assembly::addi(T0, T0, size));
        self.cache_set_jump(3);
        self.cache_write(4, false)
    }

    /// Write `count` elements of `size` bytes (1, 2 or 4) from `buffer`
    /// to target memory starting at `address`.
    ///
    /// T0 walks the target address; the caller's value is parked in SLOT1
    /// and restored afterwards.
    pub fn write_memory(
        &mut self,
        address: u32,
        size: u32,
        count: u32,
        buffer: &[u8],
    ) -> Result<(), RiscvError> {
        debug_assert!(buffer.len() >= (size * count) as usize);

        // Set up the address.
        self.cache_set_store(0, T0, Slot::Slot1);
        self.cache_set_load(1, T0, Slot::Slot0);
        self.cache_set_jump(2);
        self.cache_set(Slot::Slot0, address as u64);
        self.cache_write(5, true)?;

        let t0 = self.cache_get(Slot::Slot1)?;
        tracing::debug!("t0 is {:#x}", t0);

        self.setup_write_memory(size)?;

        let exception_addr = dram_address(self.dramsize() - 1);
        let mut scans = self.new_batch(MAX_BATCH_SIZE);

        let mut result_value = 0x777u32;
        let mut i = 0u32;
        while i < count + 2 {
            let batch_size = ((count + 2 - i) as usize).min(MAX_BATCH_SIZE);
            scans.reset(
                self.state().dbus_busy_delay,
                self.state().interrupt_high_delay,
            );

            for j in 0..batch_size as u32 {
                let k = i + j;
                if k >= count {
                    // Check for an exception.
                    scans.add_read32(exception_addr, false);
                } else {
                    // Write the next value and kick the hart.
                    let offset = (size * k) as usize;
                    let value = match size {
                        1 => buffer[offset] as u32,
                        2 => u16::from_le_bytes([buffer[offset], buffer[offset + 1]]) as u32,
                        _ => u32::from_le_bytes([
                            buffer[offset],
                            buffer[offset + 1],
                            buffer[offset + 2],
                            buffer[offset + 3],
                        ]),
                    };
                    scans.add_write32(4, value, true);
                }
            }

            self.execute_batch(&mut scans)?;

            let mut dbus_busy = false;
            let mut execute_busy = false;
            for j in 0..batch_size {
                let resp = scans.response(j);
                match DbusStatus::parse(resp.status) {
                    Some(DbusStatus::Success) => {}
                    Some(DbusStatus::Busy) => dbus_busy = true,
                    Some(DbusStatus::Failed) | None => {
                        tracing::error!("Debug RAM write failed. Hardware error?");
                        return Err(RiscvError::DbusTransfer(DbusStatus::Failed));
                    }
                }
                let interrupt = scans.get_u32(j, DBUS_DATA_START + 33, 1);
                if interrupt != 0 {
                    execute_busy = true;
                }
                if i + j as u32 == count + 1 {
                    result_value = resp.data as u32;
                }
            }

            if dbus_busy {
                self.increase_dbus_busy_delay();
            }
            if execute_busy {
                self.increase_interrupt_high_delay();
            }
            if dbus_busy || execute_busy {
                self.wait_for_debugint_clear(false)?;

                // Retry. Set T0 back to what it should have been at the
                // beginning of this batch.
                tracing::info!(
                    "retrying memory write starting from {:#x} with more delays",
                    address + size * i
                );
                self.state_mut().dram_cache.clean(true);
                self.write_gpr(T0, (address + size * i) as u64)?;
                self.setup_write_memory(size)?;
            } else {
                i += batch_size as u32;
            }
        }

        self.state_mut().dram_cache.clean(true);

        if result_value != 0 {
            tracing::error!(
                "core got an exception ({:#x}) while writing to {:#x}",
                result_value,
                address + size * count.saturating_sub(1)
            );
            if count > 1 {
                tracing::error!(
                    "(it may have failed between {:#x} and {:#x} as well, but we didn't check then)",
                    address,
                    address + size * (count - 1) - 1
                );
            }
            return Err(RiscvError::HartException(result_value));
        }

        self.register_write(T0, t0)
    }
}
