//! On-wire format of the debug bus.
//!
//! A dbus scan word is `addrbits + 2 + 34` bits, LSB first:
//!
//! ```text
//! [0 ..  1]        op       (2 bits)
//! [2 .. 35]        data     (34 bits)
//! [36 .. 36+a-1]   address  (a = addrbits)
//! ```
//!
//! The two high data bits carry the `haltnot` and `interrupt` latches.
//! All packing works on explicit bit offsets in little-endian bit order,
//! never through native integer aliasing.

use bitfield::bitfield;
use bitvec::field::BitField;
use bitvec::order::Lsb0;
use bitvec::slice::BitSlice;

/// JTAG IR value selecting the `dtminfo` register.
pub const DTMINFO: u32 = 0x10;

/// Width of the `dtminfo` register.
pub const DTMINFO_WIDTH: u32 = 32;

/// JTAG IR value selecting the debug bus.
pub const DBUS: u32 = 0x11;

pub const DBUS_OP_START: usize = 0;
pub const DBUS_OP_SIZE: usize = 2;
pub const DBUS_DATA_START: usize = 2;
pub const DBUS_DATA_SIZE: usize = 34;
pub const DBUS_ADDRESS_START: usize = 36;

/// Debug bus address of the `dmcontrol` register.
pub const DMCONTROL: u16 = 0x10;

/// Debug bus address of the `dminfo` register.
pub const DMINFO: u16 = 0x11;

/// A store to this address tells the DM that the hart has halted.
pub const SETHALTNOT: u32 = 0x10c;

pub const DMCONTROL_INTERRUPT: u64 = 1 << 33;
pub const DMCONTROL_HALTNOT: u64 = 1 << 32;

pub const DEBUG_ROM_START: u32 = 0x800;
pub const DEBUG_ROM_RESUME: u32 = DEBUG_ROM_START + 4;
pub const DEBUG_ROM_EXCEPTION: u32 = DEBUG_ROM_START + 8;
pub const DEBUG_RAM_START: u32 = 0x400;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbusOp {
    Nop = 0,
    Read = 1,
    Write = 2,
}

/// Status returned in the op field of an incoming scan.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DbusStatus {
    Success = 0,
    Failed = 2,
    Busy = 3,
}

impl DbusStatus {
    pub fn parse(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            2 => Some(Self::Failed),
            3 => Some(Self::Busy),
            _ => None,
        }
    }
}

/// Store `num` bits of `value` at bit offset `first` of `buf`.
pub fn buf_set(buf: &mut [u8], first: usize, num: usize, value: u64) {
    let bits = BitSlice::<u8, Lsb0>::from_slice_mut(buf);
    bits[first..first + num].store_le(value);
}

/// Load `num` bits at bit offset `first` of `buf`.
pub fn buf_get(buf: &[u8], first: usize, num: usize) -> u64 {
    let bits = BitSlice::<u8, Lsb0>::from_slice(buf);
    bits[first..first + num].load_le()
}

/// Pack one outgoing dbus scan word.
pub fn pack_dbus_scan(buf: &mut [u8], op: DbusOp, data: u64, address: u16, addrbits: u8) {
    buf_set(buf, DBUS_OP_START, DBUS_OP_SIZE, op as u64);
    buf_set(buf, DBUS_DATA_START, DBUS_DATA_SIZE, data & 0x3_ffff_ffff);
    let address_mask = (1u64 << addrbits) - 1;
    buf_set(
        buf,
        DBUS_ADDRESS_START,
        addrbits as usize,
        address as u64 & address_mask,
    );
}

/// Fields of one incoming dbus scan word.
#[derive(Debug, Copy, Clone)]
pub struct DbusResponse {
    pub status: u8,
    pub data: u64,
    pub address: u16,
}

pub fn unpack_dbus_scan(buf: &[u8], addrbits: u8) -> DbusResponse {
    DbusResponse {
        status: buf_get(buf, DBUS_OP_START, DBUS_OP_SIZE) as u8,
        data: buf_get(buf, DBUS_DATA_START, DBUS_DATA_SIZE),
        address: buf_get(buf, DBUS_ADDRESS_START, addrbits as usize) as u16,
    }
}

bitfield! {
    /// The `dtminfo` register, reachable through its own JTAG IR value.
    pub struct Dtminfo(u32);
    impl Debug;

    pub addrbits, _: 7, 4;
    pub version, _: 3, 0;
}

bitfield! {
    /// The `dminfo` debug bus register.
    pub struct Dminfo(u32);
    impl Debug;

    pub abussize, _: 31, 25;
    pub serialcount, _: 24, 21;
    pub access128, _: 20;
    pub access64, _: 19;
    pub access32, _: 18;
    pub access16, _: 17;
    pub access8, _: 16;
    pub dramsize, _: 15, 10;
    pub authenticated, _: 5;
    pub authbusy, _: 4;
    pub authtype, _: 3, 2;
    pub version, _: 1, 0;
}
