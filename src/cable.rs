//! Cable descriptors and transport selection.
//!
//! A cable is described purely by which MPSSE port bits have to change for each
//! signal role. Which SWD backend a cable gets is derived once from the populated
//! roles and never changes afterwards.

use crate::{Interface, Pin, mpsse::GpioByte};

/// SK, clocks TCK or SWCLK.
pub const TCK_MASK: u8 = 1 << 0;
/// DO, drives TDI or (through the shift engine) SWDIO.
pub const TDI_MASK: u8 = 1 << 1;
/// DI, samples TDO or SWDIO.
pub const TDO_MASK: u8 = 1 << 2;
/// CS, drives TMS or (bit-banged) SWDIO.
pub const TMS_MASK: u8 = 1 << 3;

/// Bits to force high and low within one 8-bit register.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortBits {
    pub set: u8,
    pub clear: u8,
}

impl PortBits {
    pub const NONE: PortBits = PortBits { set: 0, clear: 0 };

    pub const fn set(set: u8) -> Self {
        PortBits { set, clear: 0 }
    }

    pub const fn clear(clear: u8) -> Self {
        PortBits { set: 0, clear }
    }

    const fn is_empty(&self) -> bool {
        self.set == 0 && self.clear == 0
    }

    fn apply(&self, value: &mut u8) {
        *value |= self.set;
        *value &= !self.clear;
    }
}

/// Level and direction changes on both ports that put the cable into one signal role.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PinProgram {
    pub data_low: PortBits,
    pub ddr_low: PortBits,
    pub data_high: PortBits,
    pub ddr_high: PortBits,
}

impl PinProgram {
    pub const NONE: PinProgram = PinProgram {
        data_low: PortBits::NONE,
        ddr_low: PortBits::NONE,
        data_high: PortBits::NONE,
        ddr_high: PortBits::NONE,
    };

    pub const fn is_empty(&self) -> bool {
        self.data_low.is_empty()
            && self.ddr_low.is_empty()
            && self.data_high.is_empty()
            && self.ddr_high.is_empty()
    }

    pub(crate) fn apply(&self, lower: &mut GpioByte, upper: &mut GpioByte) {
        self.data_low.apply(&mut lower.value);
        self.ddr_low.apply(&mut lower.direction);
        self.data_high.apply(&mut upper.value);
        self.ddr_high.apply(&mut upper.direction);
    }
}

/// Power-on level and direction of both ports.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PortImage {
    pub data_low: u8,
    pub ddr_low: u8,
    pub data_high: u8,
    pub ddr_high: u8,
}

/// How SWDIO is driven and sampled on a given cable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdBackend {
    /// SWDIO on DO/DI through the shift engine, direction switched by the cable's pin programs.
    Mpsse,
    /// SWDIO wired straight to the TMS pin, direction switched by its own output enable.
    DirectBitbang,
    /// SWDIO driven on TMS through an external buffer, sampled on a separate input pin.
    SwitchedBitbang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CableDescriptor {
    pub name: &'static str,
    pub description: &'static str,
    pub vendor_id: u16,
    pub product_id: u16,
    pub interface: Interface,
    pub init: PortImage,
    pub jtag: PinProgram,
    /// Release SWDIO in shift-engine mode.
    pub mpsse_swd_read: PinProgram,
    /// Drive SWDIO in shift-engine mode.
    pub mpsse_swd_write: PinProgram,
    /// Release SWDIO in bit-bang mode.
    pub bb_swd_read: PinProgram,
    /// Drive SWDIO in bit-bang mode.
    pub bb_swd_write: PinProgram,
    /// Where SWDIO is sampled in bit-bang mode.
    pub bb_swdio_in: Option<Pin>,
    pub assert_srst: PinProgram,
    pub deassert_srst: PinProgram,
    /// Input that reads back the reset line.
    pub srst_readback: Option<Pin>,
}

impl CableDescriptor {
    /// Select the SWD backend, or `None` when the cable cannot do SWD.
    pub fn swd_backend(&self) -> Option<SwdBackend> {
        let bb_programs = !self.bb_swd_read.is_empty() || !self.bb_swd_write.is_empty();
        if !self.mpsse_swd_read.is_empty() && !self.mpsse_swd_write.is_empty() {
            Some(SwdBackend::Mpsse)
        } else if !bb_programs && self.bb_swdio_in == Some(Pin::Lower(3)) {
            Some(SwdBackend::DirectBitbang)
        } else if bb_programs && self.bb_swdio_in.is_some() {
            Some(SwdBackend::SwitchedBitbang)
        } else {
            None
        }
    }

    /// JTAG needs TDI and TDO on separate wires. A cable whose SWD read and write
    /// programs are identical has them tied together.
    pub fn supports_jtag(&self) -> bool {
        self.mpsse_swd_read.is_empty() || self.mpsse_swd_read != self.mpsse_swd_write
    }

    pub fn find(name: &str) -> Option<&'static CableDescriptor> {
        KNOWN_CABLES.iter().find(|cable| cable.name == name)
    }
}

const FTDI_VID: u16 = 0x0403;
/// GPIOL1, open-drain nSRST on the generic layouts.
const NSRST: u8 = 1 << 5;
/// GPIOL0, SWDIO buffer output enable.
const SWDIO_OE_LOW: u8 = 1 << 4;
/// GPIOH0, SWDIO buffer output enable.
const SWDIO_OE_HIGH: u8 = 1 << 0;

const SRST_ASSERT: PinProgram = PinProgram {
    data_low: PortBits::clear(NSRST),
    ddr_low: PortBits::set(NSRST),
    ..PinProgram::NONE
};
const SRST_DEASSERT: PinProgram = PinProgram {
    ddr_low: PortBits::clear(NSRST),
    ..PinProgram::NONE
};

/// Generic wiring layouts for FTDI based probes.
pub static KNOWN_CABLES: &[CableDescriptor] = &[
    CableDescriptor {
        name: "ftdi-jtag",
        description: "FT2232H, plain JTAG on ADBUS0-3, nSRST on GPIOL1",
        vendor_id: FTDI_VID,
        product_id: 0x6010,
        interface: Interface::A,
        init: PortImage {
            data_low: TMS_MASK,
            ddr_low: TCK_MASK | TDI_MASK | TMS_MASK,
            data_high: 0,
            ddr_high: 0,
        },
        jtag: PinProgram::NONE,
        mpsse_swd_read: PinProgram::NONE,
        mpsse_swd_write: PinProgram::NONE,
        bb_swd_read: PinProgram::NONE,
        bb_swd_write: PinProgram::NONE,
        bb_swdio_in: None,
        assert_srst: SRST_ASSERT,
        deassert_srst: SRST_DEASSERT,
        srst_readback: Some(Pin::Lower(5)),
    },
    CableDescriptor {
        name: "ftdi-swd-resistor",
        description: "FT232H, SWDIO on DI with a series resistor from DO",
        vendor_id: FTDI_VID,
        product_id: 0x6014,
        interface: Interface::A,
        init: PortImage {
            data_low: TDI_MASK,
            ddr_low: TCK_MASK | TDI_MASK,
            data_high: 0,
            ddr_high: 0,
        },
        jtag: PinProgram::NONE,
        mpsse_swd_read: PinProgram {
            data_low: PortBits::set(TDI_MASK),
            ..PinProgram::NONE
        },
        mpsse_swd_write: PinProgram {
            data_low: PortBits::set(TDI_MASK),
            ..PinProgram::NONE
        },
        bb_swd_read: PinProgram::NONE,
        bb_swd_write: PinProgram::NONE,
        bb_swdio_in: None,
        assert_srst: PinProgram::NONE,
        deassert_srst: PinProgram::NONE,
        srst_readback: None,
    },
    CableDescriptor {
        name: "ftdi-swd-buffered",
        description: "FT2232H, JTAG or SWD, DO buffer enabled by GPIOH0",
        vendor_id: FTDI_VID,
        product_id: 0x6010,
        interface: Interface::A,
        init: PortImage {
            data_low: TMS_MASK,
            ddr_low: TCK_MASK | TDI_MASK | TMS_MASK,
            data_high: SWDIO_OE_HIGH,
            ddr_high: SWDIO_OE_HIGH,
        },
        jtag: PinProgram {
            data_high: PortBits::set(SWDIO_OE_HIGH),
            ..PinProgram::NONE
        },
        mpsse_swd_read: PinProgram {
            data_high: PortBits::clear(SWDIO_OE_HIGH),
            ..PinProgram::NONE
        },
        mpsse_swd_write: PinProgram {
            data_high: PortBits::set(SWDIO_OE_HIGH),
            ..PinProgram::NONE
        },
        bb_swd_read: PinProgram::NONE,
        bb_swd_write: PinProgram::NONE,
        bb_swdio_in: None,
        assert_srst: SRST_ASSERT,
        deassert_srst: SRST_DEASSERT,
        srst_readback: Some(Pin::Lower(5)),
    },
    CableDescriptor {
        name: "ftdi-swd-direct",
        description: "FT232H, SWDIO wired to TMS, SWCLK to TCK",
        vendor_id: FTDI_VID,
        product_id: 0x6014,
        interface: Interface::A,
        init: PortImage {
            data_low: TMS_MASK,
            ddr_low: TCK_MASK,
            data_high: 0,
            ddr_high: 0,
        },
        jtag: PinProgram::NONE,
        mpsse_swd_read: PinProgram::NONE,
        mpsse_swd_write: PinProgram::NONE,
        bb_swd_read: PinProgram::NONE,
        bb_swd_write: PinProgram::NONE,
        bb_swdio_in: Some(Pin::Lower(3)),
        assert_srst: SRST_ASSERT,
        deassert_srst: SRST_DEASSERT,
        srst_readback: None,
    },
    CableDescriptor {
        name: "ftdi-swd-switched",
        description: "FT2232H, SWDIO out on TMS through a buffer enabled by GPIOL0, in on TDO",
        vendor_id: FTDI_VID,
        product_id: 0x6010,
        interface: Interface::B,
        init: PortImage {
            data_low: TMS_MASK,
            ddr_low: TCK_MASK | TMS_MASK | SWDIO_OE_LOW,
            data_high: 0,
            ddr_high: 0,
        },
        jtag: PinProgram::NONE,
        mpsse_swd_read: PinProgram::NONE,
        mpsse_swd_write: PinProgram::NONE,
        bb_swd_read: PinProgram {
            data_low: PortBits::clear(SWDIO_OE_LOW),
            ..PinProgram::NONE
        },
        bb_swd_write: PinProgram {
            data_low: PortBits::set(SWDIO_OE_LOW),
            ..PinProgram::NONE
        },
        bb_swdio_in: Some(Pin::Lower(2)),
        assert_srst: SRST_ASSERT,
        deassert_srst: SRST_DEASSERT,
        srst_readback: Some(Pin::Lower(5)),
    },
];
