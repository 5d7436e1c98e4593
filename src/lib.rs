//! Debug-probe transport for ARM targets over FTDI MPSSE cables and ST-Link adapters.
//!
//! The crate turns abstract debug operations (DP/AP register access, memory and
//! core-register access, reset, clock) into bit-exact signal sequences. Two
//! families of transport are provided:
//!
//! * FTDI cables driven through the MPSSE, either with the genuine shift engine
//!   or by bit-banging the SWDIO line. See [`swd`], [`jtag`] and [`cable`].
//! * ST-Link v2/v2-1/v3 adapters speaking the vendor USB protocol. See [`stlink`].
//!
//! Both sides implement [`DapAccess`] and [`ProbeControl`], so code one layer up
//! does not need to know which transport is attached.
//!
//! # Quickstart
//!
//! * Linux users only: Add udev rules for the FTDI and ST-Link VID/PID pairs.
//!
//! # Limitations
//!
//! * Limited device support: FT2232D, FT232H, FT2232H, FT4232H.
//! * ST-Link v1 is not supported.

#![forbid(unsafe_code)]

pub mod cable;
pub mod dap;
mod ftdaye;
pub mod gpio;
pub mod jtag;
mod list;
pub use list::{FtdiDeviceInfo, StlinkDeviceInfo, list_ftdi_devices, list_stlink_devices};
pub mod mpsse;
mod mpsse_cmd;
pub mod stlink;
pub mod swd;
pub mod usb;

#[cfg(test)]
mod sim;

pub use cable::CableDescriptor;
pub use dap::{DapAccess, DapError, Port, ProbeControl, SwdDp};
pub use mpsse::FtdiMpsse;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChipType {
    Am,
    Bm,
    FT2232D,
    R,
    FT2232H,
    FT4232H,
    FT232H,
    FT230X,
}
impl ChipType {
    pub(crate) const fn interface_list(self) -> &'static [Interface] {
        match self {
            ChipType::FT232H => &[Interface::A],
            ChipType::FT2232H | ChipType::FT2232D => &[Interface::A, Interface::B],
            ChipType::FT4232H => &[Interface::A, Interface::B, Interface::C, Interface::D],
            _ => &[],
        }
    }
    pub(crate) const fn mpsse_list(self) -> &'static [Interface] {
        match self {
            ChipType::FT232H | ChipType::FT2232D => &[Interface::A],
            ChipType::FT2232H | ChipType::FT4232H => &[Interface::A, Interface::B],
            _ => &[],
        }
    }
    /// Size of the chip's buffer towards the host. Commands stall once it holds this many unread bytes.
    pub(crate) const fn response_buffer(self) -> usize {
        match self {
            ChipType::FT2232D => 384,
            ChipType::FT232H => 1024,
            _ => 4096,
        }
    }
    /// Base clock of the MPSSE and whether the divide-by-5 prescaler must be set.
    pub(crate) const fn max_frequency(self) -> (usize, Option<bool>) {
        match self {
            ChipType::FT2232D => (6_000_000, None),
            ChipType::FT232H | ChipType::FT2232H | ChipType::FT4232H => (30_000_000, Some(false)),
            _ => (0, None),
        }
    }
}
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Interface {
    A = 1,
    B = 2,
    C = 3,
    D = 4,
}

impl Interface {
    pub(crate) const fn read_ep(self) -> u8 {
        match self {
            Interface::A => 0x81,
            Interface::B => 0x83,
            Interface::C => 0x85,
            Interface::D => 0x87,
        }
    }

    pub(crate) const fn write_ep(self) -> u8 {
        match self {
            Interface::A => 0x02,
            Interface::B => 0x04,
            Interface::C => 0x06,
            Interface::D => 0x08,
        }
    }

    pub(crate) const fn index(self) -> u16 {
        self as u16
    }

    pub(crate) const fn interface_number(self) -> u8 {
        (self as u8) - 1
    }
}

/// One GPIO line of the MPSSE, by port and bit index.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Pin {
    Lower(usize),
    Upper(usize),
}
impl Pin {
    pub(crate) const fn mask(self) -> u8 {
        match self {
            Pin::Lower(idx) | Pin::Upper(idx) => 1 << idx,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FtdiError {
    #[error("A USB transport error occurred.")]
    ///
    /// This variant is used for all errors reported by the operating system when performing a USB
    /// operation. It may indicate that the USB device was unplugged, that another application or an
    /// operating system driver is currently using it, or that the current user does not have
    /// permission to access it.
    Usb(#[from] std::io::Error),

    #[error("USB transfer failed: {0}")]
    Transfer(#[from] usb::UsbError),

    #[error("Open failed: {0}")]
    /// Error occurs when open.
    OpenFailed(String),

    #[error("Unsupported chip type: {0:?}")]
    /// The connected device is not supported by the driver.
    UnsupportedChip(ChipType),

    #[error("Bad Mpsse Command: {0:#x}")]
    BadMpsseCommand(u8),

    #[error("Short write: {written} of {expected} bytes")]
    /// The queued commands are lost, nothing may be assumed about partial application.
    ShortWrite { expected: usize, written: usize },

    #[error("Short read: {read} of {expected} bytes")]
    ShortRead { expected: usize, read: usize },

    #[error("Cable does not support {0}")]
    /// The cable descriptor lacks the signals needed for the requested mode.
    NotSupported(&'static str),
}
