//! ADI register access shared by every transport.
//!
//! [`DapAccess`] and [`ProbeControl`] are implemented both by the vendor
//! adapter in [`crate::stlink`] and, for FTDI cables, by [`SwdDp`] over an
//! [`SwdLine`](crate::swd::SwdLine) plus the line engines themselves.

use crate::{FtdiError, stlink::StlinkError, swd::SwdLine};

/// Register space of one access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Port {
    Dp,
    /// Access port by APSEL index.
    Ap(u8),
}

#[derive(Debug, thiserror::Error)]
pub enum DapError {
    #[error("target answered WAIT")]
    Wait,
    #[error("target answered FAULT")]
    Fault,
    #[error("parity error in read data")]
    Parity,
    #[error("unknown acknowledge {0:#05b}")]
    UnknownAck(u8),
    #[error(transparent)]
    Ftdi(#[from] FtdiError),
    #[error(transparent)]
    Stlink(StlinkError),
}

impl From<StlinkError> for DapError {
    fn from(err: StlinkError) -> Self {
        match err {
            StlinkError::Status(status) if status.is_wait() => DapError::Wait,
            StlinkError::Status(status) if status.is_fault() => DapError::Fault,
            err => DapError::Stlink(err),
        }
    }
}

/// DP/AP register reads and writes. Nothing is retried on WAIT.
pub trait DapAccess {
    fn read_register(&mut self, port: Port, addr: u8) -> Result<u32, DapError>;
    fn write_register(&mut self, port: Port, addr: u8, value: u32) -> Result<(), DapError>;
}

/// Target reset and clock control.
pub trait ProbeControl {
    /// Drive nRST low (`true`) or release it.
    fn reset_line(&mut self, assert: bool) -> Result<(), DapError>;
    fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), DapError>;
}

/// DP register offsets.
pub mod dp {
    pub const DPIDR: u8 = 0x00;
    pub const ABORT: u8 = 0x00;
    pub const CTRL_STAT: u8 = 0x04;
    pub const SELECT: u8 = 0x08;
    pub const RDBUFF: u8 = 0x0C;
}

const ACK_OK: u8 = 0b001;
const ACK_WAIT: u8 = 0b010;
const ACK_FAULT: u8 = 0b100;

/// ARM JTAG-to-SWD select sequence.
const JTAG_TO_SWD: u32 = 0xE79E;
const IDLE_CYCLES: usize = 8;

/// Packet request byte: start, APnDP, RnW, A[3:2], parity, stop, park.
pub(crate) fn request(port: Port, read: bool, addr: u8) -> u8 {
    let bits = (matches!(port, Port::Ap(_)) as u8) << 1 | (read as u8) << 2 | (addr & 0x0C) << 1;
    let parity = ((bits >> 1) & 0x0F).count_ones() as u8 & 1;
    0x81 | bits | parity << 5
}

/// SWD DP transactions over an SWD line engine.
pub struct SwdDp<L> {
    line: L,
    select: Option<u32>,
}

impl<L: SwdLine> SwdDp<L> {
    pub fn new(line: L) -> Self {
        Self { line, select: None }
    }

    pub fn line(&mut self) -> &mut L {
        &mut self.line
    }

    pub fn into_inner(self) -> L {
        self.line
    }

    /// More than 50 clocks with SWDIO high.
    pub fn line_reset(&mut self) -> Result<(), DapError> {
        self.line.seq_out(u32::MAX, 32)?;
        self.line.seq_out(u32::MAX, 28)?;
        Ok(())
    }

    /// Switch an SWJ-DP from JTAG to SWD and return its DPIDR.
    pub fn connect(&mut self) -> Result<u32, DapError> {
        self.select = None;
        self.line_reset()?;
        self.line.seq_out(JTAG_TO_SWD, 16)?;
        self.line_reset()?;
        self.idle()?;
        let idcode = self.read_register(Port::Dp, dp::DPIDR)?;
        log::info!("SW-DP IDCODE {idcode:#010x}");
        Ok(idcode)
    }

    fn idle(&mut self) -> Result<(), DapError> {
        self.line.seq_out(0, IDLE_CYCLES)?;
        Ok(())
    }

    fn transfer(&mut self, port: Port, read: bool, addr: u8, value: u32) -> Result<u32, DapError> {
        self.line.seq_out(request(port, read, addr) as u32, 8)?;
        let ack = self.line.seq_in(3)? as u8;
        match ack {
            ACK_OK => {}
            ACK_WAIT => {
                self.idle()?;
                return Err(DapError::Wait);
            }
            ACK_FAULT => {
                self.idle()?;
                return Err(DapError::Fault);
            }
            ack => {
                log::debug!("{port:?} {addr:#04x}: bad ack {ack:#05b}");
                self.idle()?;
                return Err(DapError::UnknownAck(ack));
            }
        }
        let value = if read {
            let (value, parity_error) = self.line.seq_in_parity(32)?;
            if parity_error {
                self.idle()?;
                return Err(DapError::Parity);
            }
            value
        } else {
            self.line.seq_out_parity(value, 32)?;
            value
        };
        self.idle()?;
        log::trace!(
            "{} {port:?} {addr:#04x} = {value:#010x}",
            if read { "read" } else { "write" }
        );
        Ok(value)
    }

    /// Point SELECT at `ap` and the bank holding `addr`, skipping the write when cached.
    fn select_bank(&mut self, ap: u8, addr: u8) -> Result<(), DapError> {
        let select = (ap as u32) << 24 | (addr as u32 & 0xF0);
        if self.select != Some(select) {
            self.write_register(Port::Dp, dp::SELECT, select)?;
        }
        Ok(())
    }
}

impl<L: SwdLine> DapAccess for SwdDp<L> {
    fn read_register(&mut self, port: Port, addr: u8) -> Result<u32, DapError> {
        match port {
            Port::Dp => self.transfer(port, true, addr, 0),
            Port::Ap(ap) => {
                self.select_bank(ap, addr)?;
                // AP reads are posted, the data arrives with the next read
                self.transfer(port, true, addr, 0)?;
                self.transfer(Port::Dp, true, dp::RDBUFF, 0)
            }
        }
    }

    fn write_register(&mut self, port: Port, addr: u8, value: u32) -> Result<(), DapError> {
        match port {
            Port::Dp if addr == dp::SELECT => {
                self.select = None;
                self.transfer(port, false, addr, value)?;
                self.select = Some(value);
            }
            Port::Dp => {
                self.transfer(port, false, addr, value)?;
            }
            Port::Ap(ap) => {
                self.select_bank(ap, addr)?;
                self.transfer(port, false, addr, value)?;
            }
        }
        Ok(())
    }
}

impl<L: SwdLine + ProbeControl> ProbeControl for SwdDp<L> {
    fn reset_line(&mut self, assert: bool) -> Result<(), DapError> {
        self.line.reset_line(assert)
    }

    fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), DapError> {
        self.line.set_clock_divisor(divisor)
    }
}
