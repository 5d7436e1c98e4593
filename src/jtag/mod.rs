//! JTAG TAP engine on the MPSSE shift unit.

mod shift;
mod tap;

pub use shift::ShiftPlan;
pub use tap::FtdiJtag;

use crate::FtdiError;

/// Primitive TAP operations. TMS and TDI bits are clocked LSB first.
pub trait JtagTap {
    /// Force Test-Logic-Reset with 50 TMS=1 clocks.
    fn reset(&mut self) -> Result<(), FtdiError>;
    /// Clock `count` TMS bits taken from `bits`, bit 0 first. TDI is held high.
    fn tms_sequence(&mut self, bits: u32, count: usize) -> Result<(), FtdiError>;
    /// Clock `ticks` bits of `tdi` while capturing TDO into `tdo`.
    ///
    /// When `final_tms` is set the last bit is clocked with TMS=1, leaving Shift-xR.
    fn shift(
        &mut self,
        tdo: Option<&mut [u8]>,
        tdi: Option<&[u8]>,
        final_tms: bool,
        ticks: usize,
    ) -> Result<(), FtdiError>;
    /// Clock a single edge and return the sampled TDO.
    fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool, FtdiError>;
}
