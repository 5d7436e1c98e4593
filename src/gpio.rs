use crate::{FtdiError, mpsse::FtdiMpsse};
use std::sync::{Arc, Mutex};

/// Target nRST as an embedded-hal pin.
///
/// Low means reset is asserted. Driving uses the cable's SRST pin programs and
/// reading goes through the cable's readback input when it has one.
pub struct ResetLine {
    /// Thread-safe handle to FTDI MPSSE controller
    mtx: Arc<Mutex<FtdiMpsse>>,
}

impl ResetLine {
    pub fn new(mtx: Arc<Mutex<FtdiMpsse>>) -> Result<Self, FtdiError> {
        {
            let lock = mtx.lock().unwrap();
            let cable = lock.cable();
            if cable.assert_srst.is_empty() || cable.deassert_srst.is_empty() {
                return Err(FtdiError::NotSupported("SRST"));
            }
        }
        Ok(ResetLine { mtx })
    }

    pub(crate) fn set(&self, assert: bool) -> Result<(), FtdiError> {
        self.mtx.lock().unwrap().set_srst(assert)
    }

    pub(crate) fn asserted(&self) -> Result<bool, FtdiError> {
        self.mtx.lock().unwrap().srst_asserted()
    }

    /// Hold reset for `width_us` microseconds, then release it.
    pub fn pulse(
        &mut self,
        delay: &mut impl eh1::delay::DelayNs,
        width_us: u32,
    ) -> Result<(), FtdiError> {
        self.set(true)?;
        delay.delay_us(width_us);
        self.set(false)
    }
}

impl eh1::digital::Error for FtdiError {
    fn kind(&self) -> eh1::digital::ErrorKind {
        eh1::digital::ErrorKind::Other
    }
}

impl eh1::digital::ErrorType for ResetLine {
    type Error = FtdiError;
}

impl eh1::digital::OutputPin for ResetLine {
    fn set_low(&mut self) -> Result<(), FtdiError> {
        self.set(true)
    }

    fn set_high(&mut self) -> Result<(), FtdiError> {
        self.set(false)
    }
}

impl eh1::digital::InputPin for ResetLine {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        self.asserted().map(|asserted| !asserted)
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        self.asserted()
    }
}
