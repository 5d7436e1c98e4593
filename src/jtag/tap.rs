use std::sync::{Arc, Mutex};

use super::{JtagTap, ShiftPlan};
use crate::{
    FtdiError, FtdiMpsse,
    cable::{TCK_MASK, TDI_MASK, TDO_MASK, TMS_MASK},
    dap::{DapError, ProbeControl},
    mpsse_cmd::MAX_TMS_SHIFT,
};

/// ARM SWJ-DP switch from SWD to JTAG, LSB first.
const SWD_TO_JTAG: u32 = 0xE73C;
const RESET_CLOCKS: usize = 50;
/// Chains longer than this are treated as broken.
const MAX_DEVICES: usize = 32;

/// JTAG (Joint Test Action Group) interface controller on the MPSSE.
///
/// TCK(AD0) idles low, TDI(AD1) changes on the falling edge and TDO(AD2) is
/// sampled on the rising edge, according to AN108-2.2.
pub struct FtdiJtag {
    /// Thread-safe handle to FTDI MPSSE controller
    mtx: Arc<Mutex<FtdiMpsse>>,
}

impl FtdiJtag {
    /// Put the cable into JTAG mode and the TAP into Test-Logic-Reset.
    ///
    /// Cables that tie TDI to TDO for SWD cannot do JTAG and are refused.
    pub fn init(mtx: Arc<Mutex<FtdiMpsse>>) -> Result<Self, FtdiError> {
        {
            let mut lock = mtx.lock().unwrap();
            let cable = lock.cable;
            if !cable.supports_jtag() {
                log::debug!("cable {} shares TDI and TDO", cable.name);
                return Err(FtdiError::NotSupported("JTAG"));
            }
            lock.update_pins(|lower, upper| {
                cable.jtag.apply(lower, upper);
                lower.value = (lower.value | TMS_MASK | TDI_MASK | TDO_MASK) & !TCK_MASK;
                lower.direction = (lower.direction | TMS_MASK | TDI_MASK | TCK_MASK) & !TDO_MASK;
            })?;
        }
        let mut jtag = Self { mtx };
        // SW-DP line reset
        for _ in 0..=RESET_CLOCKS {
            jtag.clock(true, false)?;
        }
        jtag.tms_sequence(SWD_TO_JTAG, 16)?;
        jtag.reset()?;
        jtag.mtx.lock().unwrap().flush()?;
        log::info!("JTAG ready");
        Ok(jtag)
    }

    /// Walk the chain in Shift-DR after reset, where every device presents IDCODE or BYPASS.
    ///
    /// # Returns
    /// One entry per device nearest TDO first: `Some(idcode)`, or `None` for a device in BYPASS.
    pub fn scan_chain(&mut self) -> Result<Vec<Option<u32>>, FtdiError> {
        const ONES: [u8; 4] = [0xFF; 4];
        self.reset()?;
        // Reset -> Idle -> Select-DR -> Capture-DR -> Shift-DR
        self.tms_sequence(0b0010, 4)?;
        let mut idcodes = Vec::new();
        while idcodes.len() < MAX_DEVICES {
            let mut first = [0u8; 1];
            self.shift(Some(&mut first[..]), Some(&ONES[..1]), false, 1)?;
            if first[0] & 1 == 0 {
                idcodes.push(None);
                continue;
            }
            let mut rest = [0u8; 4];
            self.shift(Some(&mut rest[..]), Some(&ONES[..]), false, 31)?;
            let idcode = 1 | u32::from_le_bytes(rest) << 1;
            // TDI ones made it through the chain
            if idcode == u32::MAX {
                break;
            }
            log::debug!("device {}: IDCODE {idcode:#010x}", idcodes.len());
            idcodes.push(Some(idcode));
        }
        if idcodes.len() == MAX_DEVICES {
            log::warn!("JTAG chain did not terminate after {MAX_DEVICES} devices");
        }
        // Shift-DR -> Exit1-DR -> Update-DR -> Idle
        self.tms_sequence(0b011, 3)?;
        self.mtx.lock().unwrap().flush()?;
        Ok(idcodes)
    }

    fn queue_tms(&mut self, bits: u64, count: usize) -> Result<(), FtdiError> {
        let mut lock = self.mtx.lock().unwrap();
        lock.write(|cmd| {
            for start in (0..count).step_by(MAX_TMS_SHIFT) {
                let len = (count - start).min(MAX_TMS_SHIFT);
                cmd.clock_tms_out(true, (bits >> start) as u8, len);
            }
        })
    }
}

impl JtagTap for FtdiJtag {
    fn reset(&mut self) -> Result<(), FtdiError> {
        log::trace!("TAP reset");
        self.queue_tms(u64::MAX, RESET_CLOCKS)
    }

    fn tms_sequence(&mut self, bits: u32, count: usize) -> Result<(), FtdiError> {
        assert!(count <= 32, "at most 32 TMS bits per sequence");
        self.queue_tms(bits as u64, count)
    }

    fn shift(
        &mut self,
        tdo: Option<&mut [u8]>,
        tdi: Option<&[u8]>,
        final_tms: bool,
        ticks: usize,
    ) -> Result<(), FtdiError> {
        if ticks == 0 {
            return Ok(());
        }
        let plan = ShiftPlan::new(ticks, final_tms);
        if let Some(tdi) = tdi {
            assert!(tdi.len() * 8 >= ticks, "TDI buffer shorter than {ticks} bits");
        }
        let read = tdo.is_some();
        let mut lock = self.mtx.lock().unwrap();
        lock.write(|cmd| plan.queue(cmd, tdi, read))?;
        if let Some(tdo) = tdo {
            assert!(tdo.len() * 8 >= ticks, "TDO buffer shorter than {ticks} bits");
            let response = lock.read()?;
            plan.unpack(&response, tdo);
        }
        Ok(())
    }

    fn clock(&mut self, tms: bool, tdi: bool) -> Result<bool, FtdiError> {
        let mut lock = self.mtx.lock().unwrap();
        lock.write(|cmd| {
            cmd.clock_tms(tdi, tms as u8, 1);
        })?;
        let response = lock.read()?;
        Ok(response[0] & 0x80 != 0)
    }
}

impl ProbeControl for FtdiJtag {
    fn reset_line(&mut self, assert: bool) -> Result<(), DapError> {
        Ok(self.mtx.lock().unwrap().set_srst(assert)?)
    }

    fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), DapError> {
        Ok(self.mtx.lock().unwrap().set_clock_divisor(divisor)?)
    }
}

#[cfg(test)]
mod test {
    use std::sync::{Arc, Mutex};

    use itertools::iproduct;

    use super::*;
    use crate::{
        cable::CableDescriptor,
        sim::{Sim, TapState, TapTarget},
    };

    fn open(target: TapTarget) -> (FtdiJtag, Sim) {
        let cable = CableDescriptor::find("ftdi-jtag").unwrap();
        let (mpsse, sim) = Sim::open_with(cable, target);
        let jtag = FtdiJtag::init(Arc::new(Mutex::new(mpsse))).unwrap();
        (jtag, sim)
    }

    fn tap_state(sim: &Sim) -> TapState {
        sim.with_target(|tap: &mut TapTarget| tap.state)
    }

    fn flush(jtag: &FtdiJtag) {
        jtag.mtx.lock().unwrap().flush().unwrap();
    }

    #[test]
    fn init_ends_in_reset() {
        let (_jtag, sim) = open(TapTarget::loopback());
        assert_eq!(tap_state(&sim), TapState::Reset);
        let raw: Vec<u8> = sim.state().raw.concat();
        let switch = [0x4b, 0x06, 0xBC, 0x4b, 0x06, 0xCE, 0x4b, 0x01, 0x83];
        assert!(raw.windows(switch.len()).any(|w| w == switch));
        let pins = sim.state().pins;
        assert_eq!(pins.low_ddr & 0x0F, TCK_MASK | TDI_MASK | TMS_MASK);
        assert_eq!(sim.clocks(), 51 + 16 + 50);
    }

    #[test]
    fn init_refuses_tied_tdi_tdo() {
        let cable = CableDescriptor::find("ftdi-swd-resistor").unwrap();
        let (mpsse, _sim) = Sim::open(cable);
        assert!(matches!(
            FtdiJtag::init(Arc::new(Mutex::new(mpsse))),
            Err(FtdiError::NotSupported(_))
        ));
    }

    #[test]
    fn reset_from_shift_state_then_idle() {
        let (mut jtag, sim) = open(TapTarget::loopback());
        jtag.tms_sequence(0b0010, 4).unwrap();
        flush(&jtag);
        assert_eq!(tap_state(&sim), TapState::ShiftDr);
        jtag.reset().unwrap();
        jtag.tms_sequence(0, 5).unwrap();
        flush(&jtag);
        sim.with_target(|tap: &mut TapTarget| {
            let n = tap.history.len();
            assert!(tap.history[n - 5..].iter().all(|&s| s == TapState::Idle));
        });
    }

    #[test]
    fn shift_loops_back_with_and_without_exit() {
        let (mut jtag, sim) = open(TapTarget::loopback());
        let tdi = [0x5A, 0xC3, 0x96];
        for (ticks, final_tms) in iproduct!(1..=24usize, [false, true]) {
            jtag.reset().unwrap();
            jtag.tms_sequence(0b0010, 4).unwrap();
            let mut tdo = [0u8; 3];
            jtag.shift(Some(&mut tdo[..]), Some(&tdi[..]), final_tms, ticks)
                .unwrap();
            for bit in 0..ticks {
                assert_eq!(
                    tdo[bit / 8] >> (bit % 8) & 1,
                    tdi[bit / 8] >> (bit % 8) & 1,
                    "ticks {ticks} bit {bit}"
                );
            }
            let expected = if final_tms {
                TapState::Exit1Dr
            } else {
                TapState::ShiftDr
            };
            assert_eq!(tap_state(&sim), expected);
        }
    }

    #[test]
    fn thirteen_tick_exit_on_the_wire() {
        let (mut jtag, sim) = open(TapTarget::loopback());
        flush(&jtag);
        sim.clear();
        jtag.shift(None, Some(&[0xA5, 0x1C][..]), true, 13).unwrap();
        flush(&jtag);
        assert_eq!(
            sim.state().raw[0],
            [0x19, 0x00, 0x00, 0xA5, 0x1b, 0x03, 0x1C, 0x4b, 0x00, 0x81]
        );
        let events = sim.state().events.clone();
        let last = events.last().copied();
        assert_eq!(
            last,
            Some(crate::sim::Event::Clock {
                tdi: true,
                tms: true
            })
        );
    }

    #[test]
    fn clock_returns_sampled_tdo() {
        let (mut jtag, _sim) = open(TapTarget::loopback());
        assert!(jtag.clock(false, true).unwrap());
        assert!(!jtag.clock(false, false).unwrap());
    }

    #[test]
    fn scan_finds_idcode() {
        let (mut jtag, sim) = open(TapTarget::with_idcode(0x4BA0_0477));
        assert_eq!(jtag.scan_chain().unwrap(), [Some(0x4BA0_0477)]);
        assert_eq!(tap_state(&sim), TapState::Idle);
    }
}
