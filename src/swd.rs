//! SWD line engine.
//!
//! SWDIO is either shifted by the MPSSE data unit (TDI drives, TDO samples) or
//! bit-banged on TMS, with the input read back through a GPIO. Which one is
//! fixed by the cable at [`FtdiSwd::init`].

use std::sync::{Arc, Mutex};

use crate::{
    FtdiError, FtdiMpsse, Pin,
    cable::{SwdBackend, TCK_MASK, TDI_MASK, TDO_MASK, TMS_MASK},
    dap::{DapError, ProbeControl},
    jtag::ShiftPlan,
};

/// Who drives SWDIO.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwdDirection {
    /// Host drives.
    Drive,
    /// Host released the line.
    Float,
}

/// Bit-level SWD primitives. Values are clocked LSB first.
pub trait SwdLine {
    /// Hand SWDIO over, one clock without data. No-op when already in `direction`.
    fn turnaround(&mut self, direction: SwdDirection) -> Result<(), FtdiError>;
    fn bit_in(&mut self) -> Result<bool, FtdiError>;
    fn bit_out(&mut self, bit: bool) -> Result<(), FtdiError>;
    fn seq_in(&mut self, ticks: usize) -> Result<u32, FtdiError>;
    /// Read a 32-bit word and its parity bit. Returns the word and whether the parity mismatched.
    fn seq_in_parity(&mut self, ticks: usize) -> Result<(u32, bool), FtdiError>;
    fn seq_out(&mut self, value: u32, ticks: usize) -> Result<(), FtdiError>;
    /// Write a 32-bit word followed by its even parity bit.
    fn seq_out_parity(&mut self, value: u32, ticks: usize) -> Result<(), FtdiError>;
}

/// SWD on an FTDI cable.
pub struct FtdiSwd {
    mtx: Arc<Mutex<FtdiMpsse>>,
    backend: SwdBackend,
    direction: SwdDirection,
    /// Pin sampled in bit-bang mode.
    swdio_in: Pin,
}

impl Drop for FtdiSwd {
    fn drop(&mut self) {
        let mut lock = self.mtx.lock().unwrap();
        if let Err(e) = lock.flush() {
            log::warn!("SWD flush on drop failed: {e}");
        }
    }
}

impl FtdiSwd {
    /// Put the cable into SWD mode with SWDIO released.
    ///
    /// Fails when the cable describes no way of driving SWDIO.
    pub fn init(mtx: Arc<Mutex<FtdiMpsse>>) -> Result<Self, FtdiError> {
        let (backend, swdio_in) = {
            let mut lock = mtx.lock().unwrap();
            let cable = lock.cable;
            let Some(backend) = cable.swd_backend() else {
                log::debug!("cable {} has no SWD pin programs", cable.name);
                return Err(FtdiError::NotSupported("SWD"));
            };
            let swdio_in = cable.bb_swdio_in.unwrap_or(Pin::Lower(2));
            lock.update_pins(|lower, upper| {
                lower.value = (lower.value | TMS_MASK | TDO_MASK | TDI_MASK) & !TCK_MASK;
                lower.direction = (lower.direction | TCK_MASK) & !(TMS_MASK | TDO_MASK | TDI_MASK);
                match backend {
                    SwdBackend::Mpsse => cable.mpsse_swd_read.apply(lower, upper),
                    SwdBackend::DirectBitbang => {}
                    SwdBackend::SwitchedBitbang => {
                        cable.bb_swd_read.apply(lower, upper);
                        lower.direction |= TMS_MASK;
                        match swdio_in {
                            Pin::Lower(_) => lower.direction &= !swdio_in.mask(),
                            Pin::Upper(_) => upper.direction &= !swdio_in.mask(),
                        }
                    }
                }
            })?;
            lock.flush()?;
            log::info!("SWD on {} using {backend:?}", cable.name);
            (backend, swdio_in)
        };
        Ok(Self {
            mtx,
            backend,
            direction: SwdDirection::Float,
            swdio_in,
        })
    }

    pub fn backend(&self) -> SwdBackend {
        self.backend
    }

    pub fn flush(&mut self) -> Result<(), FtdiError> {
        self.mtx.lock().unwrap().flush()
    }

    /// Clock `ticks` (at most 64) bits in, LSB first.
    fn read_bits(&mut self, ticks: usize) -> Result<u64, FtdiError> {
        self.turnaround(SwdDirection::Float)?;
        let mut lock = self.mtx.lock().unwrap();
        match self.backend {
            SwdBackend::Mpsse => {
                let plan = ShiftPlan::new(ticks, false);
                lock.write(|cmd| plan.queue(cmd, None, true))?;
                let response = lock.read()?;
                let mut bytes = [0u8; 8];
                plan.unpack(&response, &mut bytes[..ticks.div_ceil(8)]);
                Ok(u64::from_le_bytes(bytes))
            }
            SwdBackend::DirectBitbang | SwdBackend::SwitchedBitbang => {
                let pin = self.swdio_in;
                lock.write(|cmd| {
                    for _ in 0..ticks {
                        match pin {
                            Pin::Lower(_) => cmd.gpio_lower(),
                            Pin::Upper(_) => cmd.gpio_upper(),
                        };
                        cmd.clock_tms_out(false, 0, 1);
                    }
                })?;
                let response = lock.read()?;
                Ok(response
                    .iter()
                    .take(ticks)
                    .enumerate()
                    .filter(|(_, byte)| *byte & pin.mask() != 0)
                    .fold(0, |acc, (i, _)| acc | 1u64 << i))
            }
        }
    }

    /// Clock the low `ticks` bits of `value` out, LSB first.
    fn write_bits(&mut self, value: u64, ticks: usize) -> Result<(), FtdiError> {
        self.turnaround(SwdDirection::Drive)?;
        let mut lock = self.mtx.lock().unwrap();
        match self.backend {
            SwdBackend::Mpsse => {
                let bytes = value.to_le_bytes();
                let plan = ShiftPlan::new(ticks, false);
                lock.write(|cmd| plan.queue(cmd, Some(&bytes[..]), false))
            }
            SwdBackend::DirectBitbang | SwdBackend::SwitchedBitbang => lock.write(|cmd| {
                for start in (0..ticks).step_by(7) {
                    let len = (ticks - start).min(7);
                    cmd.clock_tms_out(false, (value >> start) as u8 & 0x7F, len);
                }
            }),
        }
    }
}

impl SwdLine for FtdiSwd {
    fn turnaround(&mut self, direction: SwdDirection) -> Result<(), FtdiError> {
        if direction == self.direction {
            return Ok(());
        }
        log::trace!("SWDIO {:?} -> {direction:?}", self.direction);
        self.direction = direction;
        let mut lock = self.mtx.lock().unwrap();
        let cable = lock.cable;
        match (self.backend, direction) {
            (SwdBackend::Mpsse, SwdDirection::Float) => {
                lock.update_pins(|lower, upper| {
                    cable.mpsse_swd_read.apply(lower, upper);
                    lower.value |= TDI_MASK;
                    lower.direction &= !TDI_MASK;
                })?;
                lock.write(|cmd| {
                    cmd.shift_bits_out(0, 1);
                })
            }
            (SwdBackend::Mpsse, SwdDirection::Drive) => {
                lock.write(|cmd| {
                    cmd.shift_bits_out(0, 1);
                })?;
                lock.update_pins(|lower, upper| {
                    cable.mpsse_swd_write.apply(lower, upper);
                    lower.value |= TDI_MASK;
                    lower.direction |= TDI_MASK;
                })
            }
            (backend, SwdDirection::Float) => {
                lock.update_pins(|lower, upper| {
                    if backend == SwdBackend::DirectBitbang {
                        lower.value |= TMS_MASK;
                        lower.direction &= !TMS_MASK;
                    } else {
                        cable.bb_swd_read.apply(lower, upper);
                    }
                })?;
                lock.write(|cmd| {
                    cmd.clock_tms_out(false, 0, 1);
                })
            }
            (backend, SwdDirection::Drive) => {
                lock.write(|cmd| {
                    cmd.clock_tms_out(false, 0, 1);
                })?;
                lock.update_pins(|lower, upper| {
                    if backend == SwdBackend::DirectBitbang {
                        lower.value |= TMS_MASK;
                        lower.direction |= TMS_MASK;
                    } else {
                        cable.bb_swd_write.apply(lower, upper);
                    }
                })
            }
        }
    }

    fn bit_in(&mut self) -> Result<bool, FtdiError> {
        Ok(self.read_bits(1)? != 0)
    }

    fn bit_out(&mut self, bit: bool) -> Result<(), FtdiError> {
        self.write_bits(bit as u64, 1)
    }

    fn seq_in(&mut self, ticks: usize) -> Result<u32, FtdiError> {
        assert!(ticks <= 32, "at most 32 bits per sequence");
        if ticks == 0 {
            return Ok(0);
        }
        Ok(self.read_bits(ticks)? as u32)
    }

    fn seq_in_parity(&mut self, ticks: usize) -> Result<(u32, bool), FtdiError> {
        assert_eq!(ticks, 32, "parity is only defined over a full word");
        let bits = self.read_bits(ticks + 1)?;
        let value = bits as u32;
        let parity = bits >> 32 & 1 != 0;
        Ok((value, (value.count_ones() & 1 != 0) != parity))
    }

    fn seq_out(&mut self, value: u32, ticks: usize) -> Result<(), FtdiError> {
        assert!(ticks <= 32, "at most 32 bits per sequence");
        if ticks == 0 {
            return Ok(());
        }
        self.write_bits(value as u64, ticks)
    }

    fn seq_out_parity(&mut self, value: u32, ticks: usize) -> Result<(), FtdiError> {
        assert_eq!(ticks, 32, "parity is only defined over a full word");
        let parity = (value.count_ones() & 1) as u64;
        self.write_bits(value as u64 | parity << 32, ticks + 1)
    }
}

impl ProbeControl for FtdiSwd {
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
        sim::{Sim, SwdLoopback, SwdioWiring},
    };

    const CABLES: [(&str, SwdBackend, SwdioWiring); 4] = [
        ("ftdi-swd-resistor", SwdBackend::Mpsse, SwdioWiring::Mpsse),
        ("ftdi-swd-buffered", SwdBackend::Mpsse, SwdioWiring::Mpsse),
        ("ftdi-swd-direct", SwdBackend::DirectBitbang, SwdioWiring::Direct),
        (
            "ftdi-swd-switched",
            SwdBackend::SwitchedBitbang,
            SwdioWiring::Switched {
                enable: 0x10,
                input: 0x04,
            },
        ),
    ];

    fn open(name: &str, wiring: SwdioWiring) -> (FtdiSwd, Sim) {
        let cable = CableDescriptor::find(name).unwrap();
        let (mpsse, sim) = Sim::open_with(cable, SwdLoopback::new(wiring));
        let swd = FtdiSwd::init(Arc::new(Mutex::new(mpsse))).unwrap();
        (swd, sim)
    }

    #[test]
    fn backend_follows_cable() {
        for (name, backend, wiring) in CABLES {
            let (swd, _sim) = open(name, wiring);
            assert_eq!(swd.backend(), backend, "{name}");
        }
    }

    #[test]
    fn init_releases_swdio() {
        let (swd, sim) = open("ftdi-swd-direct", SwdioWiring::Direct);
        let pins = sim.state().pins;
        assert_eq!(pins.low_ddr & (TMS_MASK | TDI_MASK | TDO_MASK), 0);
        assert_eq!(pins.low_ddr & TCK_MASK, TCK_MASK);
        assert_eq!(pins.low_data & TCK_MASK, 0);
        assert_eq!(swd.direction, SwdDirection::Float);

        let (_swd, sim) = open("ftdi-swd-switched", CABLES[3].2);
        let pins = sim.state().pins;
        assert_eq!(pins.low_ddr & TMS_MASK, TMS_MASK);
        assert_eq!(pins.low_ddr & 0x04, 0);
        assert_eq!(pins.low_data & 0x10, 0);
    }

    #[test]
    fn init_refuses_jtag_only_cable() {
        let cable = CableDescriptor::find("ftdi-jtag").unwrap();
        let (mpsse, _sim) = Sim::open(cable);
        assert!(matches!(
            FtdiSwd::init(Arc::new(Mutex::new(mpsse))),
            Err(FtdiError::NotSupported(_))
        ));
    }

    #[test]
    fn sequences_loop_back_on_every_backend() {
        const PATTERN: u32 = 0xC3A5_96E1;
        for (name, _, wiring) in CABLES {
            let (mut swd, _sim) = open(name, wiring);
            for ticks in 1..=32 {
                let mask = if ticks == 32 { u32::MAX } else { (1 << ticks) - 1 };
                swd.seq_out(PATTERN, ticks).unwrap();
                assert_eq!(swd.seq_in(ticks).unwrap(), PATTERN & mask, "{name} {ticks}");
            }
            swd.bit_out(true).unwrap();
            assert!(swd.bit_in().unwrap());
            swd.bit_out(false).unwrap();
            assert!(!swd.bit_in().unwrap());
        }
    }

    #[test]
    fn parity_bit_is_xor_of_data() {
        for ((name, _, wiring), value) in iproduct!(CABLES, [0, 1, 0x8000_0001, 0xFFFF_FFFE, 0x1234_5678]) {
            let (mut swd, _sim) = open(name, wiring);
            swd.seq_out_parity(value, 32).unwrap();
            assert_eq!(swd.seq_in(32).unwrap(), value);
            assert_eq!(swd.bit_in().unwrap(), value.count_ones() % 2 == 1, "{name} {value:#x}");

            swd.seq_out_parity(value, 32).unwrap();
            assert_eq!(swd.seq_in_parity(32).unwrap(), (value, false));
        }
    }

    #[test]
    fn flipped_bit_is_detected() {
        for ((name, _, wiring), flip) in iproduct!(CABLES, 0..=32) {
            let (mut swd, sim) = open(name, wiring);
            sim.with_target(|target: &mut SwdLoopback| target.flip = Some(flip));
            swd.seq_out_parity(0x0F0F_1234, 32).unwrap();
            let (_, parity_error) = swd.seq_in_parity(32).unwrap();
            assert!(parity_error, "{name} flip {flip}");
        }
    }

    #[test]
    fn turnaround_costs_one_clock() {
        for (name, _, wiring) in CABLES {
            let (mut swd, sim) = open(name, wiring);
            sim.clear();
            swd.turnaround(SwdDirection::Float).unwrap();
            swd.flush().unwrap();
            assert_eq!(sim.clocks(), 0, "{name}");
            swd.turnaround(SwdDirection::Drive).unwrap();
            swd.turnaround(SwdDirection::Drive).unwrap();
            swd.flush().unwrap();
            assert_eq!(sim.clocks(), 1, "{name}");
            swd.turnaround(SwdDirection::Float).unwrap();
            swd.flush().unwrap();
            assert_eq!(sim.clocks(), 2, "{name}");
        }
    }

    #[test]
    fn write_then_read_adds_single_turnaround() {
        let (mut swd, sim) = open("ftdi-swd-resistor", SwdioWiring::Mpsse);
        sim.clear();
        swd.seq_out(0xA5, 8).unwrap();
        swd.seq_in(3).unwrap();
        assert_eq!(sim.clocks(), 1 + 8 + 1 + 3);
    }

    #[test]
    fn bitbang_output_uses_seven_bit_tms_chunks() {
        let (mut swd, sim) = open("ftdi-swd-direct", SwdioWiring::Direct);
        swd.turnaround(SwdDirection::Drive).unwrap();
        swd.flush().unwrap();
        sim.clear();
        swd.seq_out(0x0001_FFFF, 17).unwrap();
        swd.flush().unwrap();
        assert_eq!(
            sim.state().raw[0],
            [0x4b, 0x06, 0x7F, 0x4b, 0x06, 0x7F, 0x4b, 0x02, 0x07]
        );
    }
}
