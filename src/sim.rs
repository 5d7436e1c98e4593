//! MPSSE simulator for unit tests.
//!
//! Decodes the opcode stream written through [`RawIo`], keeps the pin image of
//! both ports and clocks a [`Target`] on every TCK edge.

use std::{
    any::Any,
    collections::VecDeque,
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    ChipType, FtdiError,
    cable::{CableDescriptor, TDI_MASK, TMS_MASK},
    mpsse::{FtdiMpsse, RawIo},
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Pins {
    pub(crate) low_data: u8,
    pub(crate) low_ddr: u8,
    pub(crate) high_data: u8,
    pub(crate) high_ddr: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Event {
    Pins(Pins),
    Clock { tdi: bool, tms: bool },
}

/// Whatever sits on the other end of the cable.
pub(crate) trait Target: Send {
    /// Rising TCK edge. `sampled` is set when the MPSSE captures TDO on this edge.
    fn clock(&mut self, pins: &Pins, tdi: bool, tms: bool, sampled: bool) -> bool;
    /// Levels the target puts on input pins of one port.
    fn sense(&mut self, _pins: &Pins, _high: bool) -> u8 {
        0
    }
    fn as_any(&mut self) -> &mut dyn Any;
}

pub(crate) struct Idle;

impl Target for Idle {
    fn clock(&mut self, _pins: &Pins, _tdi: bool, _tms: bool, _sampled: bool) -> bool {
        false
    }
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

pub(crate) struct SimState {
    pub(crate) pins: Pins,
    pub(crate) events: Vec<Event>,
    /// Every buffer handed to `raw_write`.
    pub(crate) raw: Vec<Vec<u8>>,
    responses: VecDeque<u8>,
    /// Most answers ever left unread after a write.
    pub(crate) max_backlog: usize,
    pub(crate) short_write: bool,
    /// Pull-ups on lower port inputs.
    pub(crate) pull_up_low: u8,
    target: Box<dyn Target>,
}

impl SimState {
    fn execute(&mut self, cmd: &[u8]) {
        let mut i = 0;
        while i < cmd.len() {
            let op = cmd[i];
            i += 1;
            match op {
                0x80 => {
                    self.pins.low_data = cmd[i];
                    self.pins.low_ddr = cmd[i + 1];
                    i += 2;
                    self.events.push(Event::Pins(self.pins));
                }
                0x82 => {
                    self.pins.high_data = cmd[i];
                    self.pins.high_ddr = cmd[i + 1];
                    i += 2;
                    self.events.push(Event::Pins(self.pins));
                }
                0x81 => {
                    let value = self.sense(false);
                    self.responses.push_back(value);
                }
                0x83 => {
                    let value = self.sense(true);
                    self.responses.push_back(value);
                }
                0x86 => i += 2,
                0x84 | 0x85 | 0x87 | 0x8A | 0x8B | 0x8C | 0x8D | 0x96 | 0x97 => {}
                op if op & 0x80 == 0 => i = self.shift(op, cmd, i),
                // Bad command echo
                op => self.responses.extend([0xFA, op]),
            }
        }
    }

    fn sense(&mut self, high: bool) -> u8 {
        let (data, ddr) = if high {
            (self.pins.high_data, self.pins.high_ddr)
        } else {
            (self.pins.low_data, self.pins.low_ddr)
        };
        let pull = if high { 0 } else { self.pull_up_low };
        let input = self.target.sense(&self.pins, high) | pull;
        (data & ddr) | (input & !ddr)
    }

    fn tick(&mut self, tdi: bool, tms: bool, sampled: bool) -> bool {
        self.events.push(Event::Clock { tdi, tms });
        self.target.clock(&self.pins, tdi, tms, sampled)
    }

    fn set_low_bit(&mut self, mask: u8, level: bool) {
        if level {
            self.pins.low_data |= mask;
        } else {
            self.pins.low_data &= !mask;
        }
    }

    fn shift(&mut self, op: u8, cmd: &[u8], mut i: usize) -> usize {
        assert!(op & 0x08 != 0, "only LSB-first shifts are modelled");
        let write = op & 0x10 != 0;
        let read = op & 0x20 != 0;
        if op & 0x40 != 0 {
            let len = cmd[i] as usize + 1;
            let data = cmd[i + 1];
            i += 2;
            let tdi = data & 0x80 != 0;
            self.set_low_bit(TDI_MASK, tdi);
            let mut reg = 0u8;
            for bit in 0..len {
                let tms = data >> bit & 1 != 0;
                self.set_low_bit(TMS_MASK, tms);
                let tdo = self.tick(tdi, tms, read);
                reg = (reg >> 1) | ((tdo as u8) << 7);
            }
            if read {
                self.responses.push_back(reg);
            }
        } else if op & 0x02 != 0 {
            let len = cmd[i] as usize + 1;
            i += 1;
            let data = if write {
                i += 1;
                cmd[i - 1]
            } else {
                0
            };
            let mut reg = 0u8;
            for bit in 0..len {
                let tdi = if write {
                    data >> bit & 1 != 0
                } else {
                    self.pins.low_data & TDI_MASK != 0
                };
                self.set_low_bit(TDI_MASK, tdi);
                let tms = self.pins.low_data & TMS_MASK != 0;
                let tdo = self.tick(tdi, tms, read);
                reg = (reg >> 1) | ((tdo as u8) << 7);
            }
            if read {
                self.responses.push_back(reg);
            }
        } else {
            let len = u16::from_le_bytes([cmd[i], cmd[i + 1]]) as usize + 1;
            i += 2;
            for n in 0..len {
                let data = if write { cmd[i + n] } else { 0 };
                let mut byte = 0u8;
                for bit in 0..8 {
                    let tdi = if write {
                        data >> bit & 1 != 0
                    } else {
                        self.pins.low_data & TDI_MASK != 0
                    };
                    self.set_low_bit(TDI_MASK, tdi);
                    let tms = self.pins.low_data & TMS_MASK != 0;
                    let tdo = self.tick(tdi, tms, read);
                    byte |= (tdo as u8) << bit;
                }
                if read {
                    self.responses.push_back(byte);
                }
            }
            if write {
                i += len;
            }
        }
        i
    }
}

#[derive(Clone)]
pub(crate) struct Sim(Arc<Mutex<SimState>>);

impl Sim {
    pub(crate) fn new(target: impl Target + 'static) -> Self {
        Sim(Arc::new(Mutex::new(SimState {
            pins: Pins::default(),
            events: Vec::new(),
            raw: Vec::new(),
            responses: VecDeque::new(),
            max_backlog: 0,
            short_write: false,
            pull_up_low: 0,
            target: Box::new(target),
        })))
    }

    pub(crate) fn open(cable: &CableDescriptor) -> (FtdiMpsse, Sim) {
        Self::open_with(cable, Idle)
    }

    pub(crate) fn open_with(
        cable: &CableDescriptor,
        target: impl Target + 'static,
    ) -> (FtdiMpsse, Sim) {
        let sim = Sim::new(target);
        let mpsse = FtdiMpsse::with_io(Box::new(sim.clone()), ChipType::FT2232H, cable).unwrap();
        (mpsse, sim)
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, SimState> {
        self.0.lock().unwrap()
    }

    /// Forget recorded traffic and events.
    pub(crate) fn clear(&self) {
        let mut state = self.state();
        state.raw.clear();
        state.events.clear();
    }

    pub(crate) fn clocks(&self) -> usize {
        self.state()
            .events
            .iter()
            .filter(|e| matches!(e, Event::Clock { .. }))
            .count()
    }

    pub(crate) fn with_target<T: 'static, R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut state = self.state();
        let target = state
            .target
            .as_any()
            .downcast_mut::<T>()
            .expect("target type");
        f(target)
    }
}

impl RawIo for Sim {
    fn raw_write(&mut self, data: &[u8]) -> Result<usize, FtdiError> {
        let mut state = self.state();
        state.raw.push(data.to_vec());
        if state.short_write {
            return Ok(data.len() - 1);
        }
        state.execute(data);
        state.max_backlog = state.max_backlog.max(state.responses.len());
        Ok(data.len())
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize, FtdiError> {
        let mut state = self.state();
        let mut n = 0;
        while n < buf.len() {
            let Some(byte) = state.responses.pop_front() else {
                break;
            };
            buf[n] = byte;
            n += 1;
        }
        Ok(n)
    }
}

/// IEEE 1149.1 TAP controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TapState {
    Reset,
    Idle,
    SelectDr,
    CaptureDr,
    ShiftDr,
    Exit1Dr,
    PauseDr,
    Exit2Dr,
    UpdateDr,
    SelectIr,
    CaptureIr,
    ShiftIr,
    Exit1Ir,
    PauseIr,
    Exit2Ir,
    UpdateIr,
}

impl TapState {
    pub(crate) fn next(self, tms: bool) -> Self {
        use TapState::*;
        match (self, tms) {
            (Reset, true) => Reset,
            (Reset, false) => Idle,
            (Idle, true) => SelectDr,
            (Idle, false) => Idle,
            (SelectDr, true) => SelectIr,
            (SelectDr, false) => CaptureDr,
            (CaptureDr, true) => Exit1Dr,
            (CaptureDr, false) => ShiftDr,
            (ShiftDr, true) => Exit1Dr,
            (ShiftDr, false) => ShiftDr,
            (Exit1Dr, true) => UpdateDr,
            (Exit1Dr, false) => PauseDr,
            (PauseDr, true) => Exit2Dr,
            (PauseDr, false) => PauseDr,
            (Exit2Dr, true) => UpdateDr,
            (Exit2Dr, false) => ShiftDr,
            (UpdateDr, true) => SelectDr,
            (UpdateDr, false) => Idle,
            (SelectIr, true) => Reset,
            (SelectIr, false) => CaptureIr,
            (CaptureIr, true) => Exit1Ir,
            (CaptureIr, false) => ShiftIr,
            (ShiftIr, true) => Exit1Ir,
            (ShiftIr, false) => ShiftIr,
            (Exit1Ir, true) => UpdateIr,
            (Exit1Ir, false) => PauseIr,
            (PauseIr, true) => Exit2Ir,
            (PauseIr, false) => PauseIr,
            (Exit2Ir, true) => UpdateIr,
            (Exit2Ir, false) => ShiftIr,
            (UpdateIr, true) => SelectDr,
            (UpdateIr, false) => Idle,
        }
    }
}

/// TAP model. Without an IDCODE it loops TDI straight back to TDO.
pub(crate) struct TapTarget {
    pub(crate) state: TapState,
    pub(crate) history: Vec<TapState>,
    idcode: Option<u32>,
    dr: u32,
}

impl TapTarget {
    pub(crate) fn loopback() -> Self {
        Self {
            state: TapState::Reset,
            history: Vec::new(),
            idcode: None,
            dr: 0,
        }
    }

    pub(crate) fn with_idcode(idcode: u32) -> Self {
        Self {
            idcode: Some(idcode),
            ..Self::loopback()
        }
    }
}

impl Target for TapTarget {
    fn clock(&mut self, _pins: &Pins, tdi: bool, tms: bool, _sampled: bool) -> bool {
        let tdo = match self.idcode {
            None => tdi,
            Some(idcode) => {
                let tdo = self.state == TapState::ShiftDr && self.dr & 1 != 0;
                match self.state {
                    TapState::CaptureDr => self.dr = idcode,
                    TapState::ShiftDr => self.dr = (self.dr >> 1) | ((tdi as u32) << 31),
                    _ => {}
                }
                tdo
            }
        };
        self.state = self.state.next(tms);
        self.history.push(self.state);
        tdo
    }
    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}

/// How SWDIO reaches the target on a given cable.
#[derive(Debug, Clone, Copy)]
pub(crate) enum SwdioWiring {
    /// Driven from DO while its output is enabled, sampled on DI.
    Mpsse,
    /// On TMS, driven while TMS is an output.
    Direct,
    /// On TMS through a buffer enabled by `enable`, sampled on `input`.
    Switched { enable: u8, input: u8 },
}

/// SWD target that answers reads with the bits the host last wrote.
pub(crate) struct SwdLoopback {
    wiring: SwdioWiring,
    pub(crate) bits: VecDeque<bool>,
    /// Invert the n-th bit the host drives.
    pub(crate) flip: Option<usize>,
    driven: usize,
}

impl SwdLoopback {
    pub(crate) fn new(wiring: SwdioWiring) -> Self {
        Self {
            wiring,
            bits: VecDeque::new(),
            flip: None,
            driven: 0,
        }
    }

    fn push(&mut self, bit: bool) {
        let bit = bit ^ (self.flip == Some(self.driven));
        self.driven += 1;
        self.bits.push_back(bit);
    }

    fn pop(&mut self) -> bool {
        self.bits.pop_front().unwrap_or(false)
    }
}

impl Target for SwdLoopback {
    fn clock(&mut self, pins: &Pins, tdi: bool, tms: bool, sampled: bool) -> bool {
        match self.wiring {
            SwdioWiring::Mpsse if pins.low_ddr & TDI_MASK != 0 => self.push(tdi),
            SwdioWiring::Mpsse if sampled => return self.pop(),
            SwdioWiring::Direct if pins.low_ddr & TMS_MASK != 0 => self.push(tms),
            SwdioWiring::Switched { enable, .. } if pins.low_data & enable != 0 => self.push(tms),
            _ => {}
        }
        false
    }

    fn sense(&mut self, pins: &Pins, high: bool) -> u8 {
        if high {
            return 0;
        }
        match self.wiring {
            SwdioWiring::Direct if pins.low_ddr & TMS_MASK == 0 => {
                if self.pop() { TMS_MASK } else { 0 }
            }
            SwdioWiring::Switched { enable, input } if pins.low_data & enable == 0 => {
                if self.pop() { input } else { 0 }
            }
            _ => 0,
        }
    }

    fn as_any(&mut self) -> &mut dyn Any {
        self
    }
}
