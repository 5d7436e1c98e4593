//! Byte/bit/TMS split of a TDI/TDO shift.
//!
//! A shift of `ticks` bits is issued as up to three MPSSE commands: whole bytes,
//! a bit-mode remainder of `ticks mod 8` bits, and, when the shift leaves the
//! Shift-xR state, one TMS clock that carries the last data bit on TDI.

use crate::mpsse_cmd::MpsseCmdBuilder;

/// How one shift is split across MPSSE commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShiftPlan {
    /// Data bytes clocked with the byte-mode command.
    pub full_bytes: usize,
    /// Data bits left for the bit-mode command, 0..=7.
    pub partial_bits: usize,
    /// Whether the last tick is a TMS=1 clock.
    pub final_tms: bool,
}

impl ShiftPlan {
    pub fn new(ticks: usize, final_tms: bool) -> Self {
        let final_tms = final_tms && ticks > 0;
        let data_bits = ticks - final_tms as usize;
        Self {
            full_bytes: data_bits / 8,
            partial_bits: data_bits % 8,
            final_tms,
        }
    }

    pub fn ticks(&self) -> usize {
        self.data_bits() + self.final_tms as usize
    }

    /// Bits shifted by the byte and bit commands, excluding the TMS exit clock.
    pub fn data_bits(&self) -> usize {
        self.full_bytes * 8 + self.partial_bits
    }

    /// Response bytes produced when TDO is captured.
    pub fn response_len(&self) -> usize {
        self.full_bytes + (self.partial_bits > 0) as usize + self.final_tms as usize
    }

    /// TDI level for the TMS exit clock, the input bit right after the data bits.
    pub fn final_tdi(&self, tdi: &[u8]) -> bool {
        let bit = self.data_bits();
        tdi.get(bit / 8).is_some_and(|byte| byte >> (bit % 8) & 1 != 0)
    }

    /// Queue the commands for this shift. Without `tdi` the line is clocked with zeros.
    pub(crate) fn queue(&self, cmd: &mut MpsseCmdBuilder, tdi: Option<&[u8]>, read: bool) {
        let full = self.full_bytes;
        match (tdi, read) {
            (Some(tdi), true) => cmd.shift_bytes(&tdi[..full]),
            (Some(tdi), false) => cmd.shift_bytes_out(&tdi[..full]),
            (None, true) => cmd.shift_bytes_in(full),
            (None, false) => cmd.shift_bytes_out(&vec![0; full]),
        };
        if self.partial_bits > 0 {
            let byte = tdi.map_or(0, |tdi| tdi[full]);
            match (tdi.is_some(), read) {
                (true, true) => cmd.shift_bits(byte, self.partial_bits),
                (false, true) => cmd.shift_bits_in(self.partial_bits),
                (_, false) => cmd.shift_bits_out(byte, self.partial_bits),
            };
        }
        if self.final_tms {
            let last = tdi.is_some_and(|tdi| self.final_tdi(tdi));
            if read {
                cmd.clock_tms(last, 0x01, 1);
            } else {
                cmd.clock_tms_out(last, 0x01, 1);
            }
        }
    }

    /// Reassemble captured TDO bits LSB first into `tdo`.
    ///
    /// Bit-mode reads land in the top bits of their response byte and the TMS
    /// clock reports TDO in bit 7.
    pub fn unpack(&self, response: &[u8], tdo: &mut [u8]) {
        let full = self.full_bytes;
        tdo[..full].copy_from_slice(&response[..full]);
        let mut index = full;
        if self.partial_bits > 0 {
            tdo[full] = response[index] >> (8 - self.partial_bits);
            index += 1;
        }
        if self.final_tms {
            let bit = response[index] >> 7;
            if self.partial_bits == 0 {
                tdo[full] = bit;
            } else {
                tdo[full] |= bit << self.partial_bits;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use itertools::iproduct;

    use super::ShiftPlan;
    use crate::mpsse_cmd::MpsseCmdBuilder;

    fn pattern(ticks: usize) -> Vec<u8> {
        (0..ticks.div_ceil(8)).map(|i| 0xA5u8.rotate_left(i as u32) ^ 0x3C).collect()
    }

    fn masked(mut data: Vec<u8>, ticks: usize) -> Vec<u8> {
        if ticks % 8 != 0 {
            let last = data.len() - 1;
            data[last] &= (1 << (ticks % 8)) - 1;
        }
        data
    }

    /// What an MPSSE with TDI looped to TDO answers for `tdi`.
    fn loopback_response(plan: &ShiftPlan, tdi: &[u8]) -> Vec<u8> {
        let mut response = tdi[..plan.full_bytes].to_vec();
        if plan.partial_bits > 0 {
            response.push(tdi[plan.full_bytes] << (8 - plan.partial_bits));
        }
        if plan.final_tms {
            response.push((plan.final_tdi(tdi) as u8) << 7);
        }
        response
    }

    #[test]
    fn plan_covers_every_tick() {
        for (ticks, final_tms) in iproduct!(1..=40usize, [false, true]) {
            let plan = ShiftPlan::new(ticks, final_tms);
            assert_eq!(plan.ticks(), ticks);
            assert!(plan.partial_bits < 8);
            assert_eq!(plan.final_tms, final_tms);
            let mut cmd = MpsseCmdBuilder::new();
            plan.queue(&mut cmd, Some(&pattern(ticks)), true);
            assert_eq!(cmd.read_len(), plan.response_len());
        }
    }

    #[test]
    fn unpack_restores_input_for_every_boundary() {
        for (bytes, rem, final_tms) in iproduct!(0..3usize, 0..8usize, [false, true]) {
            let ticks = bytes * 8 + rem;
            if ticks == 0 {
                continue;
            }
            let plan = ShiftPlan::new(ticks, final_tms);
            let tdi = pattern(ticks);
            let response = loopback_response(&plan, &tdi);
            assert_eq!(response.len(), plan.response_len());
            let mut tdo = vec![0xEE; ticks.div_ceil(8)];
            plan.unpack(&response, &mut tdo);
            assert_eq!(
                tdo,
                masked(tdi, ticks),
                "ticks {ticks}, final_tms {final_tms}"
            );
        }
    }

    #[test]
    fn thirteen_ticks_with_exit() {
        let plan = ShiftPlan::new(13, true);
        assert_eq!((plan.full_bytes, plan.partial_bits), (1, 4));
        let tdi = [0xA5, 0x1C];
        assert!(plan.final_tdi(&tdi));

        let mut cmd = MpsseCmdBuilder::new();
        plan.queue(&mut cmd, Some(&tdi[..]), false);
        assert_eq!(
            cmd.as_slice(),
            [0x19, 0x00, 0x00, 0xA5, 0x1b, 0x03, 0x1C, 0x4b, 0x00, 0x81]
        );

        let mut cmd = MpsseCmdBuilder::new();
        plan.queue(&mut cmd, Some(&tdi[..]), true);
        assert_eq!(
            cmd.as_slice(),
            [0x39, 0x00, 0x00, 0xA5, 0x3b, 0x03, 0x1C, 0x6b, 0x00, 0x81]
        );
        assert_eq!(cmd.read_len(), 3);

        let mut tdo = [0; 2];
        plan.unpack(&[0xA5, 0xC0, 0x80], &mut tdo);
        assert_eq!(tdo, [0xA5, 0x1C]);
    }

    #[test]
    fn exit_on_byte_boundary_uses_next_byte() {
        let plan = ShiftPlan::new(9, true);
        assert_eq!((plan.full_bytes, plan.partial_bits), (1, 0));
        assert!(plan.final_tdi(&[0x00, 0x01]));
        assert!(!plan.final_tdi(&[0xFF, 0xFE]));
        let mut tdo = [0xFF; 2];
        plan.unpack(&[0x12, 0x80], &mut tdo);
        assert_eq!(tdo, [0x12, 0x01]);
    }

    #[test]
    fn read_only_shift_clocks_zeros() {
        let plan = ShiftPlan::new(10, false);
        let mut cmd = MpsseCmdBuilder::new();
        plan.queue(&mut cmd, None, false);
        assert_eq!(cmd.as_slice(), [0x19, 0x00, 0x00, 0x00, 0x1b, 0x01, 0x00]);
        let mut cmd = MpsseCmdBuilder::new();
        plan.queue(&mut cmd, None, true);
        assert_eq!(cmd.as_slice(), [0x28, 0x00, 0x00, 0x2a, 0x01]);
    }
}
