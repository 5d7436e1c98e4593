//! MPSSE opcode encoding.
//!
//! Everything the JTAG and SWD engines put on the wire goes through
//! [`MpsseCmdBuilder`]. Data is always shifted LSB first, written on the falling
//! edge of TCK and sampled on the rising edge, with TCK idling low (AN108-2.2).

/// MPSSE opcodes other than data shifting.
#[repr(u8)]
#[derive(Debug, Copy, Clone)]
enum MpsseCmd {
    SetDataBitsLowbyte = 0x80,
    GetDataBitsLowbyte = 0x81,
    SetDataBitsHighbyte = 0x82,
    GetDataBitsHighbyte = 0x83,
    EnableLoopback = 0x84,
    DisableLoopback = 0x85,
    SetClockFrequency = 0x86,
    SendImmediate = 0x87,
    DisableClockDivideBy5 = 0x8A,
    EnableClockDivideBy5 = 0x8B,
    Disable3PhaseClocking = 0x8D,
    DisableAdaptiveClocking = 0x97,
    /// Not a valid opcode. The MPSSE answers it with `0xFA` and the opcode.
    Bogus = 0xAA,
}

/// Data shifting opcode of the MPSSE.
///
/// When tms_write is false:
///
/// TDI(AD1) can only output on the second edge.
///
/// TDO(AD2) can only sample on the first edge.
///
/// When tms_write is true:
///
/// TMS(AD3) can only output on the second edge.
#[bitfield_struct::bitfield(u8, order = Lsb)]
struct MpsseShiftCmd {
    is_tdi_neg_write: bool,
    #[bits(default = true)]
    is_bit_mode: bool,
    is_tdo_neg_read: bool,
    #[bits(default = true)]
    is_lsb: bool,
    is_tdi_write: bool,
    is_tdo_read: bool,
    #[bits(default = false)]
    is_tms_write: bool,
    #[bits(default = false)]
    _const_0: bool,
}
impl MpsseShiftCmd {
    fn shift(
        tck_init_value: bool,
        is_bit_mode: bool,
        is_lsb: bool,
        is_tdi_write: bool,
        is_tdo_read: bool,
    ) -> u8 {
        assert!(
            is_tdi_write | is_tdo_read,
            "a shift must write TDI or read TDO"
        );
        MpsseShiftCmd::new()
            .with_is_tdi_neg_write((!tck_init_value) && is_tdi_write)
            .with_is_bit_mode(is_bit_mode)
            .with_is_tdo_neg_read(tck_init_value && is_tdo_read)
            .with_is_lsb(is_lsb)
            .with_is_tdi_write(is_tdi_write)
            .with_is_tdo_read(is_tdo_read)
            .into()
    }
    fn tms_shift(tdo_read: bool) -> u8 {
        MpsseShiftCmd::new()
            .with_is_tdi_neg_write(true)
            .with_is_tdo_read(tdo_read)
            .with_is_tms_write(true)
            .into()
    }
    /// Opcode for the LSB-first, falling-edge-write data shift used by JTAG and SWD.
    fn data(is_bit_mode: bool, is_tdi_write: bool, is_tdo_read: bool) -> u8 {
        Self::shift(TCK_INIT_VALUE, is_bit_mode, true, is_tdi_write, is_tdo_read)
    }
}

const TCK_INIT_VALUE: bool = false;
pub(crate) const MAX_BYTES_SHIFT: usize = 65536;
/// Capturing byte shifts are split at this size so a batch can be cut between them.
pub(crate) const MAX_READ_SHIFT: usize = 4096;
pub(crate) const MAX_BITS_SHIFT: usize = 8;
pub(crate) const MAX_TMS_SHIFT: usize = 7;

/// Pending MPSSE command bytes together with the number of response bytes they produce.
#[derive(Default, Debug)]
pub(crate) struct MpsseCmdBuilder {
    cmd: Vec<u8>,
    read_len: usize,
    /// (command bytes, response bytes) so far, after each command that answers.
    boundaries: Vec<(usize, usize)>,
}
impl MpsseCmdBuilder {
    pub(crate) fn new() -> MpsseCmdBuilder {
        Default::default()
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        &self.cmd
    }

    pub(crate) fn len(&self) -> usize {
        self.cmd.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.cmd.is_empty()
    }

    /// Response bytes the queued commands will produce.
    pub(crate) fn read_len(&self) -> usize {
        self.read_len
    }

    fn answers(&mut self, len: usize) {
        self.read_len += len;
        self.boundaries.push((self.cmd.len(), self.read_len));
    }

    /// Hand out the queued bytes as batches owing at most `max_response` bytes each,
    /// leaving the builder empty.
    ///
    /// Batches are cut between commands only. Every batch but the last ends with
    /// send-immediate, so its answers arrive without waiting for the latency timer.
    pub(crate) fn take_batches(&mut self, max_response: usize) -> Vec<(Vec<u8>, usize)> {
        let cmd = std::mem::take(&mut self.cmd);
        let read_len = std::mem::take(&mut self.read_len);
        let boundaries = std::mem::take(&mut self.boundaries);
        let mut batches = Vec::new();
        let (mut cmd_start, mut read_start) = (0, 0);
        let mut cut = (0, 0);
        for (cmd_end, read_end) in boundaries {
            if read_end - read_start > max_response && cut.0 > cmd_start {
                let mut batch = cmd[cmd_start..cut.0].to_vec();
                batch.push(MpsseCmd::SendImmediate as u8);
                batches.push((batch, cut.1 - read_start));
                (cmd_start, read_start) = cut;
            }
            cut = (cmd_end, read_end);
        }
        batches.push((cmd[cmd_start..].to_vec(), read_len - read_start));
        batches
    }

    /// Set the clock divisor. The prescaler command is omitted on chips without one.
    pub(crate) fn set_clock(&mut self, divisor: u16, clk_div_by5: Option<bool>) -> &mut Self {
        match clk_div_by5 {
            Some(true) => self.cmd.push(MpsseCmd::EnableClockDivideBy5 as u8),
            Some(false) => self.cmd.push(MpsseCmd::DisableClockDivideBy5 as u8),
            None => {}
        };
        let [lo, hi] = divisor.to_le_bytes();
        self.cmd
            .extend_from_slice(&[MpsseCmd::SetClockFrequency as u8, lo, hi]);
        self
    }

    pub(crate) fn enable_loopback(&mut self, state: bool) -> &mut Self {
        self.cmd.push(if state {
            MpsseCmd::EnableLoopback as u8
        } else {
            MpsseCmd::DisableLoopback as u8
        });
        self
    }

    /// Two-phase clocking and no RTCK, the only mode the engines use.
    pub(crate) fn plain_clocking(&mut self) -> &mut Self {
        self.cmd.extend_from_slice(&[
            MpsseCmd::Disable3PhaseClocking as u8,
            MpsseCmd::DisableAdaptiveClocking as u8,
        ]);
        self
    }

    /// Queue an invalid opcode, the device echoes `[0xFA, 0xAA]`.
    pub(crate) fn bogus(&mut self) -> &mut Self {
        self.cmd.push(MpsseCmd::Bogus as u8);
        self.answers(2);
        self
    }

    /// Set level (`state`) and direction (`direction`, 1 = output) of ADBUS0-7.
    pub(crate) fn set_gpio_lower(&mut self, state: u8, direction: u8) -> &mut Self {
        self.cmd
            .extend_from_slice(&[MpsseCmd::SetDataBitsLowbyte as u8, state, direction]);
        self
    }

    /// Set level and direction of ACBUS0-7. Harmless on chips without an upper port.
    pub(crate) fn set_gpio_upper(&mut self, state: u8, direction: u8) -> &mut Self {
        self.cmd
            .extend_from_slice(&[MpsseCmd::SetDataBitsHighbyte as u8, state, direction]);
        self
    }

    pub(crate) fn gpio_lower(&mut self) -> &mut Self {
        self.cmd.push(MpsseCmd::GetDataBitsLowbyte as u8);
        self.answers(1);
        self
    }

    pub(crate) fn gpio_upper(&mut self) -> &mut Self {
        self.cmd.push(MpsseCmd::GetDataBitsHighbyte as u8);
        self.answers(1);
        self
    }

    /// Flush the device's response buffer to the host now.
    pub(crate) fn send_immediate(&mut self) -> &mut Self {
        self.cmd.push(MpsseCmd::SendImmediate as u8);
        self
    }

    /// Clock whole bytes out on TDI.
    pub(crate) fn shift_bytes_out(&mut self, data: &[u8]) -> &mut Self {
        for slice in data.chunks(MAX_BYTES_SHIFT) {
            self.byte_header(MpsseShiftCmd::data(false, true, false), slice.len());
            self.cmd.extend_from_slice(slice);
        }
        self
    }

    /// Clock `len` bytes in from TDO.
    pub(crate) fn shift_bytes_in(&mut self, mut len: usize) -> &mut Self {
        while len > 0 {
            let chunk = len.min(MAX_READ_SHIFT);
            self.byte_header(MpsseShiftCmd::data(false, false, true), chunk);
            self.answers(chunk);
            len -= chunk;
        }
        self
    }

    /// Clock bytes out on TDI while capturing TDO.
    pub(crate) fn shift_bytes(&mut self, data: &[u8]) -> &mut Self {
        for slice in data.chunks(MAX_READ_SHIFT) {
            self.byte_header(MpsseShiftCmd::data(false, true, true), slice.len());
            self.cmd.extend_from_slice(slice);
            self.answers(slice.len());
        }
        self
    }

    fn byte_header(&mut self, opcode: u8, len: usize) {
        let [lo, hi, ..] = (len - 1).to_le_bytes();
        self.cmd.extend_from_slice(&[opcode, lo, hi]);
    }

    /// Clock the low `len` bits of `data` out on TDI.
    pub(crate) fn shift_bits_out(&mut self, data: u8, len: usize) -> &mut Self {
        if len == 0 {
            return self;
        }
        assert!(len <= MAX_BITS_SHIFT, "at most {MAX_BITS_SHIFT} bits per shift");
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::data(true, true, false),
            (len - 1) as u8,
            data,
        ]);
        self
    }

    /// Clock `len` bits in. They arrive in the top `len` bits of the response byte.
    pub(crate) fn shift_bits_in(&mut self, len: usize) -> &mut Self {
        if len == 0 {
            return self;
        }
        assert!(len <= MAX_BITS_SHIFT, "at most {MAX_BITS_SHIFT} bits per shift");
        self.cmd
            .extend_from_slice(&[MpsseShiftCmd::data(true, false, true), (len - 1) as u8]);
        self.answers(1);
        self
    }

    pub(crate) fn shift_bits(&mut self, data: u8, len: usize) -> &mut Self {
        if len == 0 {
            return self;
        }
        assert!(len <= MAX_BITS_SHIFT, "at most {MAX_BITS_SHIFT} bits per shift");
        self.cmd.extend_from_slice(&[
            MpsseShiftCmd::data(true, true, true),
            (len - 1) as u8,
            data,
        ]);
        self.answers(1);
        self
    }

    /// Clock the low `len` bits of `data` out on TMS, holding TDI at `tdi`.
    pub(crate) fn clock_tms_out(&mut self, tdi: bool, data: u8, len: usize) -> &mut Self {
        self.tms(false, tdi, data, len)
    }

    /// Like [`clock_tms_out`](Self::clock_tms_out), also capturing TDO into bit 7 of one byte.
    pub(crate) fn clock_tms(&mut self, tdi: bool, data: u8, len: usize) -> &mut Self {
        self.tms(true, tdi, data, len)
    }

    fn tms(&mut self, read: bool, tdi: bool, data: u8, len: usize) -> &mut Self {
        if len == 0 {
            return self;
        }
        assert!(len <= MAX_TMS_SHIFT, "at most {MAX_TMS_SHIFT} TMS bits per shift");
        let data = (data & 0x7F) | if tdi { 0x80 } else { 0 };
        self.cmd
            .extend_from_slice(&[MpsseShiftCmd::tms_shift(read), (len - 1) as u8, data]);
        if read {
            self.answers(1);
        }
        self
    }
}
