use crate::{
    ChipType, FtdiError, Pin,
    cable::{CableDescriptor, PinProgram},
    ftdaye::FtdiContext,
    mpsse_cmd::MpsseCmdBuilder,
};

/// Raw byte pipe to an MPSSE.
pub trait RawIo: Send {
    /// Write `data`, returning how many bytes were accepted.
    fn raw_write(&mut self, data: &[u8]) -> Result<usize, FtdiError>;
    /// Fill `buf`, returning how many bytes arrived before the deadline.
    fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize, FtdiError>;
    fn raw_flush(&mut self) -> Result<(), FtdiError> {
        Ok(())
    }
}

/// Shadow of one 8-bit port.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct GpioByte {
    /// Direction mask (0 = input, 1 = output)
    pub direction: u8,
    /// Output levels
    pub value: u8,
}

/// Queued commands are spilled to the device once they reach this size.
const MAX_TRANSFER: usize = 4096;

/// FTDI MPSSE with the command buffer and pin shadow shared by the JTAG and SWD engines.
pub struct FtdiMpsse {
    io: Box<dyn RawIo>,
    pub(crate) chip_type: ChipType,
    pub(crate) cable: CableDescriptor,
    /// Lower 8 GPIO pins state tracker
    pub(crate) lower: GpioByte,
    /// Upper GPIO pins state tracker
    pub(crate) upper: GpioByte,
    pending: MpsseCmdBuilder,
    /// Responses to commands already spilled to the device but not yet consumed.
    received: Vec<u8>,
    srst_asserted: bool,
}

impl FtdiMpsse {
    /// Opens an FTDI device in MPSSE mode wired as `cable`.
    pub fn open(usb_device: &nusb::DeviceInfo, cable: &CableDescriptor) -> Result<Self, FtdiError> {
        let interface = cable.interface;
        let handle = usb_device.open()?;
        let max_packet_size = handle
            .active_configuration()
            .map_err(|e| FtdiError::Usb(e.into()))?
            .interface_alt_settings()
            .next()
            .ok_or(FtdiError::OpenFailed(
                "Failed to get interface info".to_string(),
            ))?
            .endpoints()
            .next()
            .ok_or(FtdiError::OpenFailed(
                "Failed to get endpoint info".to_string(),
            ))?
            .max_packet_size();
        let chip_type = match (
            usb_device.device_version(),
            usb_device.serial_number().unwrap_or(""),
        ) {
            (0x400, _) | (0x200, "") => return Err(FtdiError::UnsupportedChip(ChipType::Bm)),
            (0x200, _) => return Err(FtdiError::UnsupportedChip(ChipType::Am)),
            (0x500, _) => ChipType::FT2232D,
            (0x600, _) => return Err(FtdiError::UnsupportedChip(ChipType::R)),
            (0x700, _) => ChipType::FT2232H,
            (0x800, _) => ChipType::FT4232H,
            (0x900, _) => ChipType::FT232H,
            (0x1000, _) => return Err(FtdiError::UnsupportedChip(ChipType::FT230X)),
            (version, _) => {
                return Err(FtdiError::OpenFailed(format!(
                    "Unknown ChipType version:0x{version:x}"
                )));
            }
        };
        if !chip_type.interface_list().contains(&interface) {
            return Err(FtdiError::OpenFailed(format!(
                "{chip_type:?} do not support Interface::{interface:?}"
            )));
        }
        if !chip_type.mpsse_list().contains(&interface) {
            return Err(FtdiError::OpenFailed(format!(
                "{chip_type:?} has no MPSSE on Interface::{interface:?}"
            )));
        }

        let handle = handle.detach_and_claim_interface(interface.interface_number())?;
        let context = FtdiContext::new(handle, interface, max_packet_size).into_mpsse(0)?;
        log::info!("Opened {chip_type:?} as cable {}", cable.name);
        Self::with_io(Box::new(context), chip_type, cable)
    }

    /// Build on an already configured MPSSE byte pipe.
    pub fn with_io(
        io: Box<dyn RawIo>,
        chip_type: ChipType,
        cable: &CableDescriptor,
    ) -> Result<Self, FtdiError> {
        let mut mpsse = Self {
            io,
            chip_type,
            cable: *cable,
            lower: GpioByte {
                direction: cable.init.ddr_low,
                value: cable.init.data_low,
            },
            upper: GpioByte {
                direction: cable.init.ddr_high,
                value: cable.init.data_high,
            },
            pending: MpsseCmdBuilder::new(),
            received: Vec::new(),
            srst_asserted: false,
        };
        mpsse.sync()?;
        let (lower, upper) = (mpsse.lower, mpsse.upper);
        let clk_div_by5 = chip_type.max_frequency().1;
        mpsse.write(|cmd| {
            cmd.set_gpio_lower(lower.value, lower.direction)
                .set_gpio_upper(upper.value, upper.direction)
                .enable_loopback(false);
            if clk_div_by5.is_some() {
                cmd.plain_clocking();
            }
            cmd.set_clock(0, clk_div_by5);
        })?;
        mpsse.flush()?;
        Ok(mpsse)
    }

    /// Confirm the command stream is aligned by provoking a bad-command echo.
    ///
    /// An opcode the MPSSE rejected earlier shows up ahead of the expected echo
    /// and is reported as [`FtdiError::BadMpsseCommand`].
    pub fn sync(&mut self) -> Result<(), FtdiError> {
        const BAD_COMMAND: u8 = 0xFA;
        self.write(|cmd| {
            cmd.bogus();
        })?;
        let echo = self.read()?;
        match echo[..] {
            [BAD_COMMAND, 0xAA] => Ok(()),
            [BAD_COMMAND, op] => {
                log::error!("MPSSE rejected opcode {op:#04x}");
                Err(FtdiError::BadMpsseCommand(op))
            }
            _ => Err(FtdiError::OpenFailed(format!(
                "MPSSE did not synchronise, got {echo:02x?}"
            ))),
        }
    }

    pub fn cable(&self) -> &CableDescriptor {
        &self.cable
    }

    /// Queue commands. Nothing reaches the device until the buffer fills up or is flushed.
    pub(crate) fn write(
        &mut self,
        build: impl FnOnce(&mut MpsseCmdBuilder),
    ) -> Result<(), FtdiError> {
        build(&mut self.pending);
        if self.pending.len() >= MAX_TRANSFER {
            self.spill()?;
        }
        Ok(())
    }

    /// Push every queued command to the device and return all responses owed so far.
    pub(crate) fn read(&mut self) -> Result<Vec<u8>, FtdiError> {
        if !self.pending.is_empty() {
            self.pending.send_immediate();
        }
        self.spill()?;
        Ok(std::mem::take(&mut self.received))
    }

    /// Make sure every queued command has reached the device.
    pub fn flush(&mut self) -> Result<(), FtdiError> {
        self.spill()?;
        self.io.raw_flush()
    }

    /// Send the queued commands, reading back each batch's answers before the
    /// next batch so the chip never holds more than its buffer.
    fn spill(&mut self) -> Result<(), FtdiError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let max_response = self.chip_type.response_buffer();
        for (cmd, read_len) in self.pending.take_batches(max_response) {
            log::trace!("mpsse write {} bytes, expect {read_len}", cmd.len());
            let written = self.io.raw_write(&cmd)?;
            if written != cmd.len() {
                return Err(FtdiError::ShortWrite {
                    expected: cmd.len(),
                    written,
                });
            }
            if read_len > 0 {
                let start = self.received.len();
                self.received.resize(start + read_len, 0);
                let read = self.io.raw_read(&mut self.received[start..])?;
                if read != read_len {
                    self.received.truncate(start);
                    return Err(FtdiError::ShortRead {
                        expected: read_len,
                        read,
                    });
                }
            }
        }
        Ok(())
    }

    /// Change the pin shadow and queue the matching set-bits commands for both ports.
    pub(crate) fn update_pins(
        &mut self,
        change: impl FnOnce(&mut GpioByte, &mut GpioByte),
    ) -> Result<(), FtdiError> {
        change(&mut self.lower, &mut self.upper);
        let (lower, upper) = (self.lower, self.upper);
        self.write(|cmd| {
            cmd.set_gpio_lower(lower.value, lower.direction)
                .set_gpio_upper(upper.value, upper.direction);
        })
    }

    pub(crate) fn apply_program(&mut self, program: &PinProgram) -> Result<(), FtdiError> {
        let program = *program;
        self.update_pins(|lower, upper| program.apply(lower, upper))
    }

    /// Sets the MPSSE clock frequency
    ///
    /// # Returns
    /// The frequency actually set.
    ///
    /// # Notes
    /// FT2232D supports frequencies from 92Hz to 6MHz.
    /// FTx232H supports frequencies from 458Hz to 30MHz.
    pub fn set_frequency(&mut self, frequency_hz: usize) -> Result<usize, FtdiError> {
        let (max_frequency, _) = self.chip_type.max_frequency();
        let min_frequency = max_frequency / (u16::MAX as usize + 1) + 1;

        let divisor = if frequency_hz > max_frequency {
            log::warn!("frequency out of range [{min_frequency}-{max_frequency}Hz], using {max_frequency}Hz");
            1
        } else if frequency_hz < min_frequency {
            log::warn!("frequency out of range [{min_frequency}-{max_frequency}Hz], using {min_frequency}Hz");
            u16::MAX as usize + 1
        } else {
            max_frequency.div_ceil(frequency_hz)
        };
        self.set_clock_divisor((divisor - 1) as u16)?;
        Ok(max_frequency / divisor)
    }

    /// Program the raw clock divisor, TCK = base / (divisor + 1).
    pub fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), FtdiError> {
        let (max_frequency, clk_div_by5) = self.chip_type.max_frequency();
        self.write(|cmd| {
            cmd.set_clock(divisor, clk_div_by5);
        })?;
        self.flush()?;
        log::info!(
            "Frequency set to {}Hz",
            max_frequency / (divisor as usize + 1)
        );
        Ok(())
    }

    /// Drive the cable's reset line.
    pub fn set_srst(&mut self, assert: bool) -> Result<(), FtdiError> {
        let program = if assert {
            self.cable.assert_srst
        } else {
            self.cable.deassert_srst
        };
        if program.is_empty() {
            return Err(FtdiError::NotSupported("SRST"));
        }
        log::debug!("SRST {}", if assert { "asserted" } else { "released" });
        self.apply_program(&program)?;
        self.flush()?;
        self.srst_asserted = assert;
        Ok(())
    }

    /// Whether the reset line is held low, from the readback pin when the cable has one.
    pub fn srst_asserted(&mut self) -> Result<bool, FtdiError> {
        let Some(pin) = self.cable.srst_readback else {
            return Ok(self.srst_asserted);
        };
        self.write(|cmd| {
            match pin {
                Pin::Lower(_) => cmd.gpio_lower(),
                Pin::Upper(_) => cmd.gpio_upper(),
            };
        })?;
        let response = self.read()?;
        Ok(response[0] & pin.mask() == 0)
    }
}
