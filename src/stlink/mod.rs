//! ST-Link v2/v2-1/v3 adapters over their vendor USB protocol.
//!
//! Every request is a 16-byte command on the OUT endpoint answered by a fixed
//! size response whose first byte is a [`Status`]. Memory transfers are the
//! exception: their result has to be fetched with a separate status query.

pub mod constants;

use constants::{
    BLOCK_SIZE_V2, BLOCK_SIZE_V3, CMD_LEN, DP_PORT, MIN_JTAG_VERSION, Mode, PID_V1, PID_V21,
    PID_V21_MSD, Status, commands,
};

use crate::{
    dap::{DapAccess, DapError, Port, ProbeControl, dp},
    usb::{BulkTransport, UsbError, UsbPipe},
};

#[derive(Debug, thiserror::Error)]
pub enum StlinkError {
    #[error(transparent)]
    Transfer(#[from] UsbError),
    #[error("USB I/O error")]
    Usb(#[from] std::io::Error),
    #[error("adapter returned status {0:?}")]
    Status(Status),
    #[error("JTAG firmware version {0} is too old, please update the ST-Link firmware")]
    FirmwareOutdated(u8),
    #[error("ST-Link v1 is not supported")]
    UnsupportedV1,
    #[error("no ST-Link found")]
    NotFound,
    #[error("multiple ST-Links attached, select one by serial number")]
    MultipleDevices,
    #[error("request of {0} bytes is too large for one transfer")]
    Oversize(usize),
    #[error("expected {expected} response bytes, got {got}")]
    ShortResponse { expected: usize, got: usize },
}

/// Packed firmware version word of pre-v3 hardware.
#[bitfield_struct::bitfield(u16, order = Lsb)]
struct VersionWord {
    /// SWIM or mass storage version, depending on the product.
    #[bits(6)]
    minor: u8,
    #[bits(6)]
    jtag: u8,
    #[bits(4)]
    hardware: u8,
}

/// Adapter identity learned during [`StLink::connect`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Version {
    pub hardware: u8,
    pub jtag: u8,
    pub swim: u8,
    pub mass: u8,
    pub bridge: u8,
    pub vendor_id: u16,
    pub product_id: u16,
}

/// Session with one claimed ST-Link.
pub struct StLink<T> {
    pipe: UsbPipe<T>,
    product_id: u16,
    version: Version,
    /// Largest payload of one memory command.
    block_size: usize,
    /// Last value written to DP SELECT, never sent to the adapter.
    select: u32,
}

impl StLink<nusb::Interface> {
    /// Find an adapter, claim its interface 0 and negotiate the session.
    ///
    /// Without `serial` exactly one adapter must be attached.
    pub fn open(serial: Option<&str>) -> Result<Self, StlinkError> {
        let mut candidates = nusb::list_devices()?
            .filter(|info| constants::is_stlink(info.vendor_id(), info.product_id()))
            .filter(|info| serial.is_none_or(|serial| info.serial_number() == Some(serial)));
        let info = candidates.next().ok_or(StlinkError::NotFound)?;
        if serial.is_none() && candidates.next().is_some() {
            return Err(StlinkError::MultipleDevices);
        }
        let product_id = info.product_id();
        if product_id == PID_V1 {
            return Err(StlinkError::UnsupportedV1);
        }
        log::info!(
            "Open ST-Link [{:#06x},{product_id:#06x}] serial {:?}",
            info.vendor_id(),
            info.serial_number()
        );
        let interface = info.open()?.claim_interface(0)?;
        let mut stlink = StLink::new(interface, product_id);
        stlink.connect()?;
        Ok(stlink)
    }
}

impl<T: BulkTransport> StLink<T> {
    /// Wrap a claimed interface. No traffic until [`connect`](Self::connect).
    pub fn new(transport: T, product_id: u16) -> Self {
        let (ep_out, ep_in) = constants::endpoints(product_id);
        Self {
            pipe: UsbPipe::new(transport, ep_out, ep_in),
            product_id,
            version: Version::default(),
            block_size: BLOCK_SIZE_V2,
            select: 0,
        }
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Negotiate versions and bring the adapter back to idle.
    ///
    /// Hardware before v3 needs JTAG firmware [`MIN_JTAG_VERSION`] or newer.
    pub fn connect(&mut self) -> Result<Version, StlinkError> {
        let version = self.read_version()?;
        if version.hardware < 3 && version.jtag < MIN_JTAG_VERSION {
            log::error!("ST-Link firmware V{}J{} is outdated", version.hardware, version.jtag);
            return Err(StlinkError::FirmwareOutdated(version.jtag));
        }
        self.version = version;
        self.select = 0;
        self.leave_state()?;
        Ok(version)
    }

    fn read_version(&mut self) -> Result<Version, StlinkError> {
        let mut data = [0u8; 6];
        self.command(&[commands::GET_VERSION], &mut data)?;
        let word = VersionWord::from_bits(u16::from_be_bytes([data[0], data[1]]));
        let mut version = Version {
            hardware: word.hardware(),
            vendor_id: u16::from_le_bytes([data[2], data[3]]),
            product_id: u16::from_le_bytes([data[4], data[5]]),
            ..Default::default()
        };
        if version.hardware == 3 {
            let mut data = [0u8; 16];
            self.command(&[commands::GET_VERSION_EX], &mut data)?;
            version.swim = data[1];
            version.jtag = data[2];
            version.mass = data[3];
            version.bridge = data[4];
            self.block_size = BLOCK_SIZE_V3;
        } else {
            version.jtag = word.jtag();
            if matches!(self.product_id, PID_V21 | PID_V21_MSD) {
                version.mass = word.minor();
            } else {
                version.swim = word.minor();
            }
            self.block_size = BLOCK_SIZE_V2;
        }
        log::info!(
            "ST-Link V{}J{} S{} M{} B{}, block size {}",
            version.hardware,
            version.jtag,
            version.swim,
            version.mass,
            version.bridge,
            self.block_size
        );
        Ok(version)
    }

    pub fn current_mode(&mut self) -> Result<Mode, StlinkError> {
        let mut data = [0u8; 2];
        self.command(&[commands::GET_CURRENT_MODE], &mut data)?;
        Ok(Mode::from(data[0]))
    }

    /// Exit DFU, SWIM or debug mode so another session can take the adapter.
    pub fn leave_state(&mut self) -> Result<(), StlinkError> {
        let exit = match self.current_mode()? {
            Mode::Dfu => [commands::DFU_COMMAND, commands::DFU_EXIT],
            Mode::Swim => [commands::SWIM_COMMAND, commands::SWIM_EXIT],
            Mode::Debug => [commands::DEBUG_COMMAND, commands::DEBUG_EXIT],
            mode => {
                log::debug!("staying in {mode:?} mode");
                return Ok(());
            }
        };
        log::debug!("leaving mode with {exit:02x?}");
        self.command(&exit, &mut [])
    }

    /// Target supply in volts, 0 when the adapter reports no calibration.
    pub fn target_voltage(&mut self) -> Result<f32, StlinkError> {
        let mut data = [0u8; 8];
        self.command(&[commands::GET_TARGET_VOLTAGE], &mut data)?;
        let reference = u16::from_le_bytes([data[0], data[1]]);
        let measured = u16::from_le_bytes([data[4], data[5]]);
        if reference == 0 {
            return Ok(0.0);
        }
        Ok(2.0 * measured as f32 * 1.2 / reference as f32)
    }

    /// Fastest SWD clock, then attach without resetting the target.
    pub fn enter_debug_swd(&mut self) -> Result<(), StlinkError> {
        self.set_clock_divisor(1)?;
        log::debug!("enter SWD");
        self.debug_command(&[commands::ENTER, commands::ENTER_SWD_NO_RESET])
    }

    pub fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), StlinkError> {
        let [lo, hi] = divisor.to_le_bytes();
        self.debug_command(&[commands::SWD_SET_FREQ, lo, hi])
    }

    /// Drive nRST low (`true`) or high.
    pub fn drive_reset(&mut self, assert: bool) -> Result<(), StlinkError> {
        let level = if assert {
            commands::DRIVE_NRST_LOW
        } else {
            commands::DRIVE_NRST_HIGH
        };
        self.debug_command(&[commands::DRIVE_NRST, level])
    }

    pub fn read_core_id(&mut self) -> Result<u32, StlinkError> {
        let mut data = [0u8; 12];
        self.command(&[commands::DEBUG_COMMAND, commands::READ_IDCODES], &mut data)?;
        check_status(data[0])?;
        let id = word_at(&data, 4);
        log::debug!("core ID {id:#010x}");
        Ok(id)
    }

    /// Raw DAP register read. `port` is the APSEL or [`DP_PORT`].
    pub fn read_port(&mut self, port: u16, addr: u16) -> Result<u32, StlinkError> {
        let [p0, p1] = port.to_le_bytes();
        let [a0, a1] = addr.to_le_bytes();
        let mut data = [0u8; 8];
        self.command(
            &[commands::DEBUG_COMMAND, commands::READ_DAP_REG, p0, p1, a0, a1],
            &mut data,
        )?;
        check_status(data[0])?;
        let value = word_at(&data, 4);
        log::trace!("read port {port:#06x} addr {addr:#06x} = {value:#010x}");
        Ok(value)
    }

    /// Raw DAP register write. A DP SELECT write is only remembered.
    pub fn write_port(&mut self, port: u16, addr: u16, value: u32) -> Result<(), StlinkError> {
        if port == DP_PORT && addr == dp::SELECT as u16 {
            log::trace!("caching SELECT {value:#010x}");
            self.select = value;
            return Ok(());
        }
        let [p0, p1] = port.to_le_bytes();
        let [a0, a1] = addr.to_le_bytes();
        let [v0, v1, v2, v3] = value.to_le_bytes();
        log::trace!("write port {port:#06x} addr {addr:#06x} = {value:#010x}");
        self.debug_command(&[commands::WRITE_DAP_REG, p0, p1, a0, a1, v0, v1, v2, v3])
    }

    /// DP register 0x4 is banked by SELECT.DPBANKSEL.
    fn dp_addr(&self, addr: u8) -> u16 {
        if addr & 0x0F == dp::CTRL_STAT {
            (self.select as u16 & 0x0F) << 4 | addr as u16 & 0x0F
        } else {
            addr as u16
        }
    }

    /// AP and bank from the cached SELECT.
    fn ap_addr(&self, addr: u8) -> (u16, u16) {
        let port = (self.select >> 24) as u16;
        let bank = (self.select >> 4) as u16 & 0x0F;
        (port, bank << 4 | addr as u16 & 0x0F)
    }

    pub fn read_dp(&mut self, addr: u8) -> Result<u32, StlinkError> {
        self.read_port(DP_PORT, self.dp_addr(addr))
    }

    pub fn write_dp(&mut self, addr: u8, value: u32) -> Result<(), StlinkError> {
        self.write_port(DP_PORT, self.dp_addr(addr), value)
    }

    /// Read from the AP and bank chosen by the last SELECT write.
    pub fn read_ap(&mut self, addr: u8) -> Result<u32, StlinkError> {
        let (port, addr) = self.ap_addr(addr);
        self.read_port(port, addr)
    }

    /// Write to the AP and bank chosen by the last SELECT write.
    pub fn write_ap(&mut self, addr: u8, value: u32) -> Result<(), StlinkError> {
        let (port, addr) = self.ap_addr(addr);
        self.write_port(port, addr, value)
    }

    pub fn open_ap(&mut self, ap: u8) -> Result<(), StlinkError> {
        log::debug!("open AP {ap}");
        self.debug_command(&[commands::INIT_AP, ap])
    }

    pub fn close_ap(&mut self, ap: u8) -> Result<(), StlinkError> {
        log::debug!("close AP {ap}");
        self.debug_command(&[commands::CLOSE_AP_DBG, ap])
    }

    /// Fill `data` from target memory at `addr` in one transfer.
    ///
    /// The width follows the alignment of both address and length. Byte
    /// reads are limited to the block size.
    pub fn read_memory(&mut self, addr: u32, data: &mut [u8]) -> Result<(), StlinkError> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len();
        if len > u16::MAX as usize {
            return Err(StlinkError::Oversize(len));
        }
        let opcode = match Width::select(addr, len) {
            Width::U8 if len > self.block_size => return Err(StlinkError::Oversize(len)),
            Width::U8 => commands::READMEM_8BIT,
            Width::U16 => commands::READMEM_16BIT,
            Width::U32 => commands::READMEM_32BIT,
        };
        log::trace!("read memory {len} bytes at {addr:#010x} with {opcode:#04x}");
        // A single byte still comes back as two
        let mut buf = vec![0u8; len.max(2)];
        self.command(&memory_command(opcode, addr, len), &mut buf)?;
        data.copy_from_slice(&buf[..len]);
        self.rw_status()
    }

    /// Write `data` to target memory at `addr`, choosing the width like [`read_memory`](Self::read_memory).
    pub fn write_memory(&mut self, addr: u32, data: &[u8]) -> Result<(), StlinkError> {
        if data.is_empty() {
            return Ok(());
        }
        match Width::select(addr, data.len()) {
            Width::U8 => self.write_memory8(addr, data),
            Width::U16 => self.write_memory16(addr, data),
            Width::U32 => self.write_memory32(addr, data),
        }
    }

    /// Byte writes, split into block size chunks with a status check after each.
    pub fn write_memory8(&mut self, addr: u32, data: &[u8]) -> Result<(), StlinkError> {
        let mut addr = addr;
        for chunk in data.chunks(self.block_size) {
            self.write_block(commands::WRITEMEM_8BIT, addr, chunk)?;
            addr = addr.wrapping_add(chunk.len() as u32);
        }
        Ok(())
    }

    pub fn write_memory16(&mut self, addr: u32, data: &[u8]) -> Result<(), StlinkError> {
        self.write_block(commands::WRITEMEM_16BIT, addr, data)
    }

    pub fn write_memory32(&mut self, addr: u32, data: &[u8]) -> Result<(), StlinkError> {
        self.write_block(commands::WRITEMEM_32BIT, addr, data)
    }

    fn write_block(&mut self, opcode: u8, addr: u32, data: &[u8]) -> Result<(), StlinkError> {
        if data.len() > u16::MAX as usize {
            return Err(StlinkError::Oversize(data.len()));
        }
        log::trace!(
            "write memory {} bytes at {addr:#010x} with {opcode:#04x}",
            data.len()
        );
        self.command(&memory_command(opcode, addr, data.len()), &mut [])?;
        self.pipe.transfer(data, &mut [])?;
        self.rw_status()
    }

    fn rw_status(&mut self) -> Result<(), StlinkError> {
        let mut data = [0u8; 12];
        self.command(&[commands::DEBUG_COMMAND, commands::GETLASTRWSTATUS2], &mut data)?;
        check_status(data[0])
    }

    pub fn read_core_register(&mut self, index: u8) -> Result<u32, StlinkError> {
        let mut data = [0u8; 8];
        self.command(&[commands::DEBUG_COMMAND, commands::READREG, index], &mut data)?;
        check_status(data[0])?;
        let value = word_at(&data, 4);
        log::trace!("read reg {index} = {value:#010x}");
        Ok(value)
    }

    pub fn write_core_register(&mut self, index: u8, value: u32) -> Result<(), StlinkError> {
        let [v0, v1, v2, v3] = value.to_le_bytes();
        log::trace!("write reg {index} = {value:#010x}");
        self.debug_command(&[commands::WRITEREG, index, v0, v1, v2, v3])
    }

    /// R0-R15, xPSR, MSP, PSP, CONTROL/FAULTMASK/BASEPRI/PRIMASK and FPSCR as reported by the adapter.
    pub fn read_all_core_registers(&mut self) -> Result<[u32; 21], StlinkError> {
        let mut data = [0u8; 88];
        self.command(&[commands::DEBUG_COMMAND, commands::READALLREGS], &mut data)?;
        check_status(data[0])?;
        let mut regs = [0u32; 21];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = word_at(&data, 4 + 4 * i);
        }
        Ok(regs)
    }

    /// Debug command with a two byte status response.
    fn debug_command(&mut self, args: &[u8]) -> Result<(), StlinkError> {
        let mut cmd = [0u8; CMD_LEN];
        cmd[0] = commands::DEBUG_COMMAND;
        cmd[1..=args.len()].copy_from_slice(args);
        let mut data = [0u8; 2];
        self.command(&cmd[..=args.len()], &mut data)?;
        check_status(data[0])
    }

    /// Send `cmd` padded to [`CMD_LEN`] and receive exactly `response.len()` bytes.
    fn command(&mut self, cmd: &[u8], response: &mut [u8]) -> Result<(), StlinkError> {
        let mut buf = [0u8; CMD_LEN];
        buf[..cmd.len()].copy_from_slice(cmd);
        let got = self.pipe.transfer(&buf, response)?;
        if got < response.len() {
            return Err(StlinkError::ShortResponse {
                expected: response.len(),
                got,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    U8,
    U16,
    U32,
}

impl Width {
    /// Narrowest width both `addr` and `len` are aligned to.
    fn select(addr: u32, len: usize) -> Self {
        let bits = addr as usize | len;
        if bits & 1 != 0 {
            Width::U8
        } else if bits & 3 != 0 {
            Width::U16
        } else {
            Width::U32
        }
    }
}

fn memory_command(opcode: u8, addr: u32, len: usize) -> [u8; 8] {
    let [a0, a1, a2, a3] = addr.to_le_bytes();
    let [l0, l1] = (len as u16).to_le_bytes();
    [commands::DEBUG_COMMAND, opcode, a0, a1, a2, a3, l0, l1]
}

fn word_at(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

fn check_status(status: u8) -> Result<(), StlinkError> {
    match Status::from(status) {
        Status::Ok => Ok(()),
        Status::WriteVerifyError => {
            log::warn!("write verify error, ignoring");
            Ok(())
        }
        status => {
            log::debug!("status {status:?}");
            Err(StlinkError::Status(status))
        }
    }
}

impl<T: BulkTransport> DapAccess for StLink<T> {
    fn read_register(&mut self, port: Port, addr: u8) -> Result<u32, DapError> {
        Ok(match port {
            Port::Dp => self.read_dp(addr)?,
            Port::Ap(ap) => self.read_port(ap as u16, addr as u16)?,
        })
    }

    fn write_register(&mut self, port: Port, addr: u8, value: u32) -> Result<(), DapError> {
        Ok(match port {
            Port::Dp => self.write_dp(addr, value)?,
            Port::Ap(ap) => self.write_port(ap as u16, addr as u16, value)?,
        })
    }
}

impl<T: BulkTransport> ProbeControl for StLink<T> {
    fn reset_line(&mut self, assert: bool) -> Result<(), DapError> {
        Ok(self.drive_reset(assert)?)
    }

    fn set_clock_divisor(&mut self, divisor: u16) -> Result<(), DapError> {
        Ok(StLink::set_clock_divisor(self, divisor)?)
    }
}
