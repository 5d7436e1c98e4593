pub const STLINK_VID: u16 = 0x0483;
/// ST-Link generations live in PID range 0x374x, except the V2-1 without mass storage.
pub const PID_GROUP_MASK: u16 = 0xfff0;
pub const PID_GROUP: u16 = 0x3740;

pub const PID_V1: u16 = 0x3744;
pub const PID_V2: u16 = 0x3748;
pub const PID_V21: u16 = 0x374b;
pub const PID_V21_MSD: u16 = 0x3752;
pub const PID_V3: u16 = 0x374f;

/// Older hardware needs at least this JTAG firmware version.
pub const MIN_JTAG_VERSION: u8 = 32;
pub const BLOCK_SIZE_V3: usize = 512;
pub const BLOCK_SIZE_V2: usize = 64;

/// Every debug command is padded to this length on the wire.
pub const CMD_LEN: usize = 16;

/// Port number addressing the DP in DAP register commands.
pub const DP_PORT: u16 = 0xffff;

pub const fn is_stlink(vid: u16, pid: u16) -> bool {
    vid == STLINK_VID && (pid & PID_GROUP_MASK == PID_GROUP || pid == PID_V21_MSD)
}

/// (OUT, IN) bulk endpoints by product ID.
pub const fn endpoints(pid: u16) -> (u8, u8) {
    match pid {
        PID_V2 => (0x02, 0x81),
        _ => (0x01, 0x81),
    }
}

pub mod commands {
    pub const GET_VERSION: u8 = 0xf1;
    pub const DEBUG_COMMAND: u8 = 0xf2;
    pub const DFU_COMMAND: u8 = 0xf3;
    pub const SWIM_COMMAND: u8 = 0xf4;
    pub const GET_CURRENT_MODE: u8 = 0xf5;
    pub const GET_TARGET_VOLTAGE: u8 = 0xf7;
    pub const GET_VERSION_EX: u8 = 0xfb;

    // Mode exits.
    pub const DFU_EXIT: u8 = 0x07;
    pub const SWIM_EXIT: u8 = 0x01;
    pub const DEBUG_EXIT: u8 = 0x21;

    // Debug commands.
    pub const READMEM_32BIT: u8 = 0x07;
    pub const WRITEMEM_32BIT: u8 = 0x08;
    pub const READMEM_8BIT: u8 = 0x0c;
    pub const WRITEMEM_8BIT: u8 = 0x0d;
    pub const ENTER: u8 = 0x30;
    pub const READ_IDCODES: u8 = 0x31;
    pub const READREG: u8 = 0x33;
    pub const WRITEREG: u8 = 0x34;
    pub const READALLREGS: u8 = 0x3a;
    pub const DRIVE_NRST: u8 = 0x3c;
    pub const GETLASTRWSTATUS2: u8 = 0x3e;
    pub const SWD_SET_FREQ: u8 = 0x43;
    pub const READ_DAP_REG: u8 = 0x45;
    pub const WRITE_DAP_REG: u8 = 0x46;
    pub const READMEM_16BIT: u8 = 0x47;
    pub const WRITEMEM_16BIT: u8 = 0x48;
    pub const INIT_AP: u8 = 0x4b;
    pub const CLOSE_AP_DBG: u8 = 0x4c;

    // Parameters for ENTER.
    pub const ENTER_SWD_NO_RESET: u8 = 0xa3;

    // Parameters for DRIVE_NRST.
    pub const DRIVE_NRST_LOW: u8 = 0x00;
    pub const DRIVE_NRST_HIGH: u8 = 0x01;
}

/// First byte of a debug command response.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    Fault,
    GetIdcodeError,
    WriteError,
    WriteVerifyError,
    SwdApWait,
    SwdApFault,
    SwdApError,
    SwdApParityError,
    SwdDpWait,
    SwdDpFault,
    SwdDpError,
    SwdDpParityError,
    SwdApWdataError,
    SwdApStickyError,
    SwdApStickyOverrunError,
    Other(u8),
}

impl From<u8> for Status {
    fn from(value: u8) -> Status {
        use Status::*;
        match value {
            0x80 => Ok,
            0x81 => Fault,
            0x09 => GetIdcodeError,
            0x0c => WriteError,
            0x0d => WriteVerifyError,
            0x10 => SwdApWait,
            0x11 => SwdApFault,
            0x12 => SwdApError,
            0x13 => SwdApParityError,
            0x14 => SwdDpWait,
            0x15 => SwdDpFault,
            0x16 => SwdDpError,
            0x17 => SwdDpParityError,
            0x18 => SwdApWdataError,
            0x19 => SwdApStickyError,
            0x1a => SwdApStickyOverrunError,
            v => Other(v),
        }
    }
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }

    pub fn is_wait(self) -> bool {
        matches!(self, Status::SwdApWait | Status::SwdDpWait)
    }

    pub fn is_fault(self) -> bool {
        matches!(self, Status::Fault | Status::SwdApFault | Status::SwdDpFault)
    }
}

/// Adapter mode reported by GET_CURRENT_MODE.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Mode {
    Dfu,
    Mass,
    Debug,
    Swim,
    Bootloader,
    Unknown(u8),
}

impl From<u8> for Mode {
    fn from(value: u8) -> Mode {
        match value {
            0x00 => Mode::Dfu,
            0x01 => Mode::Mass,
            0x02 => Mode::Debug,
            0x03 => Mode::Swim,
            0x04 => Mode::Bootloader,
            v => Mode::Unknown(v),
        }
    }
}
