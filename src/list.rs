use nusb::DeviceInfo;

use crate::{
    ChipType, FtdiError, Interface,
    cable::{CableDescriptor, KNOWN_CABLES},
    stlink::{StlinkError, constants},
};

/// Known properties associated to particular FTDI chip types.
#[derive(Debug, Clone, Copy)]
struct FtdiDevice {
    /// The (VID, PID) pair of this device.
    id: (u16, u16),

    /// FTDI chip type to use if the device is not recognized.
    ///
    /// "FTDI compatible" devices may use the same VID/PID pair as an FTDI device, but
    /// they may be implemented by a completely third party solution. In this case,
    /// we still try the same `bcdDevice` based detection, but if it fails, we fall back
    /// to this chip type.
    fallback_chip_type: ChipType,
}

/// Known FTDI device variants.
static FTDI_COMPAT_DEVICES: &[FtdiDevice] = &[
    //
    // --- FTDI VID/PID pairs ---
    //
    // FTDI Ltd. FT2232C/D/H Dual UART/FIFO IC
    FtdiDevice {
        id: (0x0403, 0x6010),
        fallback_chip_type: ChipType::FT2232H,
    },
    // FTDI Ltd. FT4232H Quad HS USB-UART/FIFO IC
    FtdiDevice {
        id: (0x0403, 0x6011),
        fallback_chip_type: ChipType::FT4232H,
    },
    // FTDI Ltd. FT232H Single HS USB-UART/FIFO IC
    FtdiDevice {
        id: (0x0403, 0x6014),
        fallback_chip_type: ChipType::FT232H,
    },
    //
    // --- Third-party VID/PID pairs ---
    //
    // Olimex Ltd. ARM-USB-OCD
    FtdiDevice {
        id: (0x15ba, 0x0003),
        fallback_chip_type: ChipType::FT2232D,
    },
    // Olimex Ltd. ARM-USB-TINY
    FtdiDevice {
        id: (0x15ba, 0x0004),
        fallback_chip_type: ChipType::FT2232D,
    },
    // Olimex Ltd. ARM-USB-TINY-H
    FtdiDevice {
        id: (0x15ba, 0x002a),
        fallback_chip_type: ChipType::FT2232H,
    },
    // Olimex Ltd. ARM-USB-OCD-H
    FtdiDevice {
        id: (0x15ba, 0x002b),
        fallback_chip_type: ChipType::FT2232H,
    },
];

pub struct FtdiDeviceInfo {
    pub usb_device: DeviceInfo,
    pub chip_type: ChipType,
    /// Interfaces with an MPSSE.
    pub interfaces: &'static [Interface],
}

impl FtdiDeviceInfo {
    /// Generic cable layouts built on this VID/PID.
    pub fn cables(&self) -> impl Iterator<Item = &'static CableDescriptor> + use<> {
        let id = (self.usb_device.vendor_id(), self.usb_device.product_id());
        KNOWN_CABLES
            .iter()
            .filter(move |cable| (cable.vendor_id, cable.product_id) == id)
    }
}

/// Attached FTDI devices with a known VID/PID.
pub fn list_ftdi_devices() -> Result<Vec<FtdiDeviceInfo>, FtdiError> {
    fn filter_map(info: DeviceInfo) -> Option<FtdiDeviceInfo> {
        let device = FTDI_COMPAT_DEVICES
            .iter()
            .find(|device| (info.vendor_id(), info.product_id()) == device.id)?;
        log::info!(
            "Find {:?}:[{:#06x?},{:#06x?}]",
            device.fallback_chip_type,
            device.id.0,
            device.id.1
        );
        Some(FtdiDeviceInfo {
            usb_device: info,
            chip_type: device.fallback_chip_type,
            interfaces: device.fallback_chip_type.mpsse_list(),
        })
    }
    Ok(nusb::list_devices()?.filter_map(filter_map).collect())
}

pub struct StlinkDeviceInfo {
    pub usb_device: DeviceInfo,
    pub serial_number: Option<String>,
}

impl StlinkDeviceInfo {
    pub fn product_id(&self) -> u16 {
        self.usb_device.product_id()
    }
}

/// Attached ST-Link adapters of any generation, V1 included.
pub fn list_stlink_devices() -> Result<Vec<StlinkDeviceInfo>, StlinkError> {
    Ok(nusb::list_devices()?
        .filter(|info| constants::is_stlink(info.vendor_id(), info.product_id()))
        .map(|info| {
            log::info!(
                "Find ST-Link [{:#06x},{:#06x}] serial {:?}",
                info.vendor_id(),
                info.product_id(),
                info.serial_number()
            );
            StlinkDeviceInfo {
                serial_number: info.serial_number().map(str::to_owned),
                usb_device: info,
            }
        })
        .collect())
}
