use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use ftdi_swj::{
    CableDescriptor, DapAccess, FtdiMpsse, Port, SwdDp, dap::dp, list_ftdi_devices, swd::FtdiSwd,
};

/// Usage: swd_idcode [cable], defaults to ftdi-swd-resistor.
fn main() -> anyhow::Result<()> {
    env_logger::init();
    let name = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "ftdi-swd-resistor".to_string());
    let cable = CableDescriptor::find(&name).ok_or_else(|| anyhow!("unknown cable {name}"))?;
    let devices = list_ftdi_devices()?;
    assert!(!devices.is_empty(), "Not found Ftdi devices");
    let mut mpsse = FtdiMpsse::open(&devices[0].usb_device, cable)?;
    mpsse.set_frequency(1_000_000)?;
    let mtx = Arc::new(Mutex::new(mpsse));
    let swd = FtdiSwd::init(mtx)?;
    println!("backend:{:?}", swd.backend());
    let mut dap = SwdDp::new(swd);
    // g431cbu6: 0x2BA01477; according to rm0440-47.8.5
    let idcode = dap.connect()?;
    println!("idcode:{idcode:#x?}");
    // Clear sticky errors, then power up debug and system
    dap.write_register(Port::Dp, dp::ABORT, 0x1E)?;
    dap.write_register(Port::Dp, dp::CTRL_STAT, 0x5000_0000)?;
    let ctrl_stat = dap.read_register(Port::Dp, dp::CTRL_STAT)?;
    println!("ctrl/stat:{ctrl_stat:#010x}");
    let idr = dap.read_register(Port::Ap(0), 0xFC)?;
    println!("AP0 IDR:{idr:#010x}");
    Ok(())
}
