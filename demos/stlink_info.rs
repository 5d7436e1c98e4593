use ftdi_swj::{DapAccess, Port, ProbeControl, list_stlink_devices, stlink::StLink};

/// Usage: stlink_info [serial]
fn main() -> anyhow::Result<()> {
    env_logger::init();
    for info in list_stlink_devices()? {
        println!(
            "found {:#06x} serial {:?}",
            info.product_id(),
            info.serial_number
        );
    }
    let serial = std::env::args().nth(1);
    let mut stlink = StLink::open(serial.as_deref())?;
    println!("version:{:?}", stlink.version());
    println!("target voltage:{:.2}V", stlink.target_voltage()?);
    stlink.enter_debug_swd()?;
    println!("core id:{:#010x}", stlink.read_core_id()?);
    let dpidr = stlink.read_register(Port::Dp, 0)?;
    println!("dpidr:{dpidr:#010x}");
    stlink.open_ap(0)?;
    let mut vectors = [0u8; 8];
    stlink.read_memory(0x0800_0000, &mut vectors)?;
    println!("reset vectors:{vectors:02x?}");
    stlink.reset_line(true)?;
    stlink.reset_line(false)?;
    stlink.close_ap(0)?;
    stlink.leave_state()?;
    Ok(())
}
