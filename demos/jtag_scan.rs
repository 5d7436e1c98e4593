use std::{
    sync::{Arc, Mutex},
    time::Instant,
};

use ftdi_swj::{CableDescriptor, FtdiMpsse, jtag::FtdiJtag, list_ftdi_devices};

fn main() -> anyhow::Result<()> {
    env_logger::init();
    let now = Instant::now();
    let devices = list_ftdi_devices()?;
    assert!(!devices.is_empty(), "Not found Ftdi devices");
    let cable = CableDescriptor::find("ftdi-jtag").expect("built-in cable");
    let mut mpsse = FtdiMpsse::open(&devices[0].usb_device, cable)?;
    mpsse.set_frequency(6_000_000)?;
    let mut jtag = FtdiJtag::init(Arc::new(Mutex::new(mpsse)))?;
    let ids = jtag.scan_chain()?;
    println!("Scan Result:{ids:#x?}");
    println!("Finish Scan Using {:?}", now.elapsed());
    Ok(())
}
