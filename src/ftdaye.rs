use std::time::{Duration, Instant};

use nusb::transfer::{Control, ControlType, Recipient};

use crate::{
    FtdiError, Interface,
    mpsse::RawIo,
    usb::{BulkTransport, TIMEOUT},
};

#[repr(C)]
#[expect(unused)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum BitMode {
    Reset = 0,
    Bitbang = 1,
    Mpsse = 2,
    SyncBb = 4,
    Mcu = 8,
    Opto = 16,
    Cbus = 32,
    SyncFf = 64,
    Ft1284 = 128,
}

/// Every IN packet starts with two modem status bytes.
const STATUS_LEN: usize = 2;

pub(crate) struct FtdiContext {
    /// USB device handle
    handle: nusb::Interface,
    /// FTDI device interface
    interface: Interface,
    write_ep: u8,
    read_ep: u8,
    max_packet_size: usize,
    /// Payload bytes received past the end of the last read.
    spill: Vec<u8>,
}

impl FtdiContext {
    pub(crate) fn new(
        handle: nusb::Interface,
        interface: Interface,
        max_packet_size: usize,
    ) -> Self {
        Self {
            handle,
            interface,
            write_ep: interface.write_ep(),
            read_ep: interface.read_ep(),
            max_packet_size,
            spill: Vec::new(),
        }
    }
    pub(crate) fn into_mpsse(mut self, mask: u8) -> Result<Self, FtdiError> {
        self.usb_reset()?;
        self.usb_purge_buffers()?;
        self.set_latency_timer(16)?;
        self.set_bitmode(mask, BitMode::Mpsse)?;
        Ok(self)
    }
    fn sio_write(&mut self, request: u8, value: u16) -> Result<(), FtdiError> {
        self.handle
            .control_out_blocking(
                Control {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: self.interface.index(),
                },
                &[],
                TIMEOUT,
            )
            .map_err(std::io::Error::from)?;

        Ok(())
    }

    fn usb_reset(&mut self) -> Result<(), FtdiError> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_SIO: u16 = 0;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_SIO)
    }

    fn usb_purge_buffers(&mut self) -> Result<(), FtdiError> {
        const SIO_RESET_REQUEST: u8 = 0;
        const SIO_RESET_PURGE_RX: u16 = 1;
        const SIO_RESET_PURGE_TX: u16 = 2;

        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_TX)?;
        self.sio_write(SIO_RESET_REQUEST, SIO_RESET_PURGE_RX)?;
        self.spill.clear();
        Ok(())
    }

    fn set_latency_timer(&mut self, value: u8) -> Result<(), FtdiError> {
        const SIO_SET_LATENCY_TIMER_REQUEST: u8 = 0x09;

        self.sio_write(SIO_SET_LATENCY_TIMER_REQUEST, value as u16)
    }

    fn set_bitmode(&mut self, bitmask: u8, mode: BitMode) -> Result<(), FtdiError> {
        const SIO_SET_BITMODE_REQUEST: u8 = 0x0B;

        self.sio_write(
            SIO_SET_BITMODE_REQUEST,
            u16::from_le_bytes([bitmask, mode as u8]),
        )
    }
}

impl RawIo for FtdiContext {
    fn raw_write(&mut self, data: &[u8]) -> Result<usize, FtdiError> {
        let mut written = 0;
        for batch in data.chunks(self.max_packet_size) {
            let n = self.handle.write_bulk(self.write_ep, batch, TIMEOUT)?;
            written += n;
            if n < batch.len() {
                break;
            }
        }
        Ok(written)
    }

    fn raw_read(&mut self, buf: &mut [u8]) -> Result<usize, FtdiError> {
        let deadline = Instant::now() + TIMEOUT;
        let mut read_len = self.spill.len().min(buf.len());
        buf[..read_len].copy_from_slice(&self.spill[..read_len]);
        self.spill.drain(..read_len);

        let mut packet = vec![0; self.max_packet_size];
        while read_len < buf.len() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining == Duration::ZERO {
                break;
            }
            let n = self.handle.read_bulk(self.read_ep, &mut packet, remaining)?;
            if n <= STATUS_LEN {
                continue;
            }
            let data = &packet[STATUS_LEN..n];
            let take = data.len().min(buf.len() - read_len);
            buf[read_len..read_len + take].copy_from_slice(&data[..take]);
            self.spill.extend_from_slice(&data[take..]);
            read_len += take;
        }
        Ok(read_len)
    }
}
