//! Synchronous bulk transfers with a deadline.
//!
//! Each logical request is one bulk OUT followed by one bulk IN. The calling
//! thread blocks until both complete; a transfer that outlives [`TIMEOUT`] is
//! cancelled. A stalled endpoint gets its halt cleared once before the error is
//! returned, there is no retry at this level.

use std::time::Duration;

use async_io::{Timer, block_on};
use futures_lite::FutureExt;
use nusb::transfer::{RequestBuffer, TransferError};

/// Deadline applied to every bulk transfer.
pub const TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum UsbError {
    #[error("USB transfer timed out")]
    Timeout,
    #[error("USB endpoint {0:#04x} stalled")]
    Stall(u8),
    #[error("short USB write: {written} of {expected} bytes")]
    ShortWrite { expected: usize, written: usize },
    #[error("USB transfer failed: {0}")]
    Transfer(TransferError),
    #[error("USB I/O error")]
    Io(#[from] std::io::Error),
}

/// Blocking bulk primitives of one claimed USB interface.
pub trait BulkTransport {
    fn write_bulk(&mut self, endpoint: u8, data: &[u8], timeout: Duration)
    -> Result<usize, UsbError>;
    fn read_bulk(&mut self, endpoint: u8, buf: &mut [u8], timeout: Duration)
    -> Result<usize, UsbError>;
    fn clear_stall(&mut self, endpoint: u8) -> Result<(), UsbError>;
}

fn transfer_error(endpoint: u8, err: TransferError) -> UsbError {
    match err {
        TransferError::Stall => UsbError::Stall(endpoint),
        err => UsbError::Transfer(err),
    }
}

impl BulkTransport for nusb::Interface {
    fn write_bulk(
        &mut self,
        endpoint: u8,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut queue = self.bulk_out_queue(endpoint);
        queue.submit(data.to_vec());
        let Some(comp) = block_on(
            async { Some(queue.next_complete().await) }.or(async {
                Timer::after(timeout).await;
                None
            }),
        ) else {
            queue.cancel_all();
            let _ = block_on(queue.next_complete());
            return Err(UsbError::Timeout);
        };
        comp.status.map_err(|e| transfer_error(endpoint, e))?;
        Ok(comp.data.actual_length())
    }

    fn read_bulk(
        &mut self,
        endpoint: u8,
        buf: &mut [u8],
        timeout: Duration,
    ) -> Result<usize, UsbError> {
        let mut queue = self.bulk_in_queue(endpoint);
        queue.submit(RequestBuffer::new(buf.len()));
        let Some(comp) = block_on(
            async { Some(queue.next_complete().await) }.or(async {
                Timer::after(timeout).await;
                None
            }),
        ) else {
            queue.cancel_all();
            let _ = block_on(queue.next_complete());
            return Err(UsbError::Timeout);
        };
        comp.status.map_err(|e| transfer_error(endpoint, e))?;
        let n = comp.data.len().min(buf.len());
        buf[..n].copy_from_slice(&comp.data[..n]);
        Ok(n)
    }

    fn clear_stall(&mut self, endpoint: u8) -> Result<(), UsbError> {
        nusb::Interface::clear_halt(self, endpoint)?;
        Ok(())
    }
}

/// Command/response pipe over a pair of bulk endpoints.
pub struct UsbPipe<T> {
    transport: T,
    ep_out: u8,
    ep_in: u8,
    timeout: Duration,
}

impl<T: BulkTransport> UsbPipe<T> {
    pub fn new(transport: T, ep_out: u8, ep_in: u8) -> Self {
        Self {
            transport,
            ep_out,
            ep_in,
            timeout: TIMEOUT,
        }
    }

    /// Send `tx` (skipped when empty), then receive into `rx` (skipped when empty).
    ///
    /// Returns the number of bytes received.
    pub fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<usize, UsbError> {
        if !tx.is_empty() {
            let written = self
                .transport
                .write_bulk(self.ep_out, tx, self.timeout)
                .map_err(|e| self.recover(e))?;
            log::trace!("usb out {:02x?} ({written} bytes)", tx);
            if written != tx.len() {
                return Err(UsbError::ShortWrite {
                    expected: tx.len(),
                    written,
                });
            }
        }
        if rx.is_empty() {
            return Ok(0);
        }
        let read = self
            .transport
            .read_bulk(self.ep_in, rx, self.timeout)
            .map_err(|e| self.recover(e))?;
        log::trace!("usb in {:02x?}", &rx[..read]);
        Ok(read)
    }

    fn recover(&mut self, err: UsbError) -> UsbError {
        if let UsbError::Stall(endpoint) = err {
            log::debug!("clearing halt on endpoint {endpoint:#04x}");
            if let Err(e) = self.transport.clear_stall(endpoint) {
                log::warn!("clear halt on {endpoint:#04x} failed: {e}");
            }
        }
        err
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }
}
