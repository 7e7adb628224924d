//! Transport layer for I/O abstraction.
//!
//! A [`Connector`] opens a [`Transport`] for a device path.  The link
//! manager only ever talks to these traits, so the same supervision code
//! drives a real UART ([`SerialConnector`]) or the in-memory
//! [`mock::MockConnector`] used by tests.

use std::io;
use std::time::Duration;

use crate::error::LinkError;

pub mod mock;
mod serial;

pub use serial::{SerialConnector, SerialTransport};

/// One open byte stream to a microcontroller.
pub trait Transport: Send {
    /// Read into `buffer`, returning the number of bytes read.
    ///
    /// A read timeout is reported as `Ok(0)`, not as an error; only genuine
    /// I/O failures (device removed, port closed) return `Err`.
    fn read(&mut self, buffer: &mut [u8]) -> io::Result<usize>;

    /// Write all of `data` and flush it to the wire.
    fn write_all(&mut self, data: &[u8]) -> io::Result<()>;
}

/// Opens transports by device identifier.
pub trait Connector: Send + Sync {
    fn open(
        &self,
        device: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Box<dyn Transport>, LinkError>;
}
