//! RFCOMM serial port transport.
//!
//! On Linux, an RFCOMM channel can be bound to a TTY device
//! (e.g. `rfcomm bind 0 <address> 1` creates `/dev/rfcomm0`).
//! The device is then accessed like any other serial port using the
//! [`serial2-tokio`](https://crates.io/crates/serial2-tokio) crate.

use crate::session;
use embedded_io_adapters::tokio_1::FromTokio;
use embedded_io_async::ErrorType;
use log::{debug, info};
use serial2_tokio::{SerialPort, Settings};
use std::{
    io,
    path::{Path, PathBuf},
};
use tokio::task;

/// Serial port type implementing [`Read`](embedded_io_async::Read)
/// and [`Write`](embedded_io_async::Write).
pub type Port = FromTokio<SerialPort>;

/// Port-specific error type to be used as `E` for the generic error types.
pub type PortError = <Port as ErrorType>::Error;

/// Opens the serial port at the given path.
///
/// Returns a [`Port`] that can be passed to [`Interface::new`](crate::Interface::new).
pub fn open(path: impl AsRef<Path>) -> Result<Port, PortError> {
    let port = SerialPort::open(path, |mut settings: Settings| {
        settings.set_raw();

        Ok(settings)
    })?;

    // Drop stale data from a previous connection
    port.discard_buffers()?;

    Ok(FromTokio::new(port))
}

/// Connector opening a bound RFCOMM TTY device.
///
/// The binding determines the remote device, so the session address
/// is only used for logging.
/// The device is opened on a blocking thread, so a slow open is still
/// subject to [`Config::connect_timeout`](crate::session::Config::connect_timeout).
#[derive(Debug)]
pub struct Connector {
    path: PathBuf,
}

impl Connector {
    /// Constructs a connector for the TTY device at the given path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait(?Send)]
impl session::Connector for Connector {
    type Port = Port;

    async fn connect(&mut self, address: &str) -> Result<Port, PortError> {
        debug!("Opening {} for {address}", self.path.display());

        let path = self.path.clone();
        let port = task::spawn_blocking(move || open(path))
            .await
            .map_err(io::Error::other)??;

        info!("Opened {}", self.path.display());

        Ok(port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Connector as _;

    #[tokio::test]
    async fn error_missing_device() {
        let mut connector = Connector::new("/dev/rfcomm-missing");
        let res = connector.connect("90:F6:44:AA:EE:67").await;

        assert_eq!(
            res.map(|_| ()).map_err(|err| err.kind()),
            Err(io::ErrorKind::NotFound),
            "result should be not found error"
        );
    }
}
