//! Byte transport to the meter.
//!
//! [`Transport`] abstracts the physical link so the protocol engine in
//! [`crate::device`] runs the same way against the serial port and against
//! [`crate::mock::MockTransport`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace};

/// Asynchronous byte-level link to a meter.
#[async_trait]
pub trait Transport: Send {
    /// Write every byte of `data` to the link.
    async fn write_all(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever is available into `buf`, waiting at most `timeout`.
    ///
    /// Returns `Ok(0)` when nothing arrived before the deadline. That is not
    /// an error: the meter is simply quiet.
    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Close the link. Later reads and writes fail with [`Error::NotConnected`].
    async fn close(&mut self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

#[async_trait]
impl Transport for Box<dyn Transport> {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        (**self).write_all(data).await
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        (**self).read(buf, timeout).await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// Fill `buf` from the transport, stopping early when a read times out.
///
/// Returns how many bytes landed in `buf`; anything short of `buf.len()`
/// means the line went quiet part-way.
pub async fn read_full<T: Transport + ?Sized>(transport: &mut T, buf: &mut [u8], timeout: Duration) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = transport.read(&mut buf[filled..], timeout).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// USB serial link to a real meter (8N1, no flow control).
pub struct SerialTransport {
    port: Option<SerialStream>,
    port_name: String,
}

impl SerialTransport {
    pub async fn open(port: &str, baud_rate: u32) -> Result<Self> {
        debug!(port = %port, baud_rate, "Opening serial port");
        let stream = tokio_serial::new(port, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .stop_bits(tokio_serial::StopBits::One)
            .parity(tokio_serial::Parity::None)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                error!(port = %port, error = %e, "Failed to open serial port");
                Error::Transport(format!("failed to open serial port {port}: {e}"))
            })?;
        info!(port = %port, baud_rate, "Serial port opened");
        Ok(Self {
            port: Some(stream),
            port_name: port.to_string(),
        })
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }
}

fn map_io_error(e: std::io::Error) -> Error {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::NotConnected => Error::NotConnected,
        _ => Error::Io(e),
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        trace!(port = %self.port_name, bytes = hex::encode(data), "Serial write");
        port.write_all(data).await.map_err(map_io_error)?;
        port.flush().await.map_err(map_io_error)?;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port.as_mut().ok_or(Error::NotConnected)?;
        match tokio::time::timeout(timeout, port.read(buf)).await {
            Ok(Ok(n)) => {
                trace!(port = %self.port_name, bytes = hex::encode(&buf[..n]), "Serial read");
                Ok(n)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Ok(Err(e)) => {
                error!(port = %self.port_name, error = %e, "Serial read failed");
                Err(map_io_error(e))
            }
            Err(_) => Ok(0),
        }
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                debug!(port = %self.port_name, error = %e, "Flush before close failed");
            }
            info!(port = %self.port_name, "Serial port closed");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}
