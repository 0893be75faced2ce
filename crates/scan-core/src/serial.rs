//! Serial port abstractions for driver crates.
//!
//! The motion crate frames the wire into lines itself (split reader task), so
//! this module only provides the type-erased port, the async opener and a
//! buffer drain. Any `AsyncRead + AsyncWrite` stream works as a port, which
//! is how tests substitute `tokio::io::DuplexStream` for real hardware.
//!
//! Opening a real port requires the `serial` feature:
//!
//! ```toml
//! [dependencies]
//! scan-core = { path = "../scan-core", features = ["serial"] }
//! ```

use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};

/// Trait alias for async serial port I/O.
///
/// Implemented by `tokio_serial::SerialStream` (real hardware),
/// `tokio::io::DuplexStream` (tests) and any mock with the async I/O traits.
pub trait SerialPortIO: AsyncRead + AsyncWrite + Unpin + Send {}

// Blanket implementation for all types meeting the requirements
impl<T: AsyncRead + AsyncWrite + Unpin + Send> SerialPortIO for T {}

/// Type-erased boxed serial port.
pub type DynSerial = Box<dyn SerialPortIO>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control. The open is wrapped
/// in `spawn_blocking` so slow device initialization cannot stall the
/// runtime.
///
/// # Errors
///
/// Returns an error if the port cannot be opened or spawn_blocking fails.
#[cfg(feature = "serial")]
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
    device_name: &str,
) -> anyhow::Result<tokio_serial::SerialStream> {
    use anyhow::Context;
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();
    let device_name_owned = device_name.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .context(format!(
                "Failed to open {} serial port: {}",
                device_name_owned, port_path_owned
            ))
    })
    .await
    .context("spawn_blocking for serial port opening failed")?
}

/// Drain stale data from a serial port buffer.
///
/// Reads and discards until no more data is immediately available or the
/// timeout elapses. Used before sending the firmware init sequence so boot
/// banners and stale auto-reports do not confuse command matching.
///
/// Returns the total number of bytes discarded.
pub async fn drain_serial_buffer<R: AsyncRead + Unpin>(port: &mut R, timeout_ms: u64) -> usize {
    let mut discard = [0u8; 256];
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    let mut total_discarded = 0usize;

    loop {
        if tokio::time::Instant::now() >= deadline {
            break;
        }

        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, port.read(&mut discard)).await {
            Ok(Ok(0)) => break, // EOF or no more data
            Ok(Ok(n)) => {
                total_discarded += n;
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Ok(Err(_)) => break, // Real I/O error, abort drain
            Err(_) => break,     // Timeout, no more immediate data
        }
    }

    total_discarded
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn drain_discards_stale_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);

        host.write_all(b"stale data 12345").await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let discarded = drain_serial_buffer(&mut device, 50).await;
        assert_eq!(discarded, 16);
    }

    #[tokio::test]
    async fn duplex_stream_is_a_valid_port() {
        let (mut host, device) = tokio::io::duplex(64);
        let mut port: DynSerial = Box::new(device);

        host.write_all(b"ok\n").await.unwrap();

        let mut buf = [0u8; 3];
        port.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok\n");
    }
}
