//! # Transport Abstraction
//!
//! The [`Transport`] trait abstracts the byte stream the messaging session
//! runs over, keeping the session hardware and network-stack agnostic. Any
//! reliable, ordered channel works: TCP, UART, a test double.
//!
//! Read timeouts are not a transport concern here; the session races
//! `recv` against its keep-alive window itself, so `recv` simply waits
//! until data arrives or the link dies.

use embassy_net::tcp::{Error as TcpError, TcpSocket};
use embedded_io_async::Write;

/// Marker trait for transport error types.
pub trait TransportError: core::fmt::Debug {}

impl TransportError for TcpError {}

/// A reliable, ordered byte-stream transport.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// The error type returned by the transport.
    type Error: TransportError;

    /// Sends the whole buffer.
    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error>;

    /// Receives at least one byte into `buf`, waiting as long as it takes.
    ///
    /// Returns the number of bytes read; a closed connection is an error,
    /// never a 0-length read.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error>;
}

/// TCP transport over `embassy-net`.
pub struct TcpTransport<'a> {
    socket: TcpSocket<'a>,
}

impl<'a> TcpTransport<'a> {
    /// Wraps an already-connected socket (see [`crate::net::connect_broker`]).
    pub fn new(socket: TcpSocket<'a>) -> Self {
        Self { socket }
    }
}

impl<'a> Transport for TcpTransport<'a> {
    type Error = TcpError;

    async fn send(&mut self, buf: &[u8]) -> Result<(), Self::Error> {
        #[cfg(feature = "esp32-log")]
        esp_println::println!("TCP TX ({} bytes): {:02X?}", buf.len(), buf);

        self.socket.write_all(buf).await?;
        // Flush so the broker sees the packet now, not at the next segment.
        self.socket.flush().await
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, Self::Error> {
        let n = self.socket.read(buf).await?;

        #[cfg(feature = "esp32-log")]
        esp_println::println!("TCP RX: {} bytes", n);

        if n == 0 {
            // The peer closed the connection.
            return Err(TcpError::ConnectionReset);
        }
        Ok(n)
    }
}
