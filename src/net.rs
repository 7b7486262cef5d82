//! # Broker Connection
//!
//! Resolves the broker hostname through the network stack's DNS and opens
//! the TCP connection the messaging session runs over.
//!
//! Interface bring-up and DNS *server* registration (a private mesh
//! usually needs its own resolver) belong to the network stack's
//! configuration and happen before this module is called.

use embassy_net::dns::DnsQueryType;
use embassy_net::tcp::TcpSocket;
use embassy_net::Stack;
use embassy_time::Duration;
use log::{info, warn};

/// Where the broker lives.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BrokerEndpoint {
    pub host: &'static str,
    pub port: u16,
}

impl BrokerEndpoint {
    pub const fn new(host: &'static str, port: u16) -> Self {
        Self { host, port }
    }
}

/// Errors while reaching the broker. All of them are fatal at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NetError {
    /// The hostname did not resolve to any address.
    DnsFailed,
    /// The TCP connection could not be established.
    ConnectFailed,
}

/// Abort a connect attempt that makes no progress within this window.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves `endpoint` and returns a connected TCP socket using the given
/// buffers.
pub async fn connect_broker<'a>(
    stack: Stack<'a>,
    rx_buffer: &'a mut [u8],
    tx_buffer: &'a mut [u8],
    endpoint: BrokerEndpoint,
) -> Result<TcpSocket<'a>, NetError> {
    let addr = stack
        .dns_query(endpoint.host, DnsQueryType::A)
        .await
        .map_err(|e| {
            warn!("DNS query for {} failed: {:?}", endpoint.host, e);
            NetError::DnsFailed
        })?
        .first()
        .copied()
        .ok_or(NetError::DnsFailed)?;

    info!("resolved {} to {}", endpoint.host, addr);

    let mut socket = TcpSocket::new(stack, rx_buffer, tx_buffer);
    socket.set_timeout(Some(CONNECT_TIMEOUT));
    socket
        .connect((addr, endpoint.port))
        .await
        .map_err(|e| {
            warn!("connect to {}:{} failed: {:?}", addr, endpoint.port, e);
            NetError::ConnectFailed
        })?;
    // The session tracks liveness through its own keep-alive; an idle but
    // healthy connection must not be torn down underneath it.
    socket.set_timeout(None);

    info!("connected to {}:{}", endpoint.host, endpoint.port);
    Ok(socket)
}
