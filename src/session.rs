//! # Messaging Session
//!
//! Owns the publish/subscribe lifecycle over a [`Transport`]: connect and
//! handshake, a single subscription, telemetry publishes, and the periodic
//! keep-alive poll that services inbound traffic and protocol
//! housekeeping.
//!
//! The session never retries and never reconnects: a broken keep-alive is
//! reported to the caller, whose fault policy restarts the device. That
//! keeps [`ConnectionState::Faulted`] terminal and the state machine free
//! of partial-reconnect paths.

use core::pin::pin;

use embassy_time::{Duration, Instant, Timer};
use futures::future::{select, Either};
use heapless::Vec;
use log::{debug, info, warn};

use crate::config::SessionOptions;
use crate::error::{ConnectCode, SessionError, WireError};
use crate::transport::{Transport, TransportError};
use crate::wire::{self, Encode, Packet, PingReq, PubAck, Publish, QoS, Subscribe};

/// Lifecycle of the session. `Faulted` is terminal for this process
/// instance; the only way out is a device restart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Faulted,
}

/// Receiver for inbound messages on the subscribed topic.
///
/// Called synchronously from within [`MessagingSession::keep_alive`]; the
/// message borrows the session's receive buffer and is only valid for the
/// duration of the call.
pub trait MessageHandler {
    fn on_message(&mut self, msg: &Publish<'_>);
}

/// What one service pass pulled out of the receive buffer.
#[derive(Default)]
struct Drained {
    connack: Option<wire::ConnAck>,
    suback: Option<wire::SubAck>,
    pingresp: bool,
    /// QoS 1 inbound publishes that still need a `PUBACK` reply.
    ack_due: Vec<u16, 4>,
}

/// MQTT session over a generic transport. `BUF` sizes both the transmit
/// and receive buffers and bounds the largest packet in either direction.
pub struct MessagingSession<T, const BUF: usize> {
    transport: T,
    options: SessionOptions,
    state: ConnectionState,
    tx_buf: [u8; BUF],
    rx_buf: [u8; BUF],
    rx_filled: usize,
    next_packet_id: u16,
    /// Packet id of a QoS 1 publish still waiting for its `PUBACK`.
    pending_ack: Option<u16>,
    last_send: Instant,
    ping_sent: Option<Instant>,
}

impl<T, const BUF: usize> MessagingSession<T, BUF>
where
    T: Transport,
    T::Error: TransportError,
{
    pub fn new(transport: T, options: SessionOptions) -> Self {
        Self {
            transport,
            options,
            state: ConnectionState::Disconnected,
            tx_buf: [0; BUF],
            rx_buf: [0; BUF],
            rx_filled: 0,
            next_packet_id: 1,
            pending_ack: None,
            last_send: Instant::now(),
            ping_sent: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Marks the session terminally broken. Called by the fault policy;
    /// no operation succeeds afterwards.
    pub fn mark_faulted(&mut self) {
        self.state = ConnectionState::Faulted;
    }

    /// Performs the protocol handshake. The transport must already be
    /// connected at the stream level.
    pub async fn connect(&mut self) -> Result<(), SessionError<T::Error>> {
        if self.state != ConnectionState::Disconnected {
            return Err(SessionError::NotConnected);
        }
        self.state = ConnectionState::Connecting;
        let result = self.handshake().await;
        if result.is_err() {
            self.state = ConnectionState::Disconnected;
        }
        result
    }

    async fn handshake(&mut self) -> Result<(), SessionError<T::Error>> {
        let connect = wire::Connect {
            client_id: self.options.client_id.unwrap_or(""),
            username: Some(self.options.username),
            password: Some(self.options.password),
            keep_alive: self.options.keep_alive.as_secs() as u16,
            clean_session: true,
        };
        let len = connect.encode(&mut self.tx_buf).map_err(SessionError::Wire)?;
        self.send(len).await?;

        let deadline = Instant::now() + self.options.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout);
            }
            let drained = self.service(deadline - now, None).await?;
            if let Some(ack) = drained.connack {
                if ack.code != 0 {
                    return Err(SessionError::Refused(ConnectCode::from(ack.code)));
                }
                self.state = ConnectionState::Connected;
                info!("session established");
                return Ok(());
            }
        }
    }

    /// Subscribes to a single topic. Failure leaves the session usable;
    /// the node just runs without inbound messages.
    pub async fn subscribe(
        &mut self,
        topic: &str,
        qos: QoS,
    ) -> Result<(), SessionError<T::Error>> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let packet_id = self.take_packet_id();
        let subscribe = Subscribe {
            packet_id,
            topic,
            qos,
        };
        let len = subscribe
            .encode(&mut self.tx_buf)
            .map_err(SessionError::Wire)?;
        self.send(len).await?;

        let deadline = Instant::now() + self.options.response_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                return Err(SessionError::Timeout);
            }
            let drained = self.service(deadline - now, None).await?;
            if let Some(ack) = drained.suback
                && ack.packet_id == packet_id
            {
                if ack.codes.iter().any(|&code| code == 0x80) {
                    return Err(SessionError::SubscribeRejected);
                }
                return Ok(());
            }
        }
    }

    /// Sends one message. QoS 1 publishes are fire-and-forget: the
    /// `PUBACK` is consumed by a later [`Self::keep_alive`] pass, and a
    /// publish that was never acknowledged is logged when its id is
    /// displaced.
    pub async fn publish(
        &mut self,
        topic: &str,
        payload: &[u8],
        qos: QoS,
    ) -> Result<(), SessionError<T::Error>> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            _ => Some(self.take_packet_id()),
        };
        let publish = Publish {
            topic,
            qos,
            packet_id,
            payload,
        };
        let len = publish.encode(&mut self.tx_buf).map_err(SessionError::Wire)?;
        self.send(len).await?;

        if let Some(id) = packet_id
            && let Some(displaced) = self.pending_ack.replace(id)
        {
            warn!("publish {} was never acknowledged", displaced);
        }
        Ok(())
    }

    /// Services the session: polls the transport for inbound traffic for
    /// up to `timeout`, delivers subscribed messages to `handler`, and
    /// keeps the broker's liveness contract.
    ///
    /// Any error is unrecoverable by design; the caller's fault policy
    /// takes over.
    pub async fn keep_alive(
        &mut self,
        timeout: Duration,
        handler: &mut dyn MessageHandler,
    ) -> Result<(), SessionError<T::Error>> {
        if self.state != ConnectionState::Connected {
            return Err(SessionError::NotConnected);
        }

        let drained = self.service(timeout, Some(handler)).await?;
        if drained.pingresp {
            debug!("pong from broker");
            self.ping_sent = None;
        }

        if let Some(sent) = self.ping_sent
            && sent.elapsed() >= self.options.keep_alive
        {
            warn!("no pong within the keep-alive interval");
            return Err(SessionError::Timeout);
        }

        let half_interval =
            Duration::from_ticks(self.options.keep_alive.as_ticks() / 2);
        if self.ping_sent.is_none() && self.last_send.elapsed() >= half_interval {
            let len = PingReq.encode(&mut self.tx_buf).map_err(SessionError::Wire)?;
            self.send(len).await?;
            self.ping_sent = Some(Instant::now());
            debug!("ping sent");
        }

        Ok(())
    }

    /// One receive pass: race the transport against `wait`, then decode
    /// and handle every complete packet in the buffer.
    async fn service(
        &mut self,
        wait: Duration,
        handler: Option<&mut dyn MessageHandler>,
    ) -> Result<Drained, SessionError<T::Error>> {
        if self.rx_filled == BUF {
            // A frame bigger than the whole buffer can never complete.
            return Err(SessionError::Wire(WireError::BufferTooSmall));
        }

        let received = {
            let recv = self.transport.recv(&mut self.rx_buf[self.rx_filled..]);
            let timeout = Timer::after(wait);
            match select(pin!(recv), pin!(timeout)).await {
                Either::Left((Ok(n), _)) => Some(n),
                Either::Left((Err(e), _)) => return Err(SessionError::Transport(e)),
                // No traffic inside the window is the normal idle case.
                Either::Right(_) => None,
            }
        };
        if let Some(n) = received {
            self.rx_filled += n;
        }

        let drained = self.drain(handler).map_err(SessionError::Wire)?;
        for idx in 0..drained.ack_due.len() {
            let ack = PubAck {
                packet_id: drained.ack_due[idx],
            };
            let len = ack.encode(&mut self.tx_buf).map_err(SessionError::Wire)?;
            self.send(len).await?;
        }
        Ok(drained)
    }

    /// Decodes every complete packet currently buffered and compacts the
    /// leftover partial frame to the front.
    fn drain(&mut self, mut handler: Option<&mut dyn MessageHandler>) -> Result<Drained, WireError> {
        let mut out = Drained::default();
        let mut offset = 0;

        while let Some((packet, used)) = wire::decode(&self.rx_buf[offset..self.rx_filled])? {
            match packet {
                Packet::Publish(msg) => {
                    debug!("inbound publish on {} ({} bytes)", msg.topic, msg.payload.len());
                    if msg.qos == QoS::AtLeastOnce
                        && let Some(id) = msg.packet_id
                    {
                        let _ = out.ack_due.push(id);
                    }
                    match handler.as_deref_mut() {
                        Some(h) => h.on_message(&msg),
                        None => debug!("no handler registered, message dropped"),
                    }
                }
                Packet::PubAck(ack) => {
                    if self.pending_ack == Some(ack.packet_id) {
                        self.pending_ack = None;
                    } else {
                        debug!("stray puback for {}", ack.packet_id);
                    }
                }
                Packet::ConnAck(ack) => out.connack = Some(ack),
                Packet::SubAck(ack) => out.suback = Some(ack),
                Packet::PingResp => out.pingresp = true,
            }
            offset += used;
        }

        if offset > 0 {
            self.rx_buf.copy_within(offset..self.rx_filled, 0);
            self.rx_filled -= offset;
        }
        Ok(out)
    }

    async fn send(&mut self, len: usize) -> Result<(), SessionError<T::Error>> {
        self.transport.send(&self.tx_buf[..len]).await?;
        self.last_send = Instant::now();
        Ok(())
    }

    fn take_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.wrapping_add(1);
        if self.next_packet_id == 0 {
            self.next_packet_id = 1;
        }
        id
    }
}
