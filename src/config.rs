//! # Node Configuration
//!
//! All tunables live in two plain structs of `'static` data, so a firmware
//! image can keep its configuration in a `const` and hand copies to the
//! components at boot.

use embassy_time::Duration;

use crate::wire::QoS;

/// Identity and protocol parameters of the messaging session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    /// Client identifier sent in the connect handshake. `None` sends an
    /// empty id with a clean session, which the protocol permits; brokers
    /// that insist on unique ids get one here.
    pub client_id: Option<&'static str>,
    pub username: &'static str,
    pub password: &'static str,
    /// Keep-alive interval negotiated with the broker. The session pings
    /// at half this interval and treats a full interval without a pong as
    /// a dead session.
    pub keep_alive: Duration,
    /// How long to wait for the broker's answer to a handshake or
    /// subscribe request.
    pub response_timeout: Duration,
}

impl SessionOptions {
    pub const fn new(username: &'static str, password: &'static str) -> Self {
        Self {
            client_id: None,
            username,
            password,
            keep_alive: Duration::from_secs(25),
            response_timeout: Duration::from_secs(5),
        }
    }
}

/// Station-level behavior: topics, delivery tiers and cadences.
#[derive(Debug, Clone, Copy)]
pub struct StationConfig {
    /// Telemetry goes out here.
    pub publish_topic: &'static str,
    /// Inbound alert commands arrive here.
    pub alert_topic: &'static str,
    pub publish_qos: QoS,
    pub subscribe_qos: QoS,
    /// Cadence of the sample-and-publish tick.
    pub sample_period: Duration,
    /// Cadence of the keep-alive tick; must stay well below the session's
    /// keep-alive interval or the broker declares the node dead.
    pub keep_alive_period: Duration,
    /// Upper bound on how long one keep-alive tick waits for inbound
    /// traffic. This is the single blocking point of the dispatch loop.
    pub keep_alive_timeout: Duration,
    /// Button edges closer together than this collapse into one toggle.
    /// Zero disables debouncing.
    pub debounce: Duration,
}

impl StationConfig {
    pub const fn new(publish_topic: &'static str, alert_topic: &'static str) -> Self {
        Self {
            publish_topic,
            alert_topic,
            publish_qos: QoS::AtLeastOnce,
            subscribe_qos: QoS::AtMostOnce,
            sample_period: Duration::from_secs(5),
            keep_alive_period: Duration::from_secs(1),
            keep_alive_timeout: Duration::from_millis(100),
            debounce: Duration::from_millis(200),
        }
    }
}
