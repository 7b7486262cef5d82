//! # Inbound Alert Handling
//!
//! Decodes the alert feed's payload and drives the indicator LED. The
//! payload from the transport is a raw byte slice with an explicit length
//! and no terminator; it is copied into a bounded local buffer before any
//! comparison, and the transport buffer is never aliased past the handler
//! call.

use embedded_hal::digital::OutputPin;
use heapless::Vec;
use log::{info, warn};

use crate::session::MessageHandler;
use crate::wire::Publish;

/// Exact byte content that asserts the alert.
pub const ALERT_COMMAND: &[u8] = b":(";

/// Longest payload still considered a command; anything bigger can only be
/// noise and maps to the normal state.
pub const MAX_ALERT_LEN: usize = 32;

/// Subscription callback: sentinel match drives the indicator.
pub struct AlertHandler<P> {
    indicator: P,
}

impl<P: OutputPin> AlertHandler<P> {
    pub fn new(indicator: P) -> Self {
        Self { indicator }
    }

    fn set_indicator(&mut self, on: bool) {
        let result = if on {
            self.indicator.set_high()
        } else {
            self.indicator.set_low()
        };
        if result.is_err() {
            warn!("indicator pin write failed");
        }
    }
}

impl<P: OutputPin> MessageHandler for AlertHandler<P> {
    fn on_message(&mut self, msg: &Publish<'_>) {
        let mut command: Vec<u8, MAX_ALERT_LEN> = Vec::new();
        let alert = match command.extend_from_slice(msg.payload) {
            Ok(()) => command.as_slice() == ALERT_COMMAND,
            Err(_) => false,
        };

        if alert {
            info!("alert asserted on {}", msg.topic);
        } else {
            info!("alert cleared");
        }
        self.set_indicator(alert);
    }
}
