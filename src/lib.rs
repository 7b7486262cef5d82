//! # Event-Driven MQTT Weather Node
//!
//! `meteo-node` is a `no_std`, no-alloc firmware core for a battery-class
//! node that samples a temperature/humidity/pressure sensor and publishes
//! JSON telemetry to an MQTT broker, built on the
//! [Embassy](https://embassy.dev/) async ecosystem.
//!
//! ## Core Features
//!
//! - **Cooperative runtime:** one [`scheduler::Scheduler`] dispatches all
//!   work — periodic telemetry, protocol keep-alive, deferred
//!   button-toggle events — serially and run-to-completion on a single
//!   logical thread. Interrupt handlers only ever post; state mutation
//!   stays in scheduler context.
//! - **`no_std` & no-alloc:** buffers are `heapless` or fixed arrays;
//!   capacities are const generics chosen at build time.
//! - **Fail-fast sessions:** a broken keep-alive cancels all periodic
//!   work, stops the dispatch loop and restarts the device instead of
//!   limping through a half-dead connection.
//! - **Traits at every seam:** [`transport::Transport`],
//!   [`sensor::EnvironmentSensor`], `embedded-hal`'s `OutputPin` and
//!   [`station::DeviceReset`] keep the core testable on the host and
//!   portable across boards.
//!
//! ## Architecture
//!
//! A board crate wires its peripherals to the seams and hands everything
//! to the [`station::Station`] context object:
//!
//! ```ignore
//! let socket = net::connect_broker(stack, &mut rx, &mut tx, broker).await?;
//! let session = MessagingSession::new(TcpTransport::new(socket), options);
//! let mut station = Station::new(config, session, sampler, alert, reset);
//!
//! let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
//! station.start(&mut scheduler).await?;
//! let scheduler = SCHEDULER.init(scheduler);
//! button.on_falling_edge(|| { scheduler.post(NodeEvent::Toggle); });
//! scheduler.dispatch_forever(&mut station).await;
//! ```
//!
//! Everything below `station` is reusable on its own: the session speaks
//! MQTT 3.1.1 over any [`transport::Transport`], and the scheduler runs
//! any event type.

#![no_std]

#[cfg(test)]
extern crate std;

pub mod alert;
pub mod config;
pub mod error;
pub mod net;
pub mod scheduler;
pub mod sensor;
pub mod session;
pub mod station;
pub mod transport;
pub mod wire;

#[cfg(test)]
pub(crate) mod test_util;

// Re-export the key types for easier access at the crate root.
pub use alert::AlertHandler;
pub use config::{SessionOptions, StationConfig};
pub use error::{ConnectCode, SessionError, WireError};
pub use net::{connect_broker, BrokerEndpoint, NetError};
pub use scheduler::{Dispatch, Scheduler, SchedulerError, TaskId};
pub use sensor::{EnvironmentSensor, Reading, SensorSampler};
pub use session::{ConnectionState, MessageHandler, MessagingSession};
pub use station::{DeviceReset, NodeEvent, Station, StreamingState};
pub use transport::{TcpTransport, Transport};
pub use wire::QoS;
