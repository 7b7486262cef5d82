//! # Weather Station Node
//!
//! [`Station`] is the process-wide context object: it owns the messaging
//! session, the sensor sampler, the alert handler, the streaming flag and
//! the reset hook, and it is the single handler behind the scheduler's
//! dispatch loop. All mutable node state lives here and is only ever
//! touched from scheduler context; the button interrupt merely posts a
//! [`NodeEvent::Toggle`].
//!
//! The fault policy is deliberately fail-fast: the first keep-alive error
//! cancels both periodic tasks, stops the dispatch loop and restarts the
//! device. There is no in-process reconnect, because the handshake cannot
//! be re-entered halfway.

use embassy_time::Instant;
use embedded_hal::digital::OutputPin;
use log::{error, info, warn};

use crate::alert::AlertHandler;
use crate::config::StationConfig;
use crate::error::SessionError;
use crate::scheduler::{Dispatch, Scheduler, SchedulerError, TaskId};
use crate::sensor::{EnvironmentSensor, SensorSampler};
use crate::session::{ConnectionState, MessagingSession};
use crate::transport::{Transport, TransportError};

/// Transmit/receive buffer size of the station's messaging session.
pub const SESSION_BUF: usize = 512;

/// Everything the station's dispatch loop reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum NodeEvent {
    /// Service the session; fires every second.
    KeepAlive,
    /// Sample the sensor and publish; fires every five seconds.
    Sample,
    /// Deferred from the button interrupt.
    Toggle,
}

/// Whether telemetry publishing is active. Single-writer: only the
/// deferred toggle callback flips it.
#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StreamingState {
    pub enabled: bool,
}

/// Hook for the fault policy's full device restart.
///
/// Real implementations reset the SoC and never return; the dispatch loop
/// is already stopped when this is called, so a returning implementation
/// (a test double) just lets the firmware's main fall through.
pub trait DeviceReset {
    fn restart(&mut self);
}

/// Fatal startup failures; the process logs and aborts instead of
/// retrying.
#[derive(Debug)]
pub enum StartError<T> {
    /// The sensor did not initialize.
    Sensor,
    /// Protocol handshake or the first keep-alive failed.
    Session(SessionError<T>),
    /// Periodic task registration overflowed the scheduler.
    Scheduler(SchedulerError),
}

/// The station node: context object and scheduler event handler.
pub struct Station<T, S, P, R> {
    config: StationConfig,
    session: MessagingSession<T, SESSION_BUF>,
    sampler: SensorSampler<S>,
    alert: AlertHandler<P>,
    reset: R,
    streaming: StreamingState,
    keep_alive_task: Option<TaskId>,
    sample_task: Option<TaskId>,
    last_toggle: Option<Instant>,
}

impl<T, S, P, R> Station<T, S, P, R>
where
    T: Transport,
    T::Error: TransportError,
    S: EnvironmentSensor,
    P: OutputPin,
    R: DeviceReset,
{
    pub fn new(
        config: StationConfig,
        session: MessagingSession<T, SESSION_BUF>,
        sampler: SensorSampler<S>,
        alert: AlertHandler<P>,
        reset: R,
    ) -> Self {
        Self {
            config,
            session,
            sampler,
            alert,
            reset,
            streaming: StreamingState { enabled: true },
            keep_alive_task: None,
            sample_task: None,
            last_toggle: None,
        }
    }

    pub fn streaming_enabled(&self) -> bool {
        self.streaming.enabled
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.session.state()
    }

    /// Boots the node: sensor bring-up, protocol handshake, subscription,
    /// one immediate keep-alive, then registration of the periodic work.
    ///
    /// Sensor and handshake failures are fatal. A failed subscription is
    /// only logged: the node keeps publishing without inbound alerts.
    pub async fn start<const TASKS: usize, const POSTED: usize>(
        &mut self,
        scheduler: &mut Scheduler<NodeEvent, TASKS, POSTED>,
    ) -> Result<(), StartError<T::Error>> {
        if !self.sampler.initialize() {
            error!("sensor initialization failed");
            return Err(StartError::Sensor);
        }
        self.sampler.configure_power_mode();

        self.session.connect().await.map_err(StartError::Session)?;

        match self
            .session
            .subscribe(self.config.alert_topic, self.config.subscribe_qos)
            .await
        {
            Ok(()) => info!("subscribed to {}", self.config.alert_topic),
            Err(e) => warn!(
                "subscribe to {} failed ({:?}), continuing without alerts",
                self.config.alert_topic, e
            ),
        }

        self.session
            .keep_alive(self.config.keep_alive_timeout, &mut self.alert)
            .await
            .map_err(StartError::Session)?;

        // Keep-alive registers first: when its tick coincides with a
        // sample tick, the session is serviced before the publish.
        self.keep_alive_task = Some(
            scheduler
                .call_every(self.config.keep_alive_period, NodeEvent::KeepAlive)
                .map_err(StartError::Scheduler)?,
        );
        self.sample_task = Some(
            scheduler
                .call_every(self.config.sample_period, NodeEvent::Sample)
                .map_err(StartError::Scheduler)?,
        );
        Ok(())
    }

    async fn on_keep_alive<const TASKS: usize, const POSTED: usize>(
        &mut self,
        scheduler: &Scheduler<NodeEvent, TASKS, POSTED>,
    ) {
        if let Err(e) = self
            .session
            .keep_alive(self.config.keep_alive_timeout, &mut self.alert)
            .await
        {
            error!("keep-alive failed: {:?}", e);
            self.fault(scheduler);
        }
    }

    /// The fault policy: cancel all periodic work, stop the dispatch loop,
    /// restart the device. Runs entirely within the failing callback, so
    /// no further event can observe the broken session.
    fn fault<const TASKS: usize, const POSTED: usize>(
        &mut self,
        scheduler: &Scheduler<NodeEvent, TASKS, POSTED>,
    ) {
        if self.session.state() == ConnectionState::Faulted {
            return;
        }
        self.session.mark_faulted();
        if let Some(id) = self.keep_alive_task.take() {
            scheduler.cancel(id);
        }
        if let Some(id) = self.sample_task.take() {
            scheduler.cancel(id);
        }
        scheduler.stop();
        error!("session fault is terminal, restarting device");
        self.reset.restart();
    }

    async fn on_sample(&mut self) {
        if !self.streaming.enabled {
            return;
        }
        if self.session.state() != ConnectionState::Connected {
            return;
        }

        let reading = self.sampler.sample();
        let payload = match reading.to_json() {
            Ok(payload) => payload,
            Err(_) => {
                warn!("telemetry does not fit the buffer, sample dropped");
                return;
            }
        };

        info!("publishing {} to {}", payload.as_str(), self.config.publish_topic);
        if let Err(e) = self
            .session
            .publish(
                self.config.publish_topic,
                payload.as_bytes(),
                self.config.publish_qos,
            )
            .await
        {
            warn!("publish failed ({:?}), reading dropped", e);
        }
    }

    fn on_toggle(&mut self) {
        let now = Instant::now();
        if let Some(last) = self.last_toggle
            && now - last < self.config.debounce
        {
            // A bouncing edge, not a new press.
            return;
        }
        self.last_toggle = Some(now);
        self.streaming.enabled = !self.streaming.enabled;
        if self.streaming.enabled {
            info!("data streaming enabled");
        } else {
            info!("data streaming disabled");
        }
    }
}

impl<T, S, P, R, const TASKS: usize, const POSTED: usize> Dispatch<NodeEvent, TASKS, POSTED>
    for Station<T, S, P, R>
where
    T: Transport,
    T::Error: TransportError,
    S: EnvironmentSensor,
    P: OutputPin,
    R: DeviceReset,
{
    async fn dispatch(
        &mut self,
        event: NodeEvent,
        scheduler: &Scheduler<NodeEvent, TASKS, POSTED>,
    ) {
        match event {
            NodeEvent::KeepAlive => self.on_keep_alive(scheduler).await,
            NodeEvent::Sample => self.on_sample().await,
            NodeEvent::Toggle => self.on_toggle(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SessionOptions;
    use crate::test_util::{
        drive, poll_once, run_with_time, time_lock, CountingReset, FixedSensor, MockLink,
        SharedPin,
    };
    use crate::wire::{self, Encode, Packet, Publish, QoS};
    use embassy_time::{Duration, MockDriver};
    use core::pin::pin;
    use std::vec;
    use std::vec::Vec as StdVec;

    const PUBLISH_TOPIC: &str = "station/groups/meteo/json";
    const ALERT_TOPIC: &str = "station/feeds/meteo.alert";
    const STEP: Duration = Duration::from_millis(100);

    struct Fixture {
        link: MockLink,
        pin: SharedPin,
        reset: CountingReset,
        station: Station<MockLink, FixedSensor, SharedPin, CountingReset>,
    }

    /// Caller holds the time lock.
    fn fixture() -> Fixture {
        let link = MockLink::default();
        let pin = SharedPin::default();
        let reset = CountingReset::default();
        let session = MessagingSession::new(link.clone(), SessionOptions::new("station", "key"));
        let station = Station::new(
            StationConfig::new(PUBLISH_TOPIC, ALERT_TOPIC),
            session,
            SensorSampler::new(FixedSensor::new(23.456, 55.1, 101325.0)),
            AlertHandler::new(pin.clone()),
            reset.clone(),
        );
        Fixture {
            link,
            pin,
            reset,
            station,
        }
    }

    fn connack_ok() -> StdVec<u8> {
        vec![0x20, 0x02, 0x00, 0x00]
    }

    fn suback_ok(packet_id: u16) -> StdVec<u8> {
        let id = packet_id.to_be_bytes();
        vec![0x90, 0x03, id[0], id[1], 0x00]
    }

    fn alert_frame(payload: &[u8]) -> StdVec<u8> {
        let publish = Publish {
            topic: ALERT_TOPIC,
            qos: QoS::AtMostOnce,
            packet_id: None,
            payload,
        };
        let mut buf = [0u8; 128];
        let len = publish.encode(&mut buf).unwrap();
        buf[..len].to_vec()
    }

    /// Decoded payloads of every PUBLISH frame the station sent.
    fn published_payloads(link: &MockLink) -> StdVec<StdVec<u8>> {
        link.sent()
            .iter()
            .filter(|frame| frame[0] >> 4 == 3)
            .map(|frame| {
                let Some((Packet::Publish(publish), _)) = wire::decode(frame).unwrap() else {
                    panic!("unparseable publish frame");
                };
                assert_eq!(publish.topic, PUBLISH_TOPIC);
                publish.payload.to_vec()
            })
            .collect()
    }

    /// Caller holds the time lock. Boots the station against a broker that
    /// accepts the handshake and the subscription.
    fn start_station(fixture: &mut Fixture, scheduler: &mut Scheduler<NodeEvent, 4, 8>) {
        fixture.link.push_incoming(connack_ok());
        fixture.link.push_incoming(suback_ok(1));
        run_with_time(fixture.station.start(scheduler), Duration::from_millis(25), 16).unwrap();
    }

    #[test]
    fn start_connects_subscribes_and_registers_periodic_work() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        assert_eq!(fixture.station.connection_state(), ConnectionState::Connected);
        assert!(fixture.station.streaming_enabled());
        let sent = fixture.link.sent();
        assert_eq!(sent[0][0], 0x10);
        assert_eq!(sent[1][0], 0x82);
        assert!(fixture.station.keep_alive_task.is_some());
        assert!(fixture.station.sample_task.is_some());
    }

    #[test]
    fn start_fails_fatally_when_the_sensor_is_dead() {
        let _time = time_lock();
        let mut fixture = fixture();
        fixture.station.sampler = SensorSampler::new(FixedSensor::broken());
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        let err = run_with_time(
            fixture.station.start(&mut scheduler),
            Duration::from_millis(25),
            4,
        )
        .unwrap_err();
        assert!(matches!(err, StartError::Sensor));
        assert!(fixture.link.sent().is_empty());
    }

    #[test]
    fn a_failed_subscribe_degrades_instead_of_aborting() {
        let _time = time_lock();
        let mut fixture = fixture();
        fixture.link.push_incoming(connack_ok());
        fixture.link.push_incoming(vec![0x90, 0x03, 0x00, 0x01, 0x80]);
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        run_with_time(
            fixture.station.start(&mut scheduler),
            Duration::from_millis(25),
            16,
        )
        .unwrap();
        assert_eq!(fixture.station.connection_state(), ConnectionState::Connected);
    }

    #[test]
    fn sample_ticks_publish_the_formatted_reading() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            drive(&mut fut, STEP, 55); // 5.5 s of virtual time
        }

        let payloads = published_payloads(&fixture.link);
        assert_eq!(payloads.len(), 1);
        assert_eq!(
            payloads[0],
            b"{\"feeds\":{\"Temperature\":\"23.46\",\"Humidity\":\"55.10\",\"Pressure\":\"1013.25\"}}"
        );
    }

    #[test]
    fn no_publish_happens_while_streaming_is_disabled() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            assert!(poll_once(&mut fut).is_pending());
            assert!(scheduler.post(NodeEvent::Toggle));
            drive(&mut fut, STEP, 110); // two full sample periods and change
            assert!(published_payloads(&fixture.link).is_empty());

            // One more press re-enables streaming.
            assert!(scheduler.post(NodeEvent::Toggle));
            drive(&mut fut, STEP, 55);
        }

        assert!(fixture.station.streaming_enabled());
        assert!(!published_payloads(&fixture.link).is_empty());
    }

    #[test]
    fn toggling_twice_restores_the_initial_state() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            assert!(poll_once(&mut fut).is_pending());
            assert!(scheduler.post(NodeEvent::Toggle));
            drive(&mut fut, STEP, 5);
            assert!(scheduler.post(NodeEvent::Toggle));
            drive(&mut fut, STEP, 5);
        }
        assert!(fixture.station.streaming_enabled());
    }

    #[test]
    fn bouncing_edges_collapse_into_one_toggle() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            assert!(poll_once(&mut fut).is_pending());
            // Both edges of one bouncy press arrive back to back.
            assert!(scheduler.post(NodeEvent::Toggle));
            assert!(scheduler.post(NodeEvent::Toggle));
            assert!(poll_once(&mut fut).is_pending());
        }
        assert!(!fixture.station.streaming_enabled());
    }

    #[test]
    fn inbound_alert_drives_the_indicator() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            fixture.link.push_incoming(alert_frame(b":("));
            drive(&mut fut, STEP, 12);
            assert_eq!(fixture.pin.last(), Some(true));

            fixture.link.push_incoming(alert_frame(b":)"));
            drive(&mut fut, STEP, 12);
            assert_eq!(fixture.pin.last(), Some(false));
        }
    }

    #[test]
    fn a_keep_alive_failure_stops_everything_and_restarts_once() {
        let _time = time_lock();
        let mut fixture = fixture();
        let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
        start_station(&mut fixture, &mut scheduler);

        let frames_before;
        {
            let mut fut = pin!(scheduler.dispatch_forever(&mut fixture.station));
            assert!(poll_once(&mut fut).is_pending());
            fixture.link.fail_next_recv();

            // The loop must terminate on the first failing keep-alive tick.
            let mut finished = false;
            for _ in 0..15 {
                if poll_once(&mut fut).is_ready() {
                    finished = true;
                    break;
                }
                MockDriver::get().advance(STEP);
            }
            assert!(finished, "dispatch loop kept running after the fault");
            frames_before = fixture.link.sent().len();
        }

        assert_eq!(fixture.reset.count(), 1);
        assert_eq!(fixture.station.connection_state(), ConnectionState::Faulted);
        assert!(fixture.station.keep_alive_task.is_none());
        assert!(fixture.station.sample_task.is_none());

        // Nothing runs after the fault: more virtual time, no new frames.
        MockDriver::get().advance(Duration::from_secs(30));
        assert_eq!(fixture.link.sent().len(), frames_before);
        assert!(published_payloads(&fixture.link).is_empty());
        assert_eq!(fixture.reset.count(), 1);
    }
}
