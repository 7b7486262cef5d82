//! Shared test doubles and virtual-time helpers for the unit tests.

use core::future::Future;
use core::pin::Pin;
use core::task::{Context, Poll, Waker};

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::{Mutex, MutexGuard};
use std::vec::Vec;

use embassy_time::{Duration, MockDriver};

use crate::sensor::EnvironmentSensor;
use crate::station::DeviceReset;
use crate::transport::{Transport, TransportError};

/// The mock time driver is process-global; tests that advance it or
/// measure elapsed time serialize on this lock.
static TIME: Mutex<()> = Mutex::new(());

pub fn time_lock() -> MutexGuard<'static, ()> {
    TIME.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn poll_once<F: Future>(fut: &mut Pin<&mut F>) -> Poll<F::Output> {
    let mut cx = Context::from_waker(Waker::noop());
    fut.as_mut().poll(&mut cx)
}

/// Polls `fut` to completion, advancing virtual time by `step` between
/// polls. Panics when the budget runs out.
pub fn run_with_time<F: Future>(fut: F, step: Duration, max_steps: u32) -> F::Output {
    let mut fut = core::pin::pin!(fut);
    let mut steps = 0;
    loop {
        if let Poll::Ready(out) = poll_once(&mut fut) {
            return out;
        }
        assert!(steps < max_steps, "future did not finish in the time budget");
        MockDriver::get().advance(step);
        steps += 1;
    }
}

/// Advances virtual time by `steps * step`, polling `fut` around every
/// advance. For driving a dispatch loop that is not expected to finish.
pub fn drive<F: Future>(fut: &mut Pin<&mut F>, step: Duration, steps: u32) {
    for _ in 0..steps {
        let _ = poll_once(fut);
        MockDriver::get().advance(step);
    }
    let _ = poll_once(fut);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockLinkError;

impl TransportError for MockLinkError {}

#[derive(Default)]
struct LinkState {
    incoming: VecDeque<Result<Vec<u8>, MockLinkError>>,
    sent: Vec<Vec<u8>>,
}

/// Scripted transport double. Clones share the same state, so a test
/// keeps one handle for scripting and assertions while the session owns
/// another.
#[derive(Clone, Default)]
pub struct MockLink(Rc<RefCell<LinkState>>);

impl MockLink {
    pub fn push_incoming(&self, chunk: Vec<u8>) {
        self.0.borrow_mut().incoming.push_back(Ok(chunk));
    }

    pub fn fail_next_recv(&self) {
        self.0.borrow_mut().incoming.push_back(Err(MockLinkError));
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.0.borrow().sent.clone()
    }
}

impl Transport for MockLink {
    type Error = MockLinkError;

    async fn send(&mut self, buf: &[u8]) -> Result<(), MockLinkError> {
        self.0.borrow_mut().sent.push(buf.to_vec());
        Ok(())
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, MockLinkError> {
        let next = self.0.borrow_mut().incoming.pop_front();
        match next {
            Some(Ok(chunk)) => {
                buf[..chunk.len()].copy_from_slice(&chunk);
                Ok(chunk.len())
            }
            Some(Err(e)) => Err(e),
            // No scripted traffic: behave like an idle link.
            None => core::future::pending().await,
        }
    }
}

/// Sensor double reporting fixed raw values (pressure in Pascals).
pub struct FixedSensor {
    temperature: f32,
    humidity: f32,
    pressure_pa: f32,
    healthy: bool,
}

impl FixedSensor {
    pub fn new(temperature: f32, humidity: f32, pressure_pa: f32) -> Self {
        Self {
            temperature,
            humidity,
            pressure_pa,
            healthy: true,
        }
    }

    /// A sensor that fails to initialize.
    pub fn broken() -> Self {
        Self {
            temperature: 0.0,
            humidity: 0.0,
            pressure_pa: 0.0,
            healthy: false,
        }
    }
}

impl EnvironmentSensor for FixedSensor {
    fn initialize(&mut self) -> bool {
        self.healthy
    }

    fn configure_power_mode(&mut self) {}

    fn temperature(&mut self) -> f32 {
        self.temperature
    }

    fn humidity(&mut self) -> f32 {
        self.humidity
    }

    fn pressure(&mut self) -> f32 {
        self.pressure_pa
    }
}

/// Indicator double recording every level written to it.
#[derive(Clone, Default)]
pub struct SharedPin(Rc<RefCell<Vec<bool>>>);

impl SharedPin {
    pub fn states(&self) -> Vec<bool> {
        self.0.borrow().clone()
    }

    pub fn last(&self) -> Option<bool> {
        self.0.borrow().last().copied()
    }
}

impl embedded_hal::digital::ErrorType for SharedPin {
    type Error = core::convert::Infallible;
}

impl embedded_hal::digital::OutputPin for SharedPin {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().push(false);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().push(true);
        Ok(())
    }
}

/// Reset double that counts invocations instead of resetting anything.
#[derive(Clone, Default)]
pub struct CountingReset(Rc<Cell<usize>>);

impl CountingReset {
    pub fn count(&self) -> usize {
        self.0.get()
    }
}

impl DeviceReset for CountingReset {
    fn restart(&mut self) {
        self.0.set(self.0.get() + 1);
    }
}
