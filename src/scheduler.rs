//! # Cooperative Event Scheduler
//!
//! A single-queue, run-to-completion scheduler: periodic timer entries and
//! deferred one-shot events are dispatched serially on one logical thread
//! of execution, and a running callback is never preempted.
//!
//! Two kinds of work feed the queue:
//!
//! - **Periodic entries**, registered up front with [`Scheduler::call_every`].
//!   When several entries fall due at the same instant they run in
//!   registration order, so interleaving is deterministic.
//! - **Posted events**, enqueued with [`Scheduler::post`] from any context.
//!   This is the only operation that is safe from an interrupt handler:
//!   the handler enqueues the event and returns, and the mutation it
//!   implies happens later in scheduler context. Posted events drain FIFO,
//!   ahead of the timer queue.
//!
//! [`Scheduler::stop`] ends [`Scheduler::dispatch_forever`]; it is checked
//! after every callback, so it is meant to be called from within one (the
//! fault path does exactly that).
//!
//! ```ignore
//! let mut scheduler: Scheduler<NodeEvent, 4, 8> = Scheduler::new();
//! let keep_alive = scheduler.call_every(Duration::from_secs(1), NodeEvent::KeepAlive)?;
//! let scheduler = SCHEDULER.init(scheduler); // StaticCell, so the ISR can reach it
//! button.set_interrupt_handler(|| { scheduler.post(NodeEvent::Toggle); });
//! scheduler.dispatch_forever(&mut station).await;
//! ```

use core::sync::atomic::{AtomicBool, Ordering};

use embassy_futures::select::{select, Either};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::{Duration, Instant, Timer};
use heapless::Vec;

/// Handle to a periodic entry, used for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct TaskId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SchedulerError {
    /// All `TASKS` periodic slots are taken. Capacities are sized at build
    /// time, so this is a configuration error, not a runtime condition.
    QueueFull,
}

/// The handler seam: one callback for every event the scheduler dispatches.
///
/// Each invocation runs to completion before the next event is looked at.
/// The scheduler reference lets a callback cancel entries, post follow-up
/// events, or stop the dispatch loop.
#[allow(async_fn_in_trait)]
pub trait Dispatch<E, const TASKS: usize, const POSTED: usize> {
    async fn dispatch(&mut self, event: E, scheduler: &Scheduler<E, TASKS, POSTED>);
}

struct Periodic<E> {
    event: E,
    period: Duration,
    /// Cancellation tombstone; keeps `cancel` idempotent and callable
    /// while the dispatch loop borrows the entry table.
    cancelled: AtomicBool,
}

/// Cooperative event queue. `TASKS` bounds the periodic entries, `POSTED`
/// the backlog of deferred events.
pub struct Scheduler<E, const TASKS: usize, const POSTED: usize> {
    periodic: Vec<Periodic<E>, TASKS>,
    posted: Channel<CriticalSectionRawMutex, E, POSTED>,
    stopped: AtomicBool,
}

impl<E: Copy, const TASKS: usize, const POSTED: usize> Scheduler<E, TASKS, POSTED> {
    pub const fn new() -> Self {
        Self {
            periodic: Vec::new(),
            posted: Channel::new(),
            stopped: AtomicBool::new(false),
        }
    }

    /// Registers `event` to fire every `period`, starting one period after
    /// dispatch begins.
    ///
    /// Registration happens before [`Self::dispatch_forever`]; the returned
    /// id cancels the entry later.
    pub fn call_every(&mut self, period: Duration, event: E) -> Result<TaskId, SchedulerError> {
        let id = TaskId(self.periodic.len());
        self.periodic
            .push(Periodic {
                event,
                period,
                cancelled: AtomicBool::new(false),
            })
            .map_err(|_| SchedulerError::QueueFull)?;
        Ok(id)
    }

    /// Cancels a periodic entry. Idempotent: cancelling an unknown or
    /// already-cancelled id is a no-op.
    pub fn cancel(&self, id: TaskId) {
        if let Some(entry) = self.periodic.get(id.0) {
            entry.cancelled.store(true, Ordering::Relaxed);
        }
    }

    /// Enqueues a one-shot event for deferred dispatch.
    ///
    /// Safe from any context, including interrupt handlers: it never
    /// blocks. Returns `false` when the backlog is full and the event was
    /// dropped.
    pub fn post(&self, event: E) -> bool {
        self.posted.try_send(event).is_ok()
    }

    /// Makes `dispatch_forever` return after the currently running
    /// callback. Used by the fault path, i.e. from scheduler context.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Runs queued callbacks until [`Self::stop`] is issued.
    pub async fn dispatch_forever<H>(&self, handler: &mut H)
    where
        H: Dispatch<E, TASKS, POSTED>,
    {
        let mut deadlines: Vec<Instant, TASKS> = Vec::new();
        let now = Instant::now();
        for entry in self.periodic.iter() {
            // Capacity matches `periodic` by construction.
            let _ = deadlines.push(now + entry.period);
        }

        while !self.is_stopped() {
            while let Ok(event) = self.posted.try_receive() {
                handler.dispatch(event, self).await;
                if self.is_stopped() {
                    return;
                }
            }

            match self.next_deadline(&deadlines) {
                None => {
                    // Nothing periodic is armed; only posted events can
                    // wake us now.
                    let event = self.posted.receive().await;
                    handler.dispatch(event, self).await;
                }
                Some(at) => match select(self.posted.receive(), Timer::at(at)).await {
                    Either::First(event) => handler.dispatch(event, self).await,
                    Either::Second(()) => self.run_due(handler, &mut deadlines).await,
                },
            }
        }
    }

    /// Earliest deadline among live entries. A strict comparison keeps the
    /// first-registered entry in front on ties.
    fn next_deadline(&self, deadlines: &Vec<Instant, TASKS>) -> Option<Instant> {
        let mut next: Option<Instant> = None;
        for (idx, entry) in self.periodic.iter().enumerate() {
            if entry.cancelled.load(Ordering::Relaxed) {
                continue;
            }
            let at = deadlines[idx];
            if next.is_none_or(|current| at < current) {
                next = Some(at);
            }
        }
        next
    }

    async fn run_due<H>(&self, handler: &mut H, deadlines: &mut Vec<Instant, TASKS>)
    where
        H: Dispatch<E, TASKS, POSTED>,
    {
        let now = Instant::now();
        for (idx, entry) in self.periodic.iter().enumerate() {
            if entry.cancelled.load(Ordering::Relaxed) || deadlines[idx] > now {
                continue;
            }
            // Re-arm drift-free before running, skipping slots a slow
            // callback already burned.
            let mut next = deadlines[idx] + entry.period;
            while next <= now {
                next += entry.period;
            }
            deadlines[idx] = next;

            handler.dispatch(entry.event, self).await;
            if self.is_stopped() {
                return;
            }
        }
    }
}

impl<E: Copy, const TASKS: usize, const POSTED: usize> Default for Scheduler<E, TASKS, POSTED> {
    fn default() -> Self {
        Self::new()
    }
}
