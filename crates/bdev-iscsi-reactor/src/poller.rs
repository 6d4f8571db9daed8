use crate::thread::with_current;
use crate::{ReactorError, ReactorErrorKind, ReactorResult, ThreadHandle};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::trace;

/// Outcome of one poller invocation, used by the scheduler to decide whether to back off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing was ready.
    Idle,
    /// Work was done and more may be ready.
    Busy,
}

pub(crate) struct PollerSlot {
    id: u64,
    name: &'static str,
    interval: Duration,
    next_due: Cell<Instant>,
    active: Cell<bool>,
    func: RefCell<Box<dyn FnMut() -> PollStatus>>,
}

impl PollerSlot {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn deactivate(&self) {
        self.active.set(false);
    }

    pub(crate) fn run_if_due(&self, now: Instant) -> PollStatus {
        if !self.active.get() {
            return PollStatus::Idle;
        }
        if !self.interval.is_zero() && now < self.next_due.get() {
            return PollStatus::Idle;
        }
        self.next_due.set(now + self.interval);
        // A poller that drives its own reactor re-entrantly is skipped rather than aliased.
        let Ok(mut func) = self.func.try_borrow_mut() else {
            return PollStatus::Idle;
        };
        func()
    }
}

/// Registration of a poller on a specific reactor.
///
/// The handle is `Send` so it can live in shared bookkeeping, but [`PollerHandle::unregister`]
/// only succeeds on the reactor that owns the poller. Dropping the handle leaves the poller
/// running.
pub struct PollerHandle {
    thread: ThreadHandle,
    id: u64,
    name: &'static str,
}

impl PollerHandle {
    pub fn thread(&self) -> &ThreadHandle {
        &self.thread
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Stop the poller. Safe to call from inside the poller itself.
    pub fn unregister(self) -> ReactorResult<()> {
        if !self.thread.is_current() {
            return Err(ReactorError::with_message(
                ReactorErrorKind::WrongThread,
                format!(
                    "poller {} belongs to reactor {}",
                    self.name,
                    self.thread.name()
                ),
            ));
        }
        with_current(|inner| {
            inner.remove_poller(self.id);
        })
    }

    /// Stop the poller from any thread: directly when already on its reactor, otherwise by
    /// a message to it.
    pub fn release(self) -> ReactorResult<()> {
        if self.thread.is_current() {
            return self.unregister();
        }
        let thread = self.thread.clone();
        thread.send_msg(move || {
            let name = self.name;
            if let Err(err) = self.unregister() {
                tracing::warn!(poller = name, error = %err, "deferred poller unregister failed");
            }
        })
    }
}

impl fmt::Debug for PollerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollerHandle")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("thread", &self.thread)
            .finish()
    }
}

/// Register `f` on the current reactor, running every `interval` (every tick when zero).
pub fn register_poller<F>(
    name: &'static str,
    interval: Duration,
    f: F,
) -> ReactorResult<PollerHandle>
where
    F: FnMut() -> PollStatus + 'static,
{
    with_current(|inner| {
        let now = Instant::now();
        let id = inner.add_poller(|id| PollerSlot {
            id,
            name,
            interval,
            next_due: Cell::new(now + interval),
            active: Cell::new(true),
            func: RefCell::new(Box::new(f)),
        });
        trace!(
            reactor = %inner.handle().id(),
            poller = name,
            interval_us = interval.as_micros() as u64,
            "poller registered"
        );
        PollerHandle {
            thread: inner.handle().clone(),
            id,
            name,
        }
    })
}
