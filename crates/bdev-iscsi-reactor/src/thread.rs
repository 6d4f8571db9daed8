use crate::poller::PollerSlot;
use crate::{PollStatus, ReactorError, ReactorErrorKind, ReactorResult};
use async_channel::{Receiver, Sender, TrySendError};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::trace;

type Message = Box<dyn FnOnce() + Send + 'static>;

static NEXT_THREAD_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Rc<ReactorInner>>> = const { RefCell::new(None) };
}

/// Process-unique reactor identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(u64);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reactor#{}", self.0)
    }
}

/// Cloneable, `Send` reference to a reactor used to hand work over to it.
#[derive(Clone)]
pub struct ThreadHandle {
    id: ThreadId,
    name: Arc<str>,
    tx: Sender<Message>,
}

impl ThreadHandle {
    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True when the caller is currently running on this reactor.
    pub fn is_current(&self) -> bool {
        current_id() == Some(self.id)
    }

    /// Queue `f` to run on this reactor. Never blocks and never waits for `f` to run.
    pub fn send_msg<F>(&self, f: F) -> ReactorResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.tx.try_send(Box::new(f)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Closed(_)) | Err(TrySendError::Full(_)) => {
                Err(ReactorError::with_message(
                    ReactorErrorKind::Disconnected,
                    format!("reactor {} is not accepting messages", self.name),
                ))
            }
        }
    }
}

impl PartialEq for ThreadHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ThreadHandle {}

impl fmt::Debug for ThreadHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadHandle")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// A single-threaded scheduler: a mailbox plus a set of pollers.
///
/// `Reactor` is deliberately `!Send`; pollers registered on it capture non-`Send` state and
/// only ever run on the OS thread that drives it.
pub struct Reactor {
    inner: Rc<ReactorInner>,
}

pub(crate) struct ReactorInner {
    handle: ThreadHandle,
    rx: Receiver<Message>,
    pollers: RefCell<Vec<Rc<PollerSlot>>>,
    next_poller_id: Cell<u64>,
}

impl Reactor {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = async_channel::unbounded();
        let id = ThreadId(NEXT_THREAD_ID.fetch_add(1, Ordering::Relaxed));
        let name: String = name.into();
        Self {
            inner: Rc::new(ReactorInner {
                handle: ThreadHandle {
                    id,
                    name: name.into(),
                    tx,
                },
                rx,
                pollers: RefCell::new(Vec::new()),
                next_poller_id: Cell::new(1),
            }),
        }
    }

    pub fn handle(&self) -> ThreadHandle {
        self.inner.handle.clone()
    }

    /// Run `f` with this reactor installed as the current thread.
    pub fn enter<R>(&self, f: impl FnOnce() -> R) -> R {
        let _guard = EnterGuard::install(self.inner.clone());
        f()
    }

    /// Deliver the messages queued before this call, then run every due poller once.
    ///
    /// Messages sent while the tick is running are left for the next tick so a message that
    /// re-queues itself cannot starve the pollers.
    pub fn run_once(&self) -> PollStatus {
        self.enter(|| self.inner.tick())
    }

    pub fn poller_count(&self) -> usize {
        self.inner.pollers.borrow().len()
    }

    pub fn pending_messages(&self) -> usize {
        self.inner.rx.len()
    }
}

impl fmt::Debug for Reactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactor")
            .field("handle", &self.inner.handle)
            .field("pollers", &self.poller_count())
            .finish()
    }
}

impl ReactorInner {
    fn tick(&self) -> PollStatus {
        let mut status = PollStatus::Idle;
        let queued = self.rx.len();
        for _ in 0..queued {
            let Ok(msg) = self.rx.try_recv() else {
                break;
            };
            msg();
            status = PollStatus::Busy;
        }

        let now = Instant::now();
        let pollers: Vec<Rc<PollerSlot>> = self.pollers.borrow().clone();
        for poller in pollers {
            if poller.run_if_due(now) == PollStatus::Busy {
                status = PollStatus::Busy;
            }
        }
        status
    }

    pub(crate) fn handle(&self) -> &ThreadHandle {
        &self.handle
    }

    pub(crate) fn add_poller(&self, build: impl FnOnce(u64) -> PollerSlot) -> u64 {
        let id = self.next_poller_id.get();
        self.next_poller_id.set(id + 1);
        self.pollers.borrow_mut().push(Rc::new(build(id)));
        id
    }

    pub(crate) fn remove_poller(&self, id: u64) -> bool {
        let mut pollers = self.pollers.borrow_mut();
        let Some(idx) = pollers.iter().position(|slot| slot.id() == id) else {
            return false;
        };
        let slot = pollers.remove(idx);
        slot.deactivate();
        trace!(reactor = %self.handle.id, poller = slot.name(), "poller unregistered");
        true
    }
}

struct EnterGuard {
    previous: Option<Rc<ReactorInner>>,
}

impl EnterGuard {
    fn install(inner: Rc<ReactorInner>) -> Self {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(inner));
        Self { previous }
    }
}

impl Drop for EnterGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT.with(|current| *current.borrow_mut() = previous);
    }
}

/// Handle of the reactor the caller is running on, if any.
pub fn current() -> Option<ThreadHandle> {
    CURRENT.with(|current| current.borrow().as_ref().map(|inner| inner.handle.clone()))
}

fn current_id() -> Option<ThreadId> {
    CURRENT.with(|current| current.borrow().as_ref().map(|inner| inner.handle.id))
}

pub(crate) fn with_current<R>(f: impl FnOnce(&ReactorInner) -> R) -> ReactorResult<R> {
    let inner = CURRENT
        .with(|current| current.borrow().clone())
        .ok_or_else(|| ReactorError::new(ReactorErrorKind::NoCurrentThread))?;
    Ok(f(&inner))
}
