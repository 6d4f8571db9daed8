//! Cooperative reactor threads.
//!
//! Each reactor is a single-threaded scheduler owning a set of periodic pollers and a
//! mailbox. Work never blocks: other threads hand work over with [`ThreadHandle::send_msg`]
//! and results travel back the same way. A reactor can be driven by a dedicated OS thread
//! ([`spawn_reactor`]) or manually with [`Reactor::run_once`].

mod error;
mod poller;
mod thread;
mod worker;

pub use error::{ReactorError, ReactorErrorKind, ReactorResult};
pub use poller::{PollStatus, PollerHandle, register_poller};
pub use thread::{Reactor, ThreadHandle, ThreadId, current};
pub use worker::{ReactorPool, ReactorThread, spawn_reactor};
