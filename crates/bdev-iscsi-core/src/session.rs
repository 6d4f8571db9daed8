//! Interface to the network session layer.
//!
//! A session is one initiator context talking to one target. It is single-threaded: every
//! call happens on whichever reactor currently drives it. Unlike callback-based initiator
//! libraries, [`IscsiSession::service`] hands finished tasks back to the caller so that
//! completion handling never runs inside the event pump of the session it concerns.

use bdev_iscsi_proto::{ScsiStatus, Sense, UnmapDescriptor};
use bitflags::bitflags;
use std::fmt;
use std::os::fd::RawFd;

use crate::IscsiBdevResult;

bitflags! {
    /// `poll(2)` readiness bits.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PollEvents: i16 {
        const IN = libc::POLLIN;
        const PRI = libc::POLLPRI;
        const OUT = libc::POLLOUT;
        const ERR = libc::POLLERR;
        const HUP = libc::POLLHUP;
        const NVAL = libc::POLLNVAL;
    }
}

/// Caller-chosen identifier that comes back with the task's completion.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskTag(pub u64);

impl fmt::Display for TaskTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionType {
    Discovery,
    Normal,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HeaderDigest {
    None,
    Crc32c,
    NoneCrc32c,
    Crc32cNone,
}

/// Data returned with a completed task.
#[derive(Debug, Default)]
pub enum TaskPayload {
    #[default]
    None,
    /// Parameter data from INQUIRY or READ CAPACITY.
    DataIn(Vec<u8>),
    /// Caller buffers of a READ or WRITE, handed back once the target is done with them.
    Buffers(Vec<Vec<u8>>),
    /// Raw task management function response.
    TmfResponse(u32),
}

/// A finished task as reported by [`IscsiSession::service`].
#[derive(Debug)]
pub struct TaskCompletion {
    pub tag: TaskTag,
    pub status: ScsiStatus,
    pub sense: Sense,
    pub payload: TaskPayload,
}

impl TaskCompletion {
    pub fn good(tag: TaskTag, payload: TaskPayload) -> Self {
        Self {
            tag,
            status: ScsiStatus::GOOD,
            sense: Sense::NONE,
            payload,
        }
    }

    pub fn check_condition(tag: TaskTag, sense: Sense) -> Self {
        Self {
            tag,
            status: ScsiStatus::CHECK_CONDITION,
            sense,
            payload: TaskPayload::None,
        }
    }

    pub fn is_good(&self) -> bool {
        self.status.is_good()
    }

    /// CHECK CONDITION carrying UNIT ATTENTION / CAPACITY DATA HAS CHANGED.
    pub fn is_capacity_changed(&self) -> bool {
        self.status == ScsiStatus::CHECK_CONDITION && self.sense.is_capacity_data_changed()
    }
}

/// A READ(16) or WRITE(16) data transfer.
#[derive(Debug)]
pub struct DataTransfer {
    pub lun: u32,
    pub lba: u64,
    /// Transfer length in bytes.
    pub len: u32,
    pub block_len: u32,
    pub buffers: Vec<Vec<u8>>,
}

/// A transfer the session refused to queue; the buffers go back to the caller.
#[derive(Debug)]
pub struct RejectedTransfer {
    pub error: SessionError,
    pub buffers: Vec<Vec<u8>>,
}

/// Session error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionErrorKind {
    InvalidArgument,
    NotConnected,
    OutOfMemory,
    Io,
    Protocol,
}

#[derive(Clone, Debug)]
pub struct SessionError {
    kind: SessionErrorKind,
    message: Option<String>,
}

impl SessionError {
    pub fn new(kind: SessionErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> SessionErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for SessionError {}

pub type SessionResult<T> = Result<T, SessionError>;

/// One initiator session. Dropping it destroys the context, disconnecting if connected.
pub trait IscsiSession: Send {
    fn set_session_type(&mut self, session_type: SessionType) -> SessionResult<()>;
    fn set_header_digest(&mut self, digest: HeaderDigest) -> SessionResult<()>;
    fn set_targetname(&mut self, target: &str) -> SessionResult<()>;
    fn set_initiator_username_pwd(&mut self, user: &str, password: &str) -> SessionResult<()>;

    /// Start login to `portal` and report it as a task completion for `tag`.
    fn full_connect_async(&mut self, portal: &str, lun: u32, tag: TaskTag) -> SessionResult<()>;

    fn inquiry(
        &mut self,
        lun: u32,
        evpd: bool,
        page_code: u8,
        alloc_len: u16,
        tag: TaskTag,
    ) -> SessionResult<()>;
    fn readcapacity16(&mut self, lun: u32, tag: TaskTag) -> SessionResult<()>;
    fn read16(&mut self, transfer: DataTransfer, tag: TaskTag) -> Result<(), RejectedTransfer>;
    fn write16(&mut self, transfer: DataTransfer, tag: TaskTag) -> Result<(), RejectedTransfer>;
    fn synchronizecache16(
        &mut self,
        lun: u32,
        lba: u64,
        num_blocks: u32,
        tag: TaskTag,
    ) -> SessionResult<()>;
    fn unmap(&mut self, lun: u32, descriptors: &[UnmapDescriptor], tag: TaskTag)
    -> SessionResult<()>;
    fn task_mgmt_lun_reset(&mut self, lun: u32, tag: TaskTag) -> SessionResult<()>;

    fn fd(&self) -> RawFd;
    fn which_events(&self) -> PollEvents;

    /// Non-blocking readiness check of the session socket.
    fn poll_events(&self) -> SessionResult<PollEvents> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: self.which_events().bits(),
            revents: 0,
        };
        // SAFETY: `pfd` is a valid, exclusively borrowed pollfd and the count is 1.
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            return Err(SessionError::with_message(
                SessionErrorKind::Io,
                format!("poll: {err}"),
            ));
        }
        Ok(PollEvents::from_bits_truncate(pfd.revents))
    }

    /// Run one step of the protocol engine for `revents`, appending finished tasks.
    fn service(
        &mut self,
        revents: PollEvents,
        completions: &mut Vec<TaskCompletion>,
    ) -> SessionResult<()>;

    fn last_error(&self) -> String;
}

/// Creates session contexts for new devices.
pub trait SessionFactory: Send + Sync {
    fn create_context(&self, initiator_iqn: &str) -> IscsiBdevResult<Box<dyn IscsiSession>>;
}
