use bdev_iscsi_proto::{ProtoError, ScsiStatus};
use bdev_iscsi_reactor::ReactorError;
use std::fmt;

use crate::session::SessionError;

pub type IscsiBdevResult<T> = Result<T, IscsiBdevError>;

/// Adapter error categories.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IscsiBdevErrorKind {
    InvalidArgument,
    OutOfMemory,
    NotFound,
    AlreadyExists,
    Unsupported,
    /// The session layer refused or failed an operation.
    Session,
    /// The target answered with a non-good SCSI status.
    Scsi,
    /// Response data from the target could not be decoded.
    Protocol,
    Framework,
    Reactor,
}

/// Errors surfaced by the adapter.
#[derive(Clone, Debug)]
pub struct IscsiBdevError {
    kind: IscsiBdevErrorKind,
    message: Option<String>,
    scsi_status: Option<ScsiStatus>,
}

impl IscsiBdevError {
    pub fn new(kind: IscsiBdevErrorKind) -> Self {
        Self {
            kind,
            message: None,
            scsi_status: None,
        }
    }

    pub fn with_message(kind: IscsiBdevErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
            scsi_status: None,
        }
    }

    pub fn scsi(status: ScsiStatus, message: impl Into<String>) -> Self {
        Self {
            kind: IscsiBdevErrorKind::Scsi,
            message: Some(message.into()),
            scsi_status: Some(status),
        }
    }

    pub fn kind(&self) -> IscsiBdevErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn scsi_status(&self) -> Option<ScsiStatus> {
        self.scsi_status
    }

    /// Numeric status handed to creation and deletion callbacks: the SCSI status byte for
    /// target-reported failures, a negative errno for everything else.
    pub fn status(&self) -> i32 {
        if let Some(status) = self.scsi_status {
            if !status.is_good() {
                return i32::from(status.code());
            }
        }
        -match self.kind {
            IscsiBdevErrorKind::InvalidArgument => libc::EINVAL,
            IscsiBdevErrorKind::OutOfMemory => libc::ENOMEM,
            IscsiBdevErrorKind::NotFound => libc::ENODEV,
            IscsiBdevErrorKind::AlreadyExists => libc::EEXIST,
            IscsiBdevErrorKind::Unsupported => libc::ENOTSUP,
            IscsiBdevErrorKind::Session
            | IscsiBdevErrorKind::Scsi
            | IscsiBdevErrorKind::Protocol
            | IscsiBdevErrorKind::Framework => libc::EIO,
            IscsiBdevErrorKind::Reactor => libc::ENXIO,
        }
    }
}

impl fmt::Display for IscsiBdevError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for IscsiBdevError {}

impl From<SessionError> for IscsiBdevError {
    fn from(err: SessionError) -> Self {
        IscsiBdevError::with_message(IscsiBdevErrorKind::Session, err.to_string())
    }
}

impl From<ReactorError> for IscsiBdevError {
    fn from(err: ReactorError) -> Self {
        IscsiBdevError::with_message(IscsiBdevErrorKind::Reactor, err.to_string())
    }
}

impl From<ProtoError> for IscsiBdevError {
    fn from(err: ProtoError) -> Self {
        IscsiBdevError::with_message(IscsiBdevErrorKind::Protocol, err.to_string())
    }
}
