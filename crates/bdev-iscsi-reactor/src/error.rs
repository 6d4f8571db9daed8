use std::fmt;

pub type ReactorResult<T> = Result<T, ReactorError>;

/// Failure category for reactor operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReactorErrorKind {
    /// The caller is not running on any reactor.
    NoCurrentThread,
    /// The operation must run on a different reactor.
    WrongThread,
    /// The target reactor is no longer accepting messages.
    Disconnected,
}

/// Error surfaced by reactor primitives.
#[derive(Clone, Debug)]
pub struct ReactorError {
    kind: ReactorErrorKind,
    message: Option<String>,
}

impl ReactorError {
    pub const fn new(kind: ReactorErrorKind) -> Self {
        Self {
            kind,
            message: None,
        }
    }

    pub fn with_message(kind: ReactorErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: Some(message.into()),
        }
    }

    pub fn kind(&self) -> ReactorErrorKind {
        self.kind
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }
}

impl fmt::Display for ReactorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.message() {
            Some(msg) => write!(f, "{:?}: {}", self.kind, msg),
            None => write!(f, "{:?}", self.kind),
        }
    }
}

impl std::error::Error for ReactorError {}
