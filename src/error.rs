use std::error::Error;
use std::fmt;

/// Tagged error kinds, per the error-handling design: callers branch on
/// `kind()`, not on a numeric errno, to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    Io,
    LockDenied,
    ReservationConflict,
    ProtocolMismatch,
}

#[derive(Debug)]
pub struct CoreError {
    kind: ErrorKind,
    msg: String,
}

impl CoreError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        CoreError {
            kind,
            msg: msg.into(),
        }
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, msg)
    }

    pub fn out_of_memory(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::OutOfMemory, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, msg)
    }

    pub fn lock_denied(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::LockDenied, msg)
    }

    pub fn reservation_conflict(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ReservationConflict, msg)
    }

    pub fn protocol_mismatch(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::ProtocolMismatch, msg)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.msg)
    }
}

impl Error for CoreError {}

pub type CoreResult<T> = Result<T, Box<dyn Error>>;
