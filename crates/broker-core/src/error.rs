use std::fmt;
use std::io;

/// Top-level result alias used throughout the broker.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Mirrors the non-fatal/fatal split used across this codebase's networking layer: a
/// `Wait` means the caller should try again later (typically `WouldBlock`), anything
/// else is `Fatal` and carries a specific reason.
#[derive(Debug)]
pub enum BrokerError {
    Wait,
    Fatal(ErrorKind),
}

/// The broker's error taxonomy. Distinguishes the handful of shapes that carry
/// different propagation rules: frame/message-scoped errors are logged and swallowed,
/// connection-scoped errors tear down the connection, and `Io` wraps anything the OS
/// handed back that doesn't fit a named case.
#[derive(Debug)]
pub enum ErrorKind {
    ProtocolError,
    QueueNotFound,
    ConsumerExclusive,
    ServerFull,
    PeerUnresolved,
    PeerUnavailable,
    MessageTimeout,
    ConnectionLost,
    Io(io::ErrorKind),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Wait => write!(f, "would block"),
            BrokerError::Fatal(kind) => write!(f, "{:?}", kind),
        }
    }
}

impl std::error::Error for BrokerError {}

impl From<io::Error> for BrokerError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::WouldBlock => BrokerError::Wait,
            kind => BrokerError::Fatal(ErrorKind::Io(kind)),
        }
    }
}

/// Convenience mirror of the teacher's `ErrorUtils` trait: lets call sites ask "did this
/// fail" without matching on the variant.
pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for BrokerResult<T> {
    fn has_failed(&self) -> bool {
        matches!(self, Err(BrokerError::Fatal(_)))
    }
}
