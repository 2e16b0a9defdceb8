use std::io;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Malformed caller input, rejected before any mutation.
    InvalidArgument(String),
    /// Key absent. Normal outcome, not logged as an error.
    NotFound,
    /// Probe or allocation limit reached. Signals capacity pressure,
    /// never absence.
    Exhausted(&'static str),
    /// Stored bytes fail validation against the digest. Surfaced to the
    /// caller, never repaired in place.
    Corrupt(String),
    /// Device or filesystem operation failed.
    Io(io::Error),
    /// Persistent state cannot be reattached. Fatal at startup: the store
    /// refuses to open rather than silently dropping data.
    IntegrityViolation(String),
    /// Background task failed to join or signal during close.
    Shutdown(String),
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::NotFound => write!(f, "Not found"),
            Error::Exhausted(what) => write!(f, "Exhausted: {}", what),
            Error::Corrupt(msg) => write!(f, "Corrupt data: {}", msg),
            Error::Io(err) => write!(f, "I/O error: {}", err),
            Error::IntegrityViolation(msg) => write!(f, "Integrity violation: {}", msg),
            Error::Shutdown(msg) => write!(f, "Shutdown error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}
