use std::fmt;

use crate::guid::Guid;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Corrupt(&'static str),
    CorruptMetadata(&'static str),
    Unsupported(&'static str),
    UnsupportedVersion(u32),
    PayloadTooLarge,
    /// The store index claims the payload exists but it could not be read
    /// back intact. Fatal to the owning queue, not to the store.
    PayloadMissing(Guid),
    /// An fsync on the store failed; the instance refuses further work.
    StorePoisoned,
    /// A write failed even after the single retry.
    WriteFailed(std::io::Error),
    /// An internal precondition did not hold. Always a bug, never data.
    InvariantViolated(&'static str),
    UnknownClient,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Corrupt(msg) => write!(f, "corrupt data: {msg}"),
            Error::CorruptMetadata(msg) => write!(f, "corrupt metadata: {msg}"),
            Error::Unsupported(msg) => write!(f, "unsupported: {msg}"),
            Error::UnsupportedVersion(version) => write!(f, "unsupported version: {version}"),
            Error::PayloadTooLarge => write!(f, "payload too large"),
            Error::PayloadMissing(guid) => write!(f, "payload missing from store: {guid}"),
            Error::StorePoisoned => write!(f, "message store poisoned by earlier fsync failure"),
            Error::WriteFailed(err) => write!(f, "store write failed after retry: {err}"),
            Error::InvariantViolated(msg) => write!(f, "invariant violated: {msg}"),
            Error::UnknownClient => write!(f, "unknown store client"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::WriteFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
