use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Autumn errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// Append rejected because the extent is sealed. The stream client reacts
    /// by allocating a successor extent.
    Sealed,
    /// A replica refused a non-contiguous append. The stream client reacts by
    /// sealing the extent.
    OffsetMismatch { expected: u32, actual: u32 },
    /// A record failed checksum verification.
    ChecksumMismatch,
    /// Reading reached the commit length of a sealed extent. Iterator-control
    /// signal, not a failure.
    EndOfExtent,
    /// Reading reached the commit length of the open tail extent.
    /// Iterator-control signal, not a failure.
    EndOfStream,
    /// A replicated append was not acknowledged by every replica. The
    /// primary may have advanced; repair happens through sealing.
    AppendFailed,
    /// No live entry (or the latest entry is a tombstone) for the key.
    NotFound,
    /// Operation against a partition that is shutting down.
    Closed,
    /// Invalid data, typically decoding errors, corruption, or unexpected internal values.
    InvalidData(String),
    /// Invalid user input.
    InvalidInput(String),
    /// An IO error.
    IO(String),
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Sealed => write!(f, "extent is sealed"),
            Error::OffsetMismatch { expected, actual } => {
                write!(f, "offset mismatch: expected {expected}, actual {actual}")
            }
            Error::ChecksumMismatch => write!(f, "checksum mismatch"),
            Error::EndOfExtent => write!(f, "end of extent"),
            Error::EndOfStream => write!(f, "end of stream"),
            Error::AppendFailed => write!(f, "replicated append failed"),
            Error::NotFound => write!(f, "key not found"),
            Error::Closed => write!(f, "partition is closed"),
            Error::InvalidData(msg) => write!(f, "invalid data: {msg}"),
            Error::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
        }
    }
}

/// Constructs an Error::InvalidData for the given format string.
#[macro_export]
macro_rules! errdata {
    ($($args:tt)*) => { $crate::error::Error::InvalidData(format!($($args)*)).into() };
}

/// Constructs an Error::InvalidInput for the given format string.
#[macro_export]
macro_rules! errinput {
    ($($args:tt)*) => { $crate::error::Error::InvalidInput(format!($($args)*)).into() };
}

/// An Autumn Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

impl<T> From<Error> for Result<T> {
    fn from(error: Error) -> Self {
        Err(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        Error::IO(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::InvalidData(err.to_string())
    }
}
