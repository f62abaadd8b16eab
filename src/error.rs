use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// embercache errors.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Error {
    /// On-disk data failed validation: WAL checksum mismatch, implausible
    /// frame length, SSTable footer magic mismatch, or a short read.
    Corruption(String),
    /// Malformed client input: bad RESP framing, unknown command, or wrong
    /// arity. Surfaced to the client as an `-ERR` reply.
    Protocol(String),
    /// An IO error from the filesystem or a socket.
    IO(String),
    /// A proposal was made to a Raft node that is not the leader.
    NotLeader,
    /// A write was attempted on a read-only structure (finished SSTable
    /// writer, stopped worker, etc.).
    ReadOnly,
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(msg) => write!(f, "corruption: {msg}"),
            Error::Protocol(msg) => write!(f, "protocol error: {msg}"),
            Error::IO(msg) => write!(f, "io error: {msg}"),
            Error::NotLeader => write!(f, "not the leader"),
            Error::ReadOnly => write!(f, "write attempted on read-only structure"),
        }
    }
}

/// Constructs an Error::Corruption from the given format string.
#[macro_export]
macro_rules! errcorrupt {
    ($($args:tt)*) => { $crate::error::Error::Corruption(format!($($args)*)).into() };
}

/// Constructs an Error::Protocol from the given format string.
#[macro_export]
macro_rules! errproto {
    ($($args:tt)*) => { $crate::error::Error::Protocol(format!($($args)*)).into() };
}

/// An embercache Result returning Error.
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
