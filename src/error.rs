//! Error taxonomy shared by futures, tasks and the loop.
//!
//! Errors are `Clone`: a finished [`Future`](crate::Future) hands the same
//! error to every reader, so user errors are kept behind an `Arc`.

use std::error::Error as StdError;
use std::io;
use std::sync::Arc;

/// A centralized error type for futures, tasks and scheduler operations.
#[derive(thiserror::Error, Debug, Clone)]
pub enum Error {
    /// Control-flow signal: the future or task was aborted before producing
    /// a value. Not a failure.
    #[error("operation was cancelled")]
    Cancelled,

    /// Programmer error: setting a result twice, reading a pending future,
    /// awaiting a future from two tasks at once.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Produced by the timeout racing helpers.
    #[error("operation timed out")]
    Timeout,

    /// A task step or a blocking callable panicked.
    #[error("panicked: {0}")]
    Panic(String),

    #[error("IO error: {0}")]
    Io(Arc<io::Error>),

    /// Any error raised by user code.
    #[error("{0}")]
    Failed(Arc<anyhow::Error>),
}

impl Error {
    /// Wraps a user error.
    pub fn failed(error: impl Into<anyhow::Error>) -> Self {
        Error::Failed(Arc::new(error.into()))
    }

    /// Builds a user error from a message.
    pub fn msg(message: impl std::fmt::Display + std::fmt::Debug + Send + Sync + 'static) -> Self {
        Error::Failed(Arc::new(anyhow::Error::msg(message)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout)
    }

    /// Recovers the concrete type of a user error.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + Send + Sync + 'static,
    {
        match self {
            Error::Failed(error) => error.downcast_ref::<E>(),
            Error::Io(error) => (error.as_ref() as &(dyn StdError + 'static)).downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(error: io::Error) -> Self {
        Error::Io(Arc::new(error))
    }
}

impl From<anyhow::Error> for Error {
    fn from(error: anyhow::Error) -> Self {
        Error::Failed(Arc::new(error))
    }
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Cancelled, Self::Cancelled) => true,
            (Self::InvalidState(a), Self::InvalidState(b)) => a == b,
            (Self::Timeout, Self::Timeout) => true,
            (Self::Panic(a), Self::Panic(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.kind() == b.kind(),
            (Self::Failed(a), Self::Failed(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(thiserror::Error, Debug, PartialEq)]
    #[error("value error: {0}")]
    struct ValueError(&'static str);

    #[test]
    fn test_downcast_user_error() {
        let error = Error::failed(ValueError("x"));

        assert_eq!(error.downcast_ref::<ValueError>(), Some(&ValueError("x")));
        assert!(!error.is_cancelled());
        assert_eq!(error.to_string(), "value error: x");
    }

    #[test]
    fn test_clones_compare_equal() {
        let error = Error::msg("shared");
        assert_eq!(error.clone(), error);
        assert_ne!(Error::msg("a"), Error::msg("a"));
    }
}
