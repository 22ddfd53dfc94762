//! Custom error types for the driver.
//!
//! This module defines the primary error type, `PsuError`, together with the two
//! lower-level error kinds it is built from. Using the `thiserror` crate, it provides
//! a centralized and consistent way to classify failures so that the device session
//! can pick the right recovery for each of them.
//!
//! ## Error Hierarchy
//!
//! - **`TransportError`**: produced by a [`Transport`](crate::transport::Transport).
//!   Failing to open a link (`Open`) is a distinct kind from an I/O failure on an
//!   already open link (`Io`), and both are distinct from a read deadline expiring
//!   (`Timeout`).
//! - **`DecodeError`**: produced by the [`Codec`](crate::protocol::Codec) when a
//!   response frame arrived but does not fit the protocol grammar.
//! - **`PsuError`**: what callers of the request channel and the bridge see. Transient
//!   transport and decode failures are retried inside the session and only surface
//!   here once retries are exhausted.

use std::io;
use thiserror::Error;

/// Convenience alias for results using the driver error type.
pub type PsuResult<T> = std::result::Result<T, PsuError>;

/// Failure of a [`Transport`](crate::transport::Transport) operation.
#[derive(Error, Debug)]
pub enum TransportError {
    /// The link could not be opened (device absent, permission, unreachable host).
    #[error("failed to open {target}: {source}")]
    Open {
        /// Human-readable description of the link target.
        target: String,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// I/O failure on an open link.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// No complete frame arrived before the read deadline.
    #[error("timed out waiting for response")]
    Timeout,

    /// The peer closed the link.
    #[error("link closed by peer")]
    Closed,

    /// An operation was attempted on a link that is not open.
    #[error("link is not open")]
    NotOpen,
}

impl TransportError {
    /// True for the connect-time failure kind.
    pub fn is_open_failure(&self) -> bool {
        matches!(self, TransportError::Open { .. })
    }
}

/// A response frame that arrived but violates the protocol grammar.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Response bytes were not valid ASCII/UTF-8.
    #[error("response is not valid text: {0:?}")]
    NotText(Vec<u8>),

    /// Response was empty.
    #[error("empty response")]
    Empty,

    /// Response did not have the expected shape.
    #[error("unexpected response '{response}' (expected {expected})")]
    Unexpected {
        /// The offending response text.
        response: String,
        /// What the codec expected to see.
        expected: &'static str,
    },

    /// A numeric response outside the valid range.
    #[error("value {0} out of range")]
    OutOfRange(f64),

    /// The device answered with one of its error tokens.
    #[error("device rejected command with {0}")]
    DeviceRejected(String),
}

/// Primary error type seen by callers of the driver.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PsuError {
    /// Invalid configuration. Fatal at startup, surfaced before any connection attempt.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// The session is not Ready (faulted, reconnecting or shut down).
    #[error("not connected")]
    NotConnected,

    /// No response within the request deadline after all retries.
    #[error("no response from device after {attempts} attempt(s)")]
    Timeout {
        /// How many exchanges were attempted.
        attempts: u32,
    },

    /// Responses kept arriving but could not be decoded.
    #[error("undecodable response after {attempts} attempt(s): {source}")]
    Decode {
        /// How many exchanges were attempted.
        attempts: u32,
        /// The last decode failure.
        #[source]
        source: DecodeError,
    },

    /// The device answered with an error token.
    #[error("device error {0}")]
    Device(String),

    /// The request channel is full and the submit policy is `Reject`.
    #[error("request queue is full")]
    QueueFull,

    /// Write attempted on a read-only channel.
    #[error("channel '{0}' is read-only")]
    ReadOnly(String),

    /// Unknown channel name.
    #[error("unknown channel '{0}'")]
    UnknownChannel(String),

    /// Value has the wrong type for the channel or is not finite.
    #[error("invalid value for channel '{channel}': {reason}")]
    InvalidValue {
        /// Channel the value was written to.
        channel: String,
        /// Why it was rejected.
        reason: String,
    },
}

impl PsuError {
    /// True if retrying the same request later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PsuError::NotConnected
                | PsuError::Timeout { .. }
                | PsuError::Decode { .. }
                | PsuError::QueueFull
        )
    }
}

impl From<figment::Error> for PsuError {
    fn from(err: figment::Error) -> Self {
        PsuError::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_failure_is_distinct_from_io() {
        let open = TransportError::Open {
            target: "/dev/ttyUSB9".into(),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let io_err = TransportError::Io(io::Error::from(io::ErrorKind::BrokenPipe));

        assert!(open.is_open_failure());
        assert!(!io_err.is_open_failure());
        assert!(!TransportError::Timeout.is_open_failure());
        assert!(open.to_string().contains("/dev/ttyUSB9"));
    }

    #[test]
    fn transient_classification() {
        assert!(PsuError::NotConnected.is_transient());
        assert!(PsuError::Timeout { attempts: 3 }.is_transient());
        assert!(!PsuError::Configuration("bad".into()).is_transient());
        assert!(!PsuError::Device("E01".into()).is_transient());
    }

    #[test]
    fn decode_error_is_kept_as_source() {
        let err = PsuError::Decode {
            attempts: 3,
            source: DecodeError::Empty,
        };
        assert!(err.to_string().contains("3 attempt"));
        assert!(std::error::Error::source(&err).is_some());
    }
}
