//! Error types for conet hosts, channels and protocol instances.

use std::io;

use thiserror::Error;

/// Errors surfaced by conet transports, channels and the overlay.
#[derive(Error, Debug)]
pub enum ConetError {
    /// The connection (or host) is closed.
    #[error("connection closed")]
    Closed,

    /// The remote endpoint ended the stream.
    #[error("end of stream")]
    Eof,

    /// The operation was canceled by a host-level close signal.
    #[error("operation canceled")]
    Canceled,

    /// A transient transport fault; safe to retry.
    #[error("temporary transport error")]
    Temporary,

    /// A deadline expired; the caller should back off before retrying.
    #[error("timed out")]
    Timeout,

    /// A transport fault that fits no other class.
    #[error("transport error: {0}")]
    Unknown(String),

    /// Dialing gave up after exhausting its retry budget.
    #[error("dial to {target} failed after {attempts} attempts")]
    DialFailure {
        /// Address or identity that could not be reached.
        target: String,
        /// Number of attempts made before giving up.
        attempts: u32,
    },

    /// The identity handshake failed; the connection was dropped.
    #[error("identity negotiation failed: {0}")]
    Negotiation(String),

    /// A single message could not be decoded; the connection stays usable.
    #[error("cannot decode message: {0}")]
    Unmarshal(String),

    /// A frame exceeds the configured maximum size.
    #[error("message too large: {size} bytes (max {max} bytes)")]
    MessageTooLarge {
        /// Actual payload size.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// No configured address could be bound for listening.
    #[error("listen failed: {0}")]
    Listen(String),

    /// Roster or tree construction failed.
    #[error("tree error: {0}")]
    Tree(String),

    /// A protocol-level failure surfaced to the driver.
    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Convenience result type for conet operations.
pub type Result<T> = std::result::Result<T, ConetError>;

/// Classify an I/O fault into the transport error taxonomy.
///
/// `Temporary` is safely retryable; `Timeout` requires caller backoff.
pub fn classify_io(err: io::Error) -> ConetError {
    use io::ErrorKind::*;
    match err.kind() {
        UnexpectedEof => ConetError::Eof,
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected => ConetError::Closed,
        TimedOut | WouldBlock => ConetError::Timeout,
        Interrupted => ConetError::Temporary,
        _ => ConetError::Unknown(err.to_string()),
    }
}

impl From<io::Error> for ConetError {
    fn from(err: io::Error) -> Self {
        classify_io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_common_kinds() {
        let eof = io::Error::new(io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(classify_io(eof), ConetError::Eof));

        let reset = io::Error::new(io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(classify_io(reset), ConetError::Closed));

        let timeout = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert!(matches!(classify_io(timeout), ConetError::Timeout));

        let interrupted = io::Error::new(io::ErrorKind::Interrupted, "eintr");
        assert!(matches!(classify_io(interrupted), ConetError::Temporary));
    }

    #[test]
    fn unknown_keeps_the_message() {
        let odd = io::Error::new(io::ErrorKind::Other, "strange fault");
        match classify_io(odd) {
            ConetError::Unknown(msg) => assert!(msg.contains("strange fault")),
            other => panic!("unexpected classification: {other:?}"),
        }
    }
}
