//! Error types for muxpipe.

use std::sync::Arc;

use thiserror::Error;

/// Main error type for all muxpipe operations.
///
/// The enum is `Clone` so a single session failure can be fanned out to
/// every stream on that session; `Io` therefore wraps its source in an
/// `Arc`.
#[derive(Debug, Clone, Error)]
pub enum MuxError {
    /// A read or write deadline elapsed. Retryable; the stream stays usable.
    #[error("i/o timeout")]
    Timeout,

    /// The stream (or session) was closed locally.
    #[error("connection closed")]
    ConnectionClosed,

    /// I/O error on the underlying pipe. The session and all of its streams
    /// are failed.
    #[error("broken pipe")]
    BrokenPipe,

    /// The listener was closed locally.
    #[error("listener closed")]
    ListenerClosed,

    /// The peer disappeared without closing its streams.
    #[error("unexpected eof")]
    UnexpectedEof,

    /// Malformed frame, oversize payload, or window overrun.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// I/O error while dialing, binding, or sending the session preamble.
    #[error("i/o error: {0}")]
    Io(Arc<std::io::Error>),
}

impl MuxError {
    /// Whether this error is a deadline expiry (and the operation may be
    /// retried on the same stream).
    pub fn is_timeout(&self) -> bool {
        matches!(self, MuxError::Timeout)
    }

    /// The error class a stream on a failed session reports.
    ///
    /// `UnexpectedEof` describes the session-level event; streams surface it
    /// as `BrokenPipe`.
    pub(crate) fn stream_class(&self) -> MuxError {
        match self {
            MuxError::UnexpectedEof => MuxError::BrokenPipe,
            MuxError::Io(_) => MuxError::BrokenPipe,
            other => other.clone(),
        }
    }

    /// Maps an I/O error from the pipe into the session failure taxonomy.
    pub(crate) fn from_pipe(err: std::io::Error) -> MuxError {
        match err.kind() {
            std::io::ErrorKind::UnexpectedEof => MuxError::UnexpectedEof,
            _ => MuxError::BrokenPipe,
        }
    }
}

impl From<std::io::Error> for MuxError {
    fn from(err: std::io::Error) -> Self {
        MuxError::Io(Arc::new(err))
    }
}

/// Result type alias using MuxError.
pub type Result<T> = std::result::Result<T, MuxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_is_the_only_timeout() {
        assert!(MuxError::Timeout.is_timeout());
        assert!(!MuxError::BrokenPipe.is_timeout());
        assert!(!MuxError::ConnectionClosed.is_timeout());
    }

    #[test]
    fn unexpected_eof_surfaces_as_broken_pipe() {
        assert!(matches!(
            MuxError::UnexpectedEof.stream_class(),
            MuxError::BrokenPipe
        ));
        assert!(matches!(
            MuxError::ConnectionClosed.stream_class(),
            MuxError::ConnectionClosed
        ));
    }

    #[test]
    fn pipe_eof_maps_to_unexpected_eof() {
        let eof = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "eof");
        assert!(matches!(MuxError::from_pipe(eof), MuxError::UnexpectedEof));

        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(matches!(MuxError::from_pipe(reset), MuxError::BrokenPipe));
    }
}
