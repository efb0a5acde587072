//! Session and listener configuration.

use std::time::Duration;

use crate::error::{MuxError, Result};
use crate::protocol::frame::MAX_STREAM_ID;

/// Default transmit window, in frames.
pub const DEFAULT_WINDOW: u8 = 25;

/// Default capacity of a session's outbound frame queue.
pub const DEFAULT_OUTBOUND_BACKLOG: usize = 1024;

/// Default backlog of accepted-but-unclaimed streams per listener.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 64;

/// How long a closing stream keeps draining queued frames before giving up.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(30);

/// Configuration shared by dialers, listeners, and their sessions.
#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Transmit window in frames (1..=255), advertised in the preamble.
    pub window: u8,
    /// Capacity of the session outbound channel feeding the write loop.
    pub outbound_backlog: usize,
    /// Backlog of streams waiting to be accepted.
    pub accept_backlog: usize,
    /// Grace period for draining queued writes after a stream close.
    pub close_grace: Duration,
    /// Highest stream ID a dialer assigns before rotating to a fresh pipe.
    ///
    /// Defaults to the 24-bit wire maximum; lower it only to exercise
    /// rotation without millions of dials.
    pub max_stream_id: u32,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            outbound_backlog: DEFAULT_OUTBOUND_BACKLOG,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
            close_grace: DEFAULT_CLOSE_GRACE,
            max_stream_id: MAX_STREAM_ID,
        }
    }
}

impl MuxConfig {
    /// Create a configuration with the given window and defaults elsewhere.
    pub fn with_window(window: u8) -> Self {
        Self {
            window,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.window == 0 {
            return Err(MuxError::Protocol(
                "window must be at least 1 frame".to_string(),
            ));
        }
        if self.max_stream_id > MAX_STREAM_ID {
            return Err(MuxError::Protocol(format!(
                "max stream id {} exceeds the 24-bit wire limit {}",
                self.max_stream_id, MAX_STREAM_ID
            )));
        }
        if self.outbound_backlog == 0 || self.accept_backlog == 0 {
            return Err(MuxError::Protocol(
                "channel backlogs must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}
