//! # muxpipe
//!
//! Multiplexes many independently-flow-controlled, bidirectional byte
//! streams over a single reliable, ordered pipe (typically a TCP
//! connection). To its user a [`Stream`] looks like an ordinary duplex
//! connection with read and write deadlines; underneath, all streams of a
//! session share one pipe.
//!
//! ## Definitions
//!
//! - **pipe**: the underlying byte channel (anything implementing
//!   [`Pipe`])
//! - **stream**: a virtual connection multiplexed over a pipe, identified
//!   by a 24-bit ID
//! - **session**: the engine managing one pipe and its streams, one to
//!   one with the pipe
//!
//! ## Protocol
//!
//! A session opens with an 11-byte preamble (tag, version, window). After
//! that the pipe carries frames: a 4-byte big-endian stream-ID word whose
//! high byte is the frame type (DATA, ACK, or RST) and, for DATA only, a
//! 2-byte length plus up to 8192 payload bytes.
//!
//! Flow control is credit-based per stream: a sender may have at most
//! `window` un-ACKed DATA frames in flight; the receiver ACKs each frame
//! as its reader advances past it. RST closes one stream abortively and is
//! never answered.
//!
//! ## Example
//!
//! ```ignore
//! use muxpipe::{BufferPool, MuxConfig, MuxDialer};
//!
//! #[tokio::main]
//! async fn main() -> muxpipe::Result<()> {
//!     let pool = BufferPool::new(64);
//!     let dialer = MuxDialer::new(MuxConfig::default(), pool, || {
//!         tokio::net::TcpStream::connect("127.0.0.1:9000")
//!     })?;
//!
//!     let stream = dialer.dial().await?;
//!     stream.write(b"hello").await?;
//!     let mut reply = [0u8; 5];
//!     stream.read_exact(&mut reply).await?;
//!     stream.close();
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod protocol;

mod dialer;
mod listener;
mod pipe;
mod session;

pub use config::MuxConfig;
pub use dialer::MuxDialer;
pub use error::{MuxError, Result};
pub use listener::{probe_pipe, Accepted, MuxListener, PreRead, Probed, SessionAcceptor};
pub use pipe::Pipe;
pub use protocol::pool::BufferPool;
pub use session::{Session, Stream};
