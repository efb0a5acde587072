//! Dial-side session management.
//!
//! A [`MuxDialer`] multiplexes every dialed stream over a single pipe until
//! that pipe fails or the 24-bit stream-ID space runs out, then dials a
//! fresh pipe for subsequent streams. Streams already open on the retired
//! session keep working until it fails or they close.

use std::future::Future;
use std::pin::Pin;

use tokio::io::AsyncWriteExt;

use crate::config::MuxConfig;
use crate::error::Result;
use crate::pipe::Pipe;
use crate::protocol::frame;
use crate::protocol::pool::BufferPool;
use crate::session::{Session, Stream};

type BoxConnect<P> =
    Box<dyn Fn() -> Pin<Box<dyn Future<Output = std::io::Result<P>> + Send>> + Send + Sync>;

/// Dials multiplexed streams, rotating the underlying pipe on failure or
/// ID exhaustion.
pub struct MuxDialer<P: Pipe> {
    config: MuxConfig,
    pool: BufferPool,
    connect: BoxConnect<P>,
    state: tokio::sync::Mutex<DialState>,
}

struct DialState {
    session: Option<Session>,
    next_id: u32,
}

impl<P: Pipe> MuxDialer<P> {
    /// Create a dialer around a connect function that produces fresh
    /// pipes.
    pub fn new<F, Fut>(config: MuxConfig, pool: BufferPool, connect: F) -> Result<Self>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::io::Result<P>> + Send + 'static,
    {
        config.validate()?;
        Ok(Self {
            config,
            pool,
            connect: Box::new(move || Box::pin(connect())),
            state: tokio::sync::Mutex::new(DialState {
                session: None,
                next_id: 0,
            }),
        })
    }

    /// Open the next stream, dialing a new pipe first when there is no
    /// usable session.
    ///
    /// Errors from the connect function and the preamble send propagate to
    /// the caller; the next `dial` retries with a fresh pipe.
    pub async fn dial(&self) -> Result<Stream> {
        let mut state = self.state.lock().await;
        let rotate = match &state.session {
            None => true,
            Some(session) => session.is_closed() || state.next_id > self.config.max_stream_id,
        };
        if rotate {
            state.session = Some(self.new_session().await?);
            state.next_id = 0;
        }
        let id = state.next_id;
        state.next_id += 1;
        state
            .session
            .as_ref()
            .expect("session ensured above")
            .open_stream(id)
    }

    async fn new_session(&self) -> Result<Session> {
        let mut pipe = (self.connect)().await?;
        pipe.write_all(&frame::encode_preamble(self.config.window))
            .await?;
        pipe.flush().await?;
        tracing::debug!(window = self.config.window, "started multiplexed session");
        Ok(Session::start(
            pipe,
            self.config.clone(),
            self.pool.clone(),
            None,
        ))
    }
}

impl<P: Pipe> std::fmt::Debug for MuxDialer<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxDialer")
            .field("window", &self.config.window)
            .finish()
    }
}
