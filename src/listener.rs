//! Accept-side glue: preamble probing and the wrapping listener.
//!
//! A fresh inbound pipe is probed for the 11-byte session preamble. A
//! match turns the pipe into an acceptor-side session whose streams arrive
//! through [`SessionAcceptor`]; anything else is handed back unmodified,
//! with the probed bytes replayed through [`PreRead`], so multiplexed and
//! plain clients can share one port.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::pipe::Pipe;
use crate::protocol::frame::{self, Preamble, PREAMBLE_LEN};
use crate::protocol::pool::BufferPool;
use crate::session::{Session, Stream};

/// A pipe with a few already-probed bytes to replay before real reads.
pub struct PreRead<P> {
    inner: P,
    buffered: Box<[u8]>,
    offset: usize,
}

impl<P> PreRead<P> {
    fn new(inner: P, buffered: Vec<u8>) -> Self {
        Self {
            inner,
            buffered: buffered.into_boxed_slice(),
            offset: 0,
        }
    }

    /// Consume the wrapper, returning the inner pipe and any bytes not yet
    /// replayed.
    pub fn into_parts(self) -> (P, Vec<u8>) {
        let remaining = self.buffered[self.offset..].to_vec();
        (self.inner, remaining)
    }
}

impl<P: AsyncRead + Unpin> AsyncRead for PreRead<P> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        let remaining = &this.buffered[this.offset..];
        if !remaining.is_empty() {
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<P: AsyncWrite + Unpin> AsyncWrite for PreRead<P> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<P: Pipe> Pipe for PreRead<P> {
    fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
}

/// Outcome of probing a fresh pipe.
pub enum Probed<P> {
    /// The preamble matched; streams arrive through the acceptor.
    Mux(SessionAcceptor),
    /// Not multiplexed. The probed bytes replay through the wrapper.
    Other(PreRead<P>),
}

/// Acceptor side of one multiplexed session.
pub struct SessionAcceptor {
    session: Session,
    incoming: mpsc::Receiver<Stream>,
}

impl SessionAcceptor {
    /// Next stream the peer opened, or `None` once the session is done.
    pub async fn accept(&mut self) -> Option<Stream> {
        self.incoming.recv().await
    }

    /// The session behind this acceptor.
    pub fn session(&self) -> &Session {
        &self.session
    }
}

/// Probe a fresh pipe for the session preamble.
///
/// Reads exactly [`PREAMBLE_LEN`] bytes. The advertised window from a
/// matching preamble overrides the configured one for that session. A
/// matching tag with an unusable version or window is an error and the
/// pipe should be dropped.
pub async fn probe_pipe<P: Pipe>(
    mut pipe: P,
    config: &MuxConfig,
    pool: &BufferPool,
) -> Result<Probed<P>> {
    config.validate()?;
    let mut probe = [0u8; PREAMBLE_LEN];
    pipe.read_exact(&mut probe).await?;
    match frame::parse_preamble(&probe)? {
        Preamble::Mux { window } => {
            let config = MuxConfig {
                window,
                ..config.clone()
            };
            let (accept_tx, incoming) = mpsc::channel(config.accept_backlog);
            let session = Session::start(pipe, config, pool.clone(), Some(accept_tx));
            Ok(Probed::Mux(SessionAcceptor { session, incoming }))
        }
        Preamble::Other => Ok(Probed::Other(PreRead::new(pipe, probe.to_vec()))),
    }
}

/// A connection yielded by [`MuxListener::accept`].
pub enum Accepted {
    /// One stream of a multiplexed session.
    Stream(Stream),
    /// A plain connection from a non-multiplexed caller.
    Raw(PreRead<TcpStream>),
}

/// Wraps a TCP listener, demultiplexing multiplexed sessions from plain
/// connections.
pub struct MuxListener {
    events_rx: mpsc::Receiver<Result<Accepted>>,
    closed_tx: watch::Sender<bool>,
    local_addr: SocketAddr,
}

impl MuxListener {
    /// Bind a TCP listener and wrap it.
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        config: MuxConfig,
        pool: BufferPool,
    ) -> Result<MuxListener> {
        let listener = TcpListener::bind(addr).await?;
        Self::wrap(listener, config, pool)
    }

    /// Wrap an already-bound TCP listener.
    pub fn wrap(listener: TcpListener, config: MuxConfig, pool: BufferPool) -> Result<MuxListener> {
        config.validate()?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = mpsc::channel(config.accept_backlog);
        let (closed_tx, closed_rx) = watch::channel(false);
        tokio::spawn(accept_loop(listener, config, pool, events_tx, closed_rx));
        Ok(MuxListener {
            events_rx,
            closed_tx,
            local_addr,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Next accepted stream or plain connection.
    pub async fn accept(&mut self) -> Result<Accepted> {
        if *self.closed_tx.borrow() {
            return Err(MuxError::ListenerClosed);
        }
        let mut closed_rx = self.closed_tx.subscribe();
        tokio::select! {
            event = self.events_rx.recv() => match event {
                Some(event) => event,
                None => Err(MuxError::ListenerClosed),
            },
            _ = closed_rx.changed() => Err(MuxError::ListenerClosed),
        }
    }

    /// Stop accepting. Already-established sessions keep running.
    pub fn close(&self) {
        let _ = self.closed_tx.send(true);
    }
}

impl std::fmt::Debug for MuxListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MuxListener")
            .field("local_addr", &self.local_addr)
            .field("closed", &*self.closed_tx.borrow())
            .finish()
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: MuxConfig,
    pool: BufferPool,
    events_tx: mpsc::Sender<Result<Accepted>>,
    mut closed_rx: watch::Receiver<bool>,
) {
    loop {
        let accepted = tokio::select! {
            accepted = listener.accept() => accepted,
            _ = closed_rx.changed() => return,
        };
        match accepted {
            Ok((conn, peer)) => {
                tracing::trace!(%peer, "probing inbound connection");
                let config = config.clone();
                let pool = pool.clone();
                let events_tx = events_tx.clone();
                tokio::spawn(async move {
                    match probe_pipe(conn, &config, &pool).await {
                        Ok(Probed::Mux(mut acceptor)) => {
                            while let Some(stream) = acceptor.accept().await {
                                if events_tx.send(Ok(Accepted::Stream(stream))).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Ok(Probed::Other(raw)) => {
                            let _ = events_tx.send(Ok(Accepted::Raw(raw))).await;
                        }
                        // A connection that dies during the probe takes
                        // only itself down, not the listener.
                        Err(err) => {
                            tracing::debug!(%peer, error = %err, "dropping inbound connection")
                        }
                    }
                });
            }
            Err(err) => {
                if events_tx.send(Err(err.into())).await.is_err() {
                    return;
                }
            }
        }
    }
}
