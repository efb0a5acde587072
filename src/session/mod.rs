//! The session engine: one underlying pipe, many streams.
//!
//! A session runs exactly two loops. The read loop demultiplexes inbound
//! frames (credits to send buffers, resets to stream teardown, data to
//! receive buffers), creating streams on first sight of an ID. The write
//! loop serializes everything the send and receive buffers queue on the
//! shared outbound channel.
//!
//! Any I/O or protocol error on either loop fails the whole session: the
//! pipe is closed and every stream reports the mapped error from then on.

pub(crate) mod recv;
pub(crate) mod send;
mod stream;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock, RwLock};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch, Semaphore};

use crate::config::MuxConfig;
use crate::error::{MuxError, Result};
use crate::pipe::Pipe;
use crate::protocol::frame::{self, FrameType, FRAME_HEADER_LEN, ID_LEN};
use crate::protocol::pool::{BufferPool, PooledBuf};

pub use stream::Stream;
pub(crate) use stream::StreamShared;

/// How many immediately-available frames the write loop folds into one
/// flush.
const MAX_BURST: usize = 64;

/// A frame queued for the session write loop.
///
/// DATA rides in a pool-drawn buffer with header room at the front; the
/// control words are built on the stack at write time and never touch the
/// pool.
#[derive(Debug)]
pub(crate) enum Outbound {
    Data { id: u32, frame: PooledBuf },
    Ack { id: u32 },
    Rst { id: u32 },
}

/// Session-side handles to one stream.
#[derive(Clone)]
pub(crate) struct StreamEntry {
    shared: Arc<StreamShared>,
    recv: recv::RecvHandle,
    credits: Arc<Semaphore>,
    send: send::SendHandle,
}

impl StreamEntry {
    /// Restore one send credit on behalf of a peer ACK.
    ///
    /// More credits than the window means the peer ACKed frames that were
    /// never in flight.
    fn grant_credit(&self, window: usize) -> Result<()> {
        if self.credits.is_closed() {
            // ACKs for frames that drained during a close; nobody waits on
            // these credits anymore.
            return Ok(());
        }
        if self.credits.available_permits() >= window {
            return Err(MuxError::Protocol(
                "peer acknowledged more frames than the window holds".to_string(),
            ));
        }
        self.credits.add_permits(1);
        Ok(())
    }

    /// Tear the stream down after a peer RST: readers drain what is
    /// buffered and then see end-of-stream; no RST is echoed back.
    fn close_remote(&self) {
        self.shared
            .remote_closed
            .store(true, std::sync::atomic::Ordering::Release);
        self.recv.close();
        self.send.close(false);
        self.credits.close();
    }

    /// Fail the stream with the session's error class.
    fn fail(&self, err: MuxError) {
        let _ = self.shared.failure.set(err);
        self.recv.close();
        self.send.close(false);
        self.credits.close();
    }
}

pub(crate) struct SessionCore {
    config: MuxConfig,
    pub(crate) pool: BufferPool,
    out_tx: mpsc::Sender<Outbound>,
    streams: RwLock<HashMap<u32, StreamEntry>>,
    /// Present on the acceptor side: newly-seen stream IDs surface here.
    accept_tx: Option<mpsc::Sender<Stream>>,
    failure: OnceLock<MuxError>,
    closed_tx: watch::Sender<bool>,
    pub(crate) local_addr: Option<SocketAddr>,
    pub(crate) peer_addr: Option<SocketAddr>,
}

impl SessionCore {
    /// Fail the session: record the error, stop both loops, and fan the
    /// mapped error class out to every stream. First failure wins.
    fn fail(&self, err: MuxError) {
        if self.failure.set(err.clone()).is_err() {
            return;
        }
        tracing::debug!(error = %err, "session failed");
        let _ = self.closed_tx.send(true);
        let entries: Vec<StreamEntry> = {
            let mut table = self.streams.write().expect("stream table poisoned");
            table.drain().map(|(_, entry)| entry).collect()
        };
        let class = err.stream_class();
        for entry in entries {
            entry.fail(class.clone());
        }
    }
}

/// Handle to a running session.
///
/// Cheaply cloneable; the session itself lives as long as its loops and
/// streams do.
#[derive(Clone)]
pub struct Session {
    core: Arc<SessionCore>,
}

impl Session {
    /// Start a session over a freshly-prepared pipe (preamble already
    /// exchanged) and spawn its read and write loops.
    pub(crate) fn start<P: Pipe>(
        pipe: P,
        config: MuxConfig,
        pool: BufferPool,
        accept_tx: Option<mpsc::Sender<Stream>>,
    ) -> Session {
        let local_addr = pipe.local_addr();
        let peer_addr = pipe.peer_addr();
        let (out_tx, out_rx) = mpsc::channel(config.outbound_backlog);
        let (closed_tx, closed_rx) = watch::channel(false);
        let core = Arc::new(SessionCore {
            config,
            pool,
            out_tx,
            streams: RwLock::new(HashMap::new()),
            accept_tx,
            failure: OnceLock::new(),
            closed_tx,
            local_addr,
            peer_addr,
        });
        let (read_half, write_half) = tokio::io::split(pipe);
        tokio::spawn(read_loop(Arc::clone(&core), read_half, closed_rx.clone()));
        tokio::spawn(write_loop(Arc::clone(&core), out_rx, write_half, closed_rx));
        Session { core }
    }

    pub(crate) fn from_core(core: Arc<SessionCore>) -> Session {
        Session { core }
    }

    /// Address of the local end of the pipe, when it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Address of the remote end of the pipe, when it has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer_addr
    }

    /// The transmit window this session operates with, in frames.
    pub fn window(&self) -> u8 {
        self.core.config.window
    }

    /// Whether the session has failed or been closed; no new streams can
    /// be opened on it.
    pub fn is_closed(&self) -> bool {
        self.core.failure.get().is_some()
    }

    /// Close the session and every stream on it.
    pub fn close(&self) {
        self.core.fail(MuxError::ConnectionClosed);
    }

    /// Open the dial-side stream with the given ID.
    pub(crate) fn open_stream(&self, id: u32) -> Result<Stream> {
        if let Some(err) = self.core.failure.get() {
            return Err(err.clone());
        }
        let (_, stream) = get_or_create(&self.core, id);
        stream.ok_or_else(|| MuxError::Protocol(format!("stream id {id} already in use")))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("peer_addr", &self.core.peer_addr)
            .field("window", &self.core.config.window)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Look up a stream, creating it on first sight of the ID.
///
/// The new endpoint handle, when one was created, is returned for
/// publication (acceptor) or hand-off to the dialer.
fn get_or_create(core: &Arc<SessionCore>, id: u32) -> (StreamEntry, Option<Stream>) {
    if let Some(entry) = core
        .streams
        .read()
        .expect("stream table poisoned")
        .get(&id)
    {
        return (entry.clone(), None);
    }
    let mut table = core.streams.write().expect("stream table poisoned");
    if let Some(entry) = table.get(&id) {
        return (entry.clone(), None);
    }
    let window = core.config.window as usize;
    let (recv_handle, reader) = recv::receive_buffer(id, window, core.out_tx.clone());
    let (send_handle, frame_tx, credits) =
        send::send_buffer(id, window, core.out_tx.clone(), core.config.close_grace);
    let shared = Arc::new(StreamShared::new(id));
    let entry = StreamEntry {
        shared: Arc::clone(&shared),
        recv: recv_handle.clone(),
        credits: Arc::clone(&credits),
        send: send_handle.clone(),
    };
    table.insert(id, entry.clone());
    let stream = Stream::new(
        shared,
        Arc::clone(core),
        reader,
        recv_handle,
        frame_tx,
        credits,
        send_handle,
    );
    drop(table);
    // A failure fanned out while we were inserting would miss this entry.
    if let Some(err) = core.failure.get() {
        entry.fail(err.stream_class());
    }
    (entry, Some(stream))
}

/// Surface a freshly-created stream. On the acceptor side it goes to the
/// accept channel; on the dial side a stream we did not open ourselves has
/// no owner, and dropping the handle resets it.
async fn publish(core: &Arc<SessionCore>, stream: Option<Stream>) {
    let Some(stream) = stream else {
        return;
    };
    if let Some(accept_tx) = &core.accept_tx {
        let _ = accept_tx.send(stream).await;
    }
}

async fn read_loop<R>(core: Arc<SessionCore>, mut pipe: R, mut closed_rx: watch::Receiver<bool>)
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        res = drive_read(&core, &mut pipe) => {
            if let Err(err) = res {
                core.fail(err);
            }
        }
        _ = closed_rx.changed() => {}
    }
    // The read half drops here, which closes the pipe together with the
    // write half.
}

async fn drive_read<R>(core: &Arc<SessionCore>, pipe: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    loop {
        let mut buf = core.pool.acquire();
        buf.resize(FRAME_HEADER_LEN, 0);
        pipe.read_exact(&mut buf[..ID_LEN])
            .await
            .map_err(MuxError::from_pipe)?;
        let word: [u8; ID_LEN] = buf[..ID_LEN].try_into().expect("id word size");
        let (raw_type, id) = frame::split_id_word(word);

        match FrameType::from_wire(raw_type)? {
            FrameType::Ack => {
                let (entry, created) = get_or_create(core, id);
                publish(core, created).await;
                entry.grant_credit(core.config.window as usize)?;
            }
            FrameType::Rst => {
                let entry = core
                    .streams
                    .write()
                    .expect("stream table poisoned")
                    .remove(&id);
                if let Some(entry) = entry {
                    entry.close_remote();
                }
            }
            FrameType::Data => {
                pipe.read_exact(&mut buf[ID_LEN..FRAME_HEADER_LEN])
                    .await
                    .map_err(MuxError::from_pipe)?;
                let len = frame::decode_data_len([buf[ID_LEN], buf[ID_LEN + 1]])?;
                buf.resize(FRAME_HEADER_LEN + len, 0);
                pipe.read_exact(&mut buf[FRAME_HEADER_LEN..])
                    .await
                    .map_err(MuxError::from_pipe)?;
                let (entry, created) = get_or_create(core, id);
                publish(core, created).await;
                entry.recv.submit(buf)?;
            }
        }
    }
}

async fn write_loop<W>(
    core: Arc<SessionCore>,
    mut out_rx: mpsc::Receiver<Outbound>,
    mut pipe: W,
    mut closed_rx: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let outbound = tokio::select! {
            outbound = out_rx.recv() => outbound,
            _ = closed_rx.changed() => None,
        };
        let Some(outbound) = outbound else {
            let _ = pipe.shutdown().await;
            return;
        };
        if let Err(err) = write_burst(&mut pipe, outbound, &mut out_rx).await {
            core.fail(MuxError::from_pipe(err));
            return;
        }
    }
}

/// Write one frame plus whatever else is already queued, then flush once.
async fn write_burst<W>(
    pipe: &mut W,
    first: Outbound,
    out_rx: &mut mpsc::Receiver<Outbound>,
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut next = Some(first);
    let mut burst = 0;
    while let Some(outbound) = next {
        write_frame(pipe, outbound).await?;
        burst += 1;
        next = if burst < MAX_BURST {
            out_rx.try_recv().ok()
        } else {
            None
        };
    }
    pipe.flush().await
}

async fn write_frame<W>(pipe: &mut W, outbound: Outbound) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    match outbound {
        Outbound::Data { id, mut frame } => {
            let len = frame.len() - FRAME_HEADER_LEN;
            frame::encode_data_header(&mut frame[..FRAME_HEADER_LEN], id, len);
            pipe.write_all(&frame).await
            // The frame buffer drops back to the pool here.
        }
        Outbound::Ack { id } => {
            pipe.write_all(&frame::encode_control(FrameType::Ack, id))
                .await
        }
        Outbound::Rst { id } => {
            pipe.write_all(&frame::encode_control(FrameType::Rst, id))
                .await
        }
    }
}
