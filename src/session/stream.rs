//! The user-visible duplex endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::sync::mpsc;
use tokio::sync::Semaphore;
use tokio::time::{timeout_at, Instant};

use crate::error::{MuxError, Result};
use crate::protocol::frame::{FRAME_HEADER_LEN, MAX_DATA_LEN};
use crate::session::recv::{RecvHandle, RecvReader};
use crate::session::send::SendHandle;
use crate::session::{Session, SessionCore};

/// State shared between a stream endpoint and its session's bookkeeping.
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    /// Set once by a local `close`; reads fail `ConnectionClosed` after.
    pub(crate) closed: AtomicBool,
    /// Set when the peer reset the stream; writes are silently discarded.
    pub(crate) remote_closed: AtomicBool,
    /// First non-timeout failure; every later operation reports this class.
    pub(crate) failure: OnceLock<MuxError>,
    deadlines: Mutex<Deadlines>,
}

#[derive(Default, Clone, Copy)]
struct Deadlines {
    read: Option<Instant>,
    write: Option<Instant>,
}

impl StreamShared {
    pub(crate) fn new(id: u32) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            remote_closed: AtomicBool::new(false),
            failure: OnceLock::new(),
            deadlines: Mutex::new(Deadlines::default()),
        }
    }

    fn deadlines(&self) -> Deadlines {
        *self.deadlines.lock().expect("deadline lock poisoned")
    }
}

/// A logical bidirectional byte channel multiplexed over a session's pipe.
///
/// Streams are safe to share behind an `Arc`: reads, writes, closes, and
/// deadline updates may come from independent tasks. Dropping an unclosed
/// stream closes it.
pub struct Stream {
    shared: Arc<StreamShared>,
    core: Arc<SessionCore>,
    reader: tokio::sync::Mutex<RecvReader>,
    recv: RecvHandle,
    frame_tx: mpsc::Sender<crate::protocol::pool::PooledBuf>,
    credits: Arc<Semaphore>,
    send: SendHandle,
}

impl Stream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        shared: Arc<StreamShared>,
        core: Arc<SessionCore>,
        reader: RecvReader,
        recv: RecvHandle,
        frame_tx: mpsc::Sender<crate::protocol::pool::PooledBuf>,
        credits: Arc<Semaphore>,
        send: SendHandle,
    ) -> Self {
        Self {
            shared,
            core,
            reader: tokio::sync::Mutex::new(reader),
            recv,
            frame_tx,
            credits,
            send,
        }
    }

    /// The 24-bit stream identifier.
    pub fn id(&self) -> u32 {
        self.shared.id
    }

    /// The session this stream runs on.
    pub fn session(&self) -> Session {
        Session::from_core(Arc::clone(&self.core))
    }

    /// Address of the local end of the underlying pipe, when it has one.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.core.local_addr
    }

    /// Address of the remote end of the underlying pipe, when it has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.core.peer_addr
    }

    /// Set both deadlines. `None` means no timeout.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        let mut deadlines = self.shared.deadlines.lock().expect("deadline lock poisoned");
        deadlines.read = deadline;
        deadlines.write = deadline;
    }

    /// Set the deadline for subsequent reads. `None` means no timeout.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.shared
            .deadlines
            .lock()
            .expect("deadline lock poisoned")
            .read = deadline;
    }

    /// Set the deadline for subsequent writes. `None` means no timeout.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.shared
            .deadlines
            .lock()
            .expect("deadline lock poisoned")
            .write = deadline;
    }

    /// Read into `dest`, waiting up to the read deadline when nothing is
    /// buffered.
    ///
    /// `Ok(0)` (with a non-empty `dest`) means the peer finished the
    /// stream. A `Timeout` leaves the stream usable.
    pub async fn read(&self, dest: &mut [u8]) -> Result<usize> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        if let Some(err) = self.shared.failure.get() {
            return Err(err.clone());
        }
        let deadline = self.shared.deadlines().read;
        let mut reader = self.reader.lock().await;
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(MuxError::ConnectionClosed);
        }
        reader.read(dest, deadline).await
    }

    /// Read until `dest` is full or the stream ends.
    pub async fn read_exact(&self, dest: &mut [u8]) -> Result<usize> {
        let mut total = 0;
        while total < dest.len() {
            match self.read(&mut dest[total..]).await? {
                0 => return Err(MuxError::UnexpectedEof),
                n => total += n,
            }
        }
        Ok(total)
    }

    /// Write `src` to the stream, chunking it into maximum-size frames.
    ///
    /// Each frame waits for one flow-control credit and a queue slot, up to
    /// the write deadline. A `Timeout` with nothing yet enqueued leaves the
    /// stream usable and the frame unsent; once some chunks are enqueued,
    /// the count written so far is returned instead. Writes on a closed
    /// stream report the nominal byte count without sending anything.
    pub async fn write(&self, src: &[u8]) -> Result<usize> {
        if self.closed_for_write() {
            return Ok(src.len());
        }
        if let Some(err) = self.shared.failure.get() {
            return Err(err.clone());
        }
        if src.is_empty() {
            return Ok(0);
        }
        let deadline = self.shared.deadlines().write;
        let mut written = 0;
        for chunk in src.chunks(MAX_DATA_LEN) {
            match self.write_chunk(chunk, deadline).await {
                Ok(()) => written += chunk.len(),
                Err(_) if written > 0 => return Ok(written),
                Err(err) => return Err(err),
            }
        }
        Ok(written)
    }

    async fn write_chunk(&self, chunk: &[u8], deadline: Option<Instant>) -> Result<()> {
        let acquire = Arc::clone(&self.credits).acquire_owned();
        let permit = match deadline {
            Some(deadline) => match timeout_at(deadline, acquire).await {
                Ok(permit) => permit,
                Err(_) => return Err(MuxError::Timeout),
            },
            None => acquire.await,
        };
        let Ok(permit) = permit else {
            // Credits were revoked: the stream closed or failed while we
            // were waiting.
            return self.write_interrupted();
        };

        let mut frame = self.core.pool.acquire();
        frame.resize(FRAME_HEADER_LEN, 0);
        frame.extend_from_slice(chunk);

        let enqueue = self.frame_tx.send(frame);
        let sent = match deadline {
            Some(deadline) => match timeout_at(deadline, enqueue).await {
                Ok(sent) => sent,
                // Dropping the unused permit returns the credit.
                Err(_) => return Err(MuxError::Timeout),
            },
            None => enqueue.await,
        };
        match sent {
            Ok(()) => {
                // The credit is consumed by the frame now in flight; an ACK
                // from the peer restores it.
                permit.forget();
                Ok(())
            }
            Err(_) => self.write_interrupted(),
        }
    }

    /// Outcome of a write overtaken by a concurrent close or failure.
    fn write_interrupted(&self) -> Result<()> {
        match self.shared.failure.get() {
            Some(err) => Err(err.clone()),
            // Closed underneath us: the bytes are silently discarded.
            None => Ok(()),
        }
    }

    fn closed_for_write(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
            || self.shared.remote_closed.load(Ordering::Acquire)
    }

    /// Close the stream. Idempotent and always effective locally: pending
    /// queued frames keep draining in the background for the close-grace
    /// period, after which an RST closes the stream on the wire.
    pub fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.recv.close();
        self.send.close(true);
        self.credits.close();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if self.shared.closed.load(Ordering::Acquire)
            || self.shared.remote_closed.load(Ordering::Acquire)
            || self.shared.failure.get().is_some()
        {
            return;
        }
        self.close();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("id", &self.shared.id)
            .field("closed", &self.shared.closed.load(Ordering::Relaxed))
            .finish()
    }
}
