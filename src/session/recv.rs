//! Per-stream receive buffer.
//!
//! Inbound DATA frames for a stream are queued on a bounded channel whose
//! capacity is the transmit window. A conforming peer never has more than
//! `window` un-ACKed frames in flight, so submission never blocks; a full
//! queue is a window overrun and fails the session.
//!
//! The reader copies out of the frame at the front of the queue and emits
//! one ACK each time it advances to the next frame, which is what lets the
//! peer send one more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::time::{timeout_at, Instant};

use crate::error::{MuxError, Result};
use crate::protocol::frame::FRAME_HEADER_LEN;
use crate::protocol::pool::PooledBuf;
use crate::session::Outbound;

/// Build the two halves of a stream's receive buffer.
pub(crate) fn receive_buffer(
    id: u32,
    window: usize,
    out: mpsc::Sender<Outbound>,
) -> (RecvHandle, RecvReader) {
    let (in_tx, in_rx) = mpsc::channel(window);
    let shared = Arc::new(RecvShared {
        in_tx: Mutex::new(Some(in_tx)),
        closed: AtomicBool::new(false),
    });
    let handle = RecvHandle {
        shared: Arc::clone(&shared),
    };
    let reader = RecvReader {
        id,
        in_rx,
        current: None,
        out,
        shared,
    };
    (handle, reader)
}

struct RecvShared {
    /// Taken (and dropped) on close so the reader drains buffered frames
    /// and then sees end-of-stream, and late submissions are discarded.
    in_tx: Mutex<Option<mpsc::Sender<PooledBuf>>>,
    closed: AtomicBool,
}

/// Submission side, used by the session read loop.
#[derive(Clone)]
pub(crate) struct RecvHandle {
    shared: Arc<RecvShared>,
}

impl RecvHandle {
    /// Queue an inbound DATA frame for the reader.
    ///
    /// Frames submitted after close are dropped (their buffers go back to
    /// the pool). A full queue means the peer overran the window.
    pub(crate) fn submit(&self, frame: PooledBuf) -> Result<()> {
        let guard = self.shared.in_tx.lock().expect("receive buffer poisoned");
        let Some(in_tx) = guard.as_ref() else {
            return Ok(());
        };
        match in_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(MuxError::Protocol(
                "peer overran the receive window".to_string(),
            )),
            Err(TrySendError::Closed(_)) => Ok(()),
        }
    }

    /// Refuse further submissions and signal end-of-stream to the reader
    /// once buffered frames are drained. Idempotent. No ACKs are emitted
    /// after this.
    pub(crate) fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.shared
            .in_tx
            .lock()
            .expect("receive buffer poisoned")
            .take();
    }
}

/// Consumer side, owned by the stream.
pub(crate) struct RecvReader {
    id: u32,
    in_rx: mpsc::Receiver<PooledBuf>,
    current: Option<Cursor>,
    out: mpsc::Sender<Outbound>,
    shared: Arc<RecvShared>,
}

/// The frame being consumed and how far into its payload we are.
struct Cursor {
    frame: PooledBuf,
    off: usize,
}

impl RecvReader {
    /// Copy as many buffered bytes as fit into `dest`.
    ///
    /// Returns as soon as at least one byte was copied and nothing more is
    /// immediately available. With nothing buffered, waits for a frame, the
    /// deadline, or end-of-stream; `Ok(0)` means end-of-stream.
    pub(crate) async fn read(
        &mut self,
        dest: &mut [u8],
        deadline: Option<Instant>,
    ) -> Result<usize> {
        if dest.is_empty() {
            return Ok(0);
        }
        let mut total = 0;
        loop {
            if let Some(cursor) = &mut self.current {
                let payload = &cursor.frame[FRAME_HEADER_LEN + cursor.off..];
                let n = payload.len().min(dest.len() - total);
                dest[total..total + n].copy_from_slice(&payload[..n]);
                cursor.off += n;
                total += n;
                if FRAME_HEADER_LEN + cursor.off == cursor.frame.len() {
                    // Fully consumed; the buffer goes back to the pool.
                    self.current = None;
                }
                if total == dest.len() {
                    return Ok(total);
                }
            }

            match self.in_rx.try_recv() {
                Ok(frame) => self.advance(frame).await,
                Err(TryRecvError::Disconnected) => return Ok(total),
                Err(TryRecvError::Empty) => {
                    if total > 0 {
                        return Ok(total);
                    }
                    match self.wait_for_frame(deadline).await? {
                        Some(frame) => self.advance(frame).await,
                        None => return Ok(0),
                    }
                }
            }
        }
    }

    async fn wait_for_frame(&mut self, deadline: Option<Instant>) -> Result<Option<PooledBuf>> {
        match deadline {
            Some(deadline) => match timeout_at(deadline, self.in_rx.recv()).await {
                Ok(frame) => Ok(frame),
                Err(_) => Err(MuxError::Timeout),
            },
            None => Ok(self.in_rx.recv().await),
        }
    }

    /// Move the next frame into the current slot and ACK it, releasing one
    /// window slot to the peer. Closed streams stop ACKing.
    async fn advance(&mut self, frame: PooledBuf) {
        self.current = Some(Cursor { frame, off: 0 });
        if !self.shared.closed.load(Ordering::Acquire) {
            let _ = self.out.send(Outbound::Ack { id: self.id }).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::pool::BufferPool;
    use std::time::Duration;

    fn data_frame(pool: &BufferPool, payload: &[u8]) -> PooledBuf {
        let mut buf = pool.acquire();
        buf.resize(FRAME_HEADER_LEN, 0);
        buf.extend_from_slice(payload);
        buf
    }

    fn drain_acks(out_rx: &mut mpsc::Receiver<Outbound>) -> usize {
        let mut acks = 0;
        while let Ok(outbound) = out_rx.try_recv() {
            assert!(matches!(outbound, Outbound::Ack { .. }));
            acks += 1;
        }
        acks
    }

    #[tokio::test]
    async fn read_spans_frames_and_acks_each() {
        let pool = BufferPool::new(8);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (handle, mut reader) = receive_buffer(3, 5, out_tx);

        handle.submit(data_frame(&pool, b"0")).unwrap();
        handle.submit(data_frame(&pool, b"1")).unwrap();

        let mut dest = [0u8; 2];
        let n = reader.read(&mut dest, None).await.unwrap();
        assert_eq!(n, 2);
        assert_eq!(&dest, b"01");

        assert_eq!(drain_acks(&mut out_rx), 2);
        assert_eq!(pool.idle(), 2, "both consumed frames must return to the pool");
    }

    #[tokio::test]
    async fn short_read_returns_what_is_buffered() {
        let pool = BufferPool::new(8);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (handle, mut reader) = receive_buffer(1, 5, out_tx);

        handle.submit(data_frame(&pool, b"hello")).unwrap();

        let mut dest = [0u8; 64];
        let n = reader.read(&mut dest, None).await.unwrap();
        assert_eq!(&dest[..n], b"hello");
    }

    #[tokio::test]
    async fn partial_consume_keeps_cursor() {
        let pool = BufferPool::new(8);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (handle, mut reader) = receive_buffer(1, 5, out_tx);

        handle.submit(data_frame(&pool, b"abcdef")).unwrap();

        let mut dest = [0u8; 4];
        assert_eq!(reader.read(&mut dest, None).await.unwrap(), 4);
        assert_eq!(&dest, b"abcd");
        assert_eq!(pool.idle(), 0, "frame still in the current slot");

        assert_eq!(reader.read(&mut dest, None).await.unwrap(), 2);
        assert_eq!(&dest[..2], b"ef");
        assert_eq!(pool.idle(), 1);
        assert_eq!(drain_acks(&mut out_rx), 1, "one ACK per frame, not per read");
    }

    #[tokio::test]
    async fn deadline_expires_with_timeout() {
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (_handle, mut reader) = receive_buffer(1, 5, out_tx);

        let mut dest = [0u8; 4];
        let deadline = Instant::now() + Duration::from_millis(20);
        let started = Instant::now();
        let err = reader.read(&mut dest, Some(deadline)).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[tokio::test]
    async fn close_drains_then_signals_end_of_stream() {
        let pool = BufferPool::new(8);
        let (out_tx, mut out_rx) = mpsc::channel(16);
        let (handle, mut reader) = receive_buffer(1, 5, out_tx);

        handle.submit(data_frame(&pool, b"tail")).unwrap();
        handle.close();
        handle.close();

        // Buffered data is still delivered, but no ACK follows it.
        let mut dest = [0u8; 8];
        assert_eq!(reader.read(&mut dest, None).await.unwrap(), 4);
        assert_eq!(&dest[..4], b"tail");
        assert_eq!(drain_acks(&mut out_rx), 0);

        assert_eq!(reader.read(&mut dest, None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn submissions_after_close_are_dropped() {
        let pool = BufferPool::new(8);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (handle, _reader) = receive_buffer(1, 5, out_tx);

        handle.close();
        handle.submit(data_frame(&pool, b"late")).unwrap();
        assert_eq!(pool.idle(), 1, "dropped frame must return to the pool");
    }

    #[tokio::test]
    async fn overrun_is_a_protocol_violation() {
        let pool = BufferPool::new(8);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (handle, _reader) = receive_buffer(1, 2, out_tx);

        handle.submit(data_frame(&pool, b"a")).unwrap();
        handle.submit(data_frame(&pool, b"b")).unwrap();
        let err = handle.submit(data_frame(&pool, b"c")).unwrap_err();
        assert!(matches!(err, MuxError::Protocol(_)));
    }

    #[tokio::test]
    async fn blocked_read_wakes_on_submit() {
        let pool = BufferPool::new(8);
        let (out_tx, _out_rx) = mpsc::channel(16);
        let (handle, mut reader) = receive_buffer(1, 5, out_tx);

        let frame = data_frame(&pool, b"wake");
        let submitter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            handle.submit(frame).unwrap();
        });

        let mut dest = [0u8; 8];
        let n = reader.read(&mut dest, None).await.unwrap();
        assert_eq!(&dest[..n], b"wake");
        submitter.await.unwrap();
    }
}
