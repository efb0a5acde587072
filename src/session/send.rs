//! Per-stream send buffer.
//!
//! Outbound frames for a stream pass through a bounded queue served by a
//! dedicated loop that forwards them, in order, to the session's write
//! loop. Flow-control credits are a semaphore seeded with `window`
//! permits: a write takes one permit per frame before enqueueing, and each
//! ACK from the peer restores one, so at most `window` un-ACKed frames are
//! ever in flight.
//!
//! Closing is a one-shot request carrying whether an RST should follow.
//! The loop stops accepting new frames, keeps draining what is already
//! queued until the grace deadline, then emits the RST (if requested) and
//! discards the rest.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};

use crate::protocol::pool::PooledBuf;
use crate::session::Outbound;

/// Placeholder deadline while no close has been requested.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365);

/// Build a stream's send buffer and spawn its loop.
///
/// Returns the close handle, the frame queue the stream writes into, and
/// the credit semaphore (pre-seeded with `window` permits).
pub(crate) fn send_buffer(
    id: u32,
    window: usize,
    out: mpsc::Sender<Outbound>,
    close_grace: Duration,
) -> (SendHandle, mpsc::Sender<PooledBuf>, Arc<Semaphore>) {
    let (frame_tx, frame_rx) = mpsc::channel(window);
    let (close_tx, close_rx) = mpsc::channel(1);
    let credits = Arc::new(Semaphore::new(window));
    tokio::spawn(send_loop(id, frame_rx, close_rx, out, close_grace));
    let handle = SendHandle {
        requested: Arc::new(AtomicBool::new(false)),
        close_tx,
    };
    (handle, frame_tx, credits)
}

/// Close side of a send buffer.
#[derive(Clone)]
pub(crate) struct SendHandle {
    requested: Arc<AtomicBool>,
    close_tx: mpsc::Sender<bool>,
}

impl SendHandle {
    /// Request the send loop to wind down. Only the first call takes
    /// effect; `send_rst` says whether an RST should close out the stream
    /// on the wire.
    pub(crate) fn close(&self, send_rst: bool) {
        if self.requested.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.close_tx.try_send(send_rst);
    }
}

async fn send_loop(
    id: u32,
    mut frame_rx: mpsc::Receiver<PooledBuf>,
    mut close_rx: mpsc::Receiver<bool>,
    out: mpsc::Sender<Outbound>,
    close_grace: Duration,
) {
    let mut send_rst = false;
    let mut closing = false;
    let grace = tokio::time::sleep(FAR_FUTURE);
    tokio::pin!(grace);

    loop {
        tokio::select! {
            // Close requests take priority over queued frames so the grace
            // clock starts counting from the request, not from whenever the
            // queue happens to drain.
            biased;
            request = close_rx.recv(), if !closing => {
                closing = true;
                send_rst = request.unwrap_or(false);
                frame_rx.close();
                grace
                    .as_mut()
                    .reset(tokio::time::Instant::now() + close_grace);
            }
            _ = &mut grace, if closing => break,
            frame = frame_rx.recv() => match frame {
                Some(frame) => {
                    let forward = out.send(Outbound::Data { id, frame });
                    if closing {
                        match tokio::time::timeout_at(grace.deadline(), forward).await {
                            Ok(Ok(())) => {}
                            // Session write loop is gone; nothing reaches
                            // the wire anymore, RST included.
                            Ok(Err(_)) => return,
                            Err(_) => break,
                        }
                    } else if forward.await.is_err() {
                        return;
                    }
                }
                // Queue closed and fully drained.
                None => break,
            },
        }
    }

    if send_rst {
        let _ = out.send(Outbound::Rst { id }).await;
    }

    // Discard whatever the grace period did not drain.
    while frame_rx.try_recv().is_ok() {}
}
