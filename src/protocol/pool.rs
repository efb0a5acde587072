//! Reusable pool of frame-sized buffers.
//!
//! Every DATA frame, inbound or outbound, lives in a buffer drawn from a
//! [`BufferPool`]. Buffers are handed out as [`PooledBuf`] values that
//! return their storage to the pool when dropped, so each buffer goes back
//! exactly once no matter which task finishes with it. ACK and RST words
//! are stack arrays and never touch the pool.

use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use super::frame::MAX_FRAME_LEN;

/// A pool of reusable buffers, each with exact max-frame capacity.
///
/// Cheaply cloneable; clones share the same free list.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    free: Mutex<Vec<BytesMut>>,
    max_idle: usize,
}

impl BufferPool {
    /// Create a pool that retains up to `max_idle` buffers for reuse.
    ///
    /// Buffers beyond the retention limit are simply freed on return.
    pub fn new(max_idle: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                free: Mutex::new(Vec::with_capacity(max_idle.min(64))),
                max_idle,
            }),
        }
    }

    /// Draw an empty buffer with `MAX_FRAME_LEN` capacity.
    pub fn acquire(&self) -> PooledBuf {
        let buf = self
            .inner
            .free
            .lock()
            .expect("buffer pool poisoned")
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(MAX_FRAME_LEN));
        PooledBuf {
            buf: Some(buf),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Number of idle buffers currently held for reuse.
    pub fn idle(&self) -> usize {
        self.inner.free.lock().expect("buffer pool poisoned").len()
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("idle", &self.idle())
            .field("max_idle", &self.inner.max_idle)
            .finish()
    }
}

/// A frame buffer on loan from a [`BufferPool`].
///
/// Dereferences to `BytesMut`; storage returns to the pool on drop.
pub struct PooledBuf {
    buf: Option<BytesMut>,
    pool: Arc<PoolInner>,
}

impl Deref for PooledBuf {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("pooled buffer already released")
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("pooled buffer already released")
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        let Some(mut buf) = self.buf.take() else {
            return;
        };
        buf.clear();
        // Sliced-down buffers can lose capacity; only full-size ones are
        // worth keeping.
        if buf.capacity() < MAX_FRAME_LEN {
            return;
        }
        let mut free = self.pool.free.lock().expect("buffer pool poisoned");
        if free.len() < self.pool.max_idle {
            free.push(buf);
        }
    }
}

impl std::fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.buf.as_ref().map(|b| b.len()))
            .finish()
    }
}
