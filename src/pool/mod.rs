//! Bounded buffer pool shared by every stream on a connection.
//!
//! [`BufferPool`] hands out [`PooledBuffer`] handles. A handle holds one slot
//! of its stream's allowance and one slot of the connection-wide ceiling
//! until it is released or dropped. Submitting a buffer moves its slot into a
//! [`PoolSlot`] that the stream keeps until the peer acknowledges the
//! payload, so queued output counts against the same limits. Accounting lives
//! behind a mutex so handles may be filled and released from threads other
//! than the one driving dispatch.

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::{Bytes, BytesMut};
use log::{debug, error};

use crate::{error::AllocationError, message::StreamId};

#[derive(Debug, Default)]
struct PoolState {
    in_use: usize,
    per_stream: HashMap<StreamId, usize>,
    outstanding: HashMap<u64, StreamId>,
    next_token: u64,
}

/// Connection-wide allocator for outbound payload buffers.
#[derive(Clone)]
pub struct BufferPool {
    state: Arc<Mutex<PoolState>>,
    max_buffers: usize,
    per_stream_limit: usize,
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("in_use", &self.total_in_use())
            .field("max_buffers", &self.max_buffers)
            .field("per_stream_limit", &self.per_stream_limit)
            .finish()
    }
}

impl BufferPool {
    /// Create a pool allowing `max_buffers` outstanding buffers in total and
    /// `per_stream_limit` per stream.
    #[must_use]
    pub fn new(max_buffers: usize, per_stream_limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(PoolState::default())),
            max_buffers,
            per_stream_limit,
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire a buffer of `size` bytes for `stream`.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::TooLarge`] when `size` exceeds
    /// `max_msg_size`, [`AllocationError::StreamLimit`] when the stream holds
    /// its full allowance, and [`AllocationError::Exhausted`] when the
    /// connection-wide ceiling is reached.
    pub fn acquire(
        &self,
        stream: StreamId,
        size: usize,
        max_msg_size: usize,
    ) -> Result<PooledBuffer, AllocationError> {
        if size > max_msg_size {
            return Err(AllocationError::TooLarge {
                requested: size,
                limit: max_msg_size,
            });
        }

        let token = self.claim(stream)?;
        debug!("buffer acquired: stream={stream}, token={token}, size={size}");
        Ok(PooledBuffer {
            pool: self.clone(),
            token,
            stream,
            capacity: size,
            data: BytesMut::with_capacity(size),
            released: false,
        })
    }

    /// Reserve a slot for a payload submitted without a pooled buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::StreamLimit`] or
    /// [`AllocationError::Exhausted`] as [`BufferPool::acquire`] does.
    pub(crate) fn reserve(&self, stream: StreamId) -> Result<PoolSlot, AllocationError> {
        let token = self.claim(stream)?;
        debug!("slot reserved: stream={stream}, token={token}");
        Ok(PoolSlot {
            pool: self.clone(),
            token,
        })
    }

    fn claim(&self, stream: StreamId) -> Result<u64, AllocationError> {
        let mut state = self.lock();
        let used = state.per_stream.get(&stream).copied().unwrap_or(0);
        if used >= self.per_stream_limit {
            return Err(AllocationError::StreamLimit {
                stream,
                limit: self.per_stream_limit,
            });
        }
        if state.in_use >= self.max_buffers {
            return Err(AllocationError::Exhausted {
                limit: self.max_buffers,
            });
        }

        let token = state.next_token;
        state.next_token += 1;
        state.in_use += 1;
        *state.per_stream.entry(stream).or_insert(0) += 1;
        state.outstanding.insert(token, stream);
        Ok(token)
    }

    /// Return a buffer to the pool.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::ForeignBuffer`] if the buffer came from a
    /// different pool and [`AllocationError::DoubleRelease`] if its slot was
    /// already returned.
    pub fn release(&self, buffer: PooledBuffer) -> Result<(), AllocationError> {
        if !buffer.belongs_to(self) {
            return Err(AllocationError::ForeignBuffer);
        }
        buffer.release()
    }

    /// Buffers currently outstanding for `stream`.
    #[must_use]
    pub fn usage(&self, stream: StreamId) -> usize {
        self.lock().per_stream.get(&stream).copied().unwrap_or(0)
    }

    /// Buffers currently outstanding across the connection.
    #[must_use]
    pub fn total_in_use(&self) -> usize { self.lock().in_use }

    pub(crate) fn release_token(&self, token: u64) -> Result<(), AllocationError> {
        let mut state = self.lock();
        let Some(stream) = state.outstanding.remove(&token) else {
            drop(state);
            error!("buffer released twice: token={token}");
            return Err(AllocationError::DoubleRelease { token });
        };
        state.in_use = state.in_use.saturating_sub(1);
        if let Some(count) = state.per_stream.get_mut(&stream) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.per_stream.remove(&stream);
            }
        }
        drop(state);
        debug!("buffer released: stream={stream}, token={token}");
        Ok(())
    }
}

impl BufferPool {
    /// Testing helper that releases a slot by token, bypassing the handle.
    #[doc(hidden)]
    pub fn release_token_for_tests(&self, token: u64) -> Result<(), AllocationError> {
        self.release_token(token)
    }
}

/// Owning handle for one pooled buffer.
///
/// Dropping the handle returns its slot to the pool.
pub struct PooledBuffer {
    pool: BufferPool,
    token: u64,
    stream: StreamId,
    capacity: usize,
    data: BytesMut,
    released: bool,
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("stream", &self.stream)
            .field("token", &self.token)
            .field("len", &self.data.len())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

impl PooledBuffer {
    /// Stream the buffer was acquired for.
    #[must_use]
    pub fn stream_id(&self) -> StreamId { self.stream }

    /// Size requested at acquisition; writes beyond it are refused.
    #[must_use]
    pub fn capacity(&self) -> usize { self.capacity }

    /// Pool-assigned identifier of this buffer.
    #[must_use]
    pub fn token(&self) -> u64 { self.token }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize { self.data.len() }

    /// Whether nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.data.is_empty() }

    /// Borrow the written bytes.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] { &self.data }

    /// Append `bytes` to the buffer.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::TooLarge`] if the write would exceed the
    /// buffer's capacity. Nothing is written in that case.
    pub fn put_slice(&mut self, bytes: &[u8]) -> Result<(), AllocationError> {
        let requested = self.data.len() + bytes.len();
        if requested > self.capacity {
            return Err(AllocationError::TooLarge {
                requested,
                limit: self.capacity,
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Return the buffer's slot to its pool.
    ///
    /// # Errors
    ///
    /// Returns [`AllocationError::DoubleRelease`] if the pool no longer
    /// tracks this buffer.
    pub fn release(mut self) -> Result<(), AllocationError> {
        self.released = true;
        self.pool.release_token(self.token)
    }

    pub(crate) fn belongs_to(&self, pool: &BufferPool) -> bool {
        Arc::ptr_eq(&self.pool.state, &pool.state)
    }

    /// Take the written bytes together with the slot they occupy.
    pub(crate) fn into_parts(mut self) -> (Bytes, PoolSlot) {
        self.released = true;
        let slot = PoolSlot {
            pool: self.pool.clone(),
            token: self.token,
        };
        (std::mem::take(&mut self.data).freeze(), slot)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            let _ = self.pool.release_token(self.token);
        }
    }
}

/// Pool slot held by a submitted payload until the peer acknowledges it.
///
/// Dropping the slot returns it to the pool.
#[derive(Debug)]
pub(crate) struct PoolSlot {
    pool: BufferPool,
    token: u64,
}

impl Drop for PoolSlot {
    fn drop(&mut self) { let _ = self.pool.release_token(self.token); }
}
