//! Reusable byte buffers bucketed by requested length.
//!
//! The pipeline draws every intermediate buffer from a [`BufferPool`] and
//! hands it back as soon as the next stage has consumed it. Buffers are not
//! zeroed between uses: an acquired buffer is empty (`len() == 0`) but its
//! spare capacity still holds whatever the previous user wrote.

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

use tracing::{debug, info, trace};

/// Length used when a caller asks for a buffer of length 0.
pub const DEFAULT_BUFFER_LEN: usize = 1024;

/// Idle buffers kept per bucket. Extra releases are discarded.
pub const DEFAULT_BUCKET_CAPACITY: usize = 10;

/// A byte buffer on loan from a [`BufferPool`].
///
/// Derefs to `Vec<u8>` so stages can write into it directly. Remembers the
/// bucket it came from so it can be returned even if a stage grew it.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    bucket: usize,
}

impl PooledBuffer {
    /// Wrap a buffer that was not acquired from a pool. Releasing it into a
    /// pool only succeeds if that pool happens to track a bucket of the
    /// same capacity.
    pub fn from_vec(data: Vec<u8>) -> Self {
        let bucket = data.capacity();
        Self { data, bucket }
    }

    /// The bucket key this buffer is returned to.
    pub fn bucket(&self) -> usize {
        self.bucket
    }

    /// Give up the pooled identity and keep the bytes.
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.data
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

/// Thread-safe pool of byte buffers keyed by requested length.
///
/// Any thread may release a buffer that another thread acquired.
pub struct BufferPool {
    default_len: usize,
    bucket_capacity: usize,
    buckets: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
}

impl BufferPool {
    /// Create a pool. `default_len` is used for `acquire(0)`.
    pub fn new(default_len: usize, bucket_capacity: usize) -> Self {
        Self {
            default_len: default_len.max(1),
            bucket_capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take an empty buffer with capacity of at least `len` bytes
    /// (`len == 0` means the pool's default length).
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        let bucket = if len > 0 { len } else { self.default_len };

        let recycled = {
            let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);
            buckets.entry(bucket).or_default().pop()
        };

        let data = match recycled {
            Some(mut data) => {
                trace!(bucket, "reusing pooled buffer");
                data.clear();
                data
            }
            None => {
                debug!(bucket, "bucket empty: allocating buffer");
                Vec::with_capacity(bucket)
            }
        };

        PooledBuffer { data, bucket }
    }

    /// Return a buffer to its bucket.
    ///
    /// A buffer whose bucket this pool never created is dropped with a log
    /// line; a full bucket discards the buffer.
    pub fn release(&self, buffer: PooledBuffer) {
        let PooledBuffer { data, bucket } = buffer;
        let mut buckets = self.buckets.lock().unwrap_or_else(PoisonError::into_inner);

        match buckets.get_mut(&bucket) {
            Some(idle) if idle.len() < self.bucket_capacity => {
                trace!(bucket, "returning buffer to pool");
                idle.push(data);
            }
            Some(_) => debug!(bucket, "bucket full: discarding returned buffer"),
            None => info!(bucket, "no bucket for released buffer, dropping it"),
        }
    }

    /// Number of idle buffers currently held for `len`.
    pub fn idle_count(&self, len: usize) -> usize {
        let bucket = if len > 0 { len } else { self.default_len };
        self.buckets
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&bucket)
            .map_or(0, Vec::len)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_LEN, DEFAULT_BUCKET_CAPACITY)
    }
}
