// Copyright 2025 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use std::collections::TryReserveError;
use std::collections::VecDeque;
use std::ops::Deref;
use std::ops::DerefMut;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::Weak;

type Buffers<T> = Mutex<VecDeque<Vec<T>>>;

/// A buffer borrowed from a `BufferPool`. It goes back to its pool when dropped, unless the pool
/// has been resized or destroyed in the meantime.
#[derive(Debug)]
pub struct PooledBuffer<T> {
    inner: Option<Vec<T>>,
    pool: Weak<Buffers<T>>,
}

impl<T> Deref for PooledBuffer<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.inner.as_deref().unwrap_or_default()
    }
}

impl<T> DerefMut for PooledBuffer<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.inner.as_deref_mut().unwrap_or_default()
    }
}

impl<T> Drop for PooledBuffer<T> {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.upgrade(), self.inner.take()) {
            pool.lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_back(buffer);
        }
    }
}

/// Pool of equally-sized buffers, used for the per-picture tables whose size only depends on
/// the picture geometry.
pub struct BufferPool<T: Clone + Default> {
    len: usize,
    pool: Arc<Buffers<T>>,
}

impl<T: Clone + Default> BufferPool<T> {
    pub fn new(len: usize) -> Self {
        Self {
            len,
            pool: Default::default(),
        }
    }

    /// Number of elements of the buffers handed out by this pool.
    pub fn buffer_len(&self) -> usize {
        self.len
    }

    /// Changes the size of the buffers. Buffers currently in use are freed instead of being
    /// returned to the pool.
    pub fn resize(&mut self, len: usize) {
        if len != self.len {
            log::debug!("Resizing buffer pool from {} to {} elements", self.len, len);
            *self = Self::new(len);
        }
    }

    /// Returns a buffer with all its elements set to their default value, recycling a previous
    /// one if possible.
    pub fn alloc(&self) -> Result<PooledBuffer<T>, TryReserveError> {
        let recycled = self
            .pool
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();

        let buffer = match recycled {
            Some(mut buffer) => {
                buffer.fill(T::default());
                buffer
            }
            None => {
                let mut buffer = Vec::new();
                buffer.try_reserve_exact(self.len)?;
                buffer.resize(self.len, T::default());
                buffer
            }
        };

        Ok(PooledBuffer {
            inner: Some(buffer),
            pool: Arc::downgrade(&self.pool),
        })
    }

    /// Number of buffers currently waiting in the pool.
    pub fn num_free(&self) -> usize {
        self.pool.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
