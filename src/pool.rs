//! Fixed-capacity object pools
//!
//! Provisioning contexts and I/O scratch buffers are pre-allocated at init and
//! recycled through a bounded free list, so the write path never allocates.
//! `Pool::get` hands out a [`Pooled`] guard that owns the object; dropping the
//! guard puts the object back. A slot therefore cannot be returned twice or
//! used after it has been returned.
//!
//! Exhaustion is not fatal: `get` returns `Error::PoolExhausted` and the
//! caller decides whether to back off and retry.

use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crossbeam::queue::ArrayQueue;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Error, Result};

/// Which pool an object comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PoolKind {
    /// Provisioning contexts handed out by `allocate`
    ProvisioningContext,
    /// DMA-capable scratch buffers for device I/O
    IoScratch,
}

impl fmt::Display for PoolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolKind::ProvisioningContext => write!(f, "provisioning-context"),
            PoolKind::IoScratch => write!(f, "io-scratch"),
        }
    }
}

/// A bounded pool of pre-built objects.
pub struct Pool<T> {
    kind: PoolKind,
    free: ArrayQueue<T>,
}

impl<T> Pool<T> {
    /// Build a pool holding `capacity` objects produced by `init`.
    ///
    /// If `init` fails part-way, the objects built so far are dropped before
    /// the error is returned.
    pub fn new<F>(kind: PoolKind, capacity: usize, mut init: F) -> Result<Arc<Self>>
    where
        F: FnMut(usize) -> Result<T>,
    {
        if capacity == 0 {
            return Err(Error::Config(format!("{} pool capacity must be > 0", kind)));
        }

        let free = ArrayQueue::new(capacity);
        for i in 0..capacity {
            let item = init(i)?;
            if free.push(item).is_err() {
                return Err(Error::Internal(format!("{} pool overfilled", kind)));
            }
        }

        Ok(Arc::new(Self { kind, free }))
    }

    /// Take an object out of the pool.
    pub fn get(self: &Arc<Self>) -> Result<Pooled<T>> {
        self.try_get()
            .ok_or(Error::PoolExhausted { kind: self.kind })
    }

    /// Take an object out of the pool, or `None` when every slot is in use.
    pub fn try_get(self: &Arc<Self>) -> Option<Pooled<T>> {
        self.free.pop().map(|item| Pooled {
            item: Some(item),
            pool: Arc::clone(self),
        })
    }

    /// Kind of objects in this pool.
    pub fn kind(&self) -> PoolKind {
        self.kind
    }

    /// Total number of slots.
    pub fn capacity(&self) -> usize {
        self.free.capacity()
    }

    /// Slots currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Slots currently handed out.
    pub fn in_use(&self) -> usize {
        self.capacity() - self.available()
    }

    fn put(&self, item: T) {
        if self.free.push(item).is_err() {
            // Only objects that came out of this pool come back, so the
            // queue cannot be full here.
            warn!(pool = %self.kind, "returned object does not fit the pool, dropping it");
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("kind", &self.kind)
            .field("capacity", &self.capacity())
            .field("available", &self.available())
            .finish()
    }
}

/// An object borrowed from a [`Pool`]; returns to the pool on drop.
pub struct Pooled<T> {
    item: Option<T>,
    pool: Arc<Pool<T>>,
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // `item` is only taken in `drop`
        match &self.item {
            Some(item) => item,
            None => unreachable!("pooled object accessed after release"),
        }
    }
}

impl<T> DerefMut for Pooled<T> {
    fn deref_mut(&mut self) -> &mut T {
        match &mut self.item {
            Some(item) => item,
            None => unreachable!("pooled object accessed after release"),
        }
    }
}

impl<T> Drop for Pooled<T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Pooled<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("kind", &self.pool.kind)
            .field("item", &self.item)
            .finish()
    }
}
