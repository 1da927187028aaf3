//! Fixed-capacity pool of exclusively owned resources.
//!
//! `acquire` blocks until a resource is idle; the returned [`Pooled`] guard
//! gives the resource back when released or dropped, so a resource is never
//! handed to two callers at once. Waiters are woken in no particular order.
//!
//! Closing marks the pool closed, wakes all waiters (they get
//! [`Error::PoolClosed`]) and closes every idle resource. Resources that are
//! checked out at that moment are closed when their guard is released.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::error::{Error, Result};

pub const DEFAULT_CAPACITY: usize = 4;

/// A resource that must be shut down explicitly.
pub trait Close {
    type Error: fmt::Display;

    fn close(&mut self) -> std::result::Result<(), Self::Error>;
}

struct Slots<T> {
    idle: VecDeque<T>,
    closed: bool,
}

pub struct Pool<T: Close> {
    slots: Mutex<Slots<T>>,
    available: Condvar,
    capacity: usize,
}

impl<T: Close> Pool<T> {
    /// Creates all `capacity` resources up front. If any creation fails the
    /// ones already created are closed and the error is returned.
    pub fn build<F>(capacity: usize, mut create: F) -> Result<Self>
    where
        F: FnMut() -> Result<T>,
    {
        if capacity == 0 {
            return Err(Error::InvalidCapacity);
        }
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            match create() {
                Ok(item) => idle.push_back(item),
                Err(err) => {
                    for mut item in idle {
                        if let Err(close_err) = item.close() {
                            warn!(error = %close_err, "failed to close resource of abandoned pool");
                        }
                    }
                    return Err(err);
                }
            }
        }
        debug!(capacity, "pool built");
        Ok(Self {
            slots: Mutex::new(Slots {
                idle,
                closed: false,
            }),
            available: Condvar::new(),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle(&self) -> usize {
        self.slots.lock().idle.len()
    }

    pub fn is_closed(&self) -> bool {
        self.slots.lock().closed
    }

    /// Blocks until a resource is idle. There is no timeout.
    pub fn acquire(&self) -> Result<Pooled<'_, T>> {
        let mut slots = self.slots.lock();
        loop {
            if slots.closed {
                return Err(Error::PoolClosed);
            }
            if let Some(item) = slots.idle.pop_front() {
                return Ok(Pooled {
                    pool: self,
                    item: Some(item),
                });
            }
            self.available.wait(&mut slots);
        }
    }

    fn put(&self, mut item: T) {
        let mut slots = self.slots.lock();
        if slots.closed {
            drop(slots);
            if let Err(err) = item.close() {
                warn!(error = %err, "failed to close resource released after pool close");
            }
            return;
        }
        slots.idle.push_back(item);
        drop(slots);
        self.available.notify_one();
    }

    /// Closes every idle resource, continuing past failures. Returns one
    /// error listing all failures. Closing an already closed pool is a no-op.
    pub fn close(&self) -> Result<()> {
        let drained: Vec<T> = {
            let mut slots = self.slots.lock();
            if slots.closed {
                return Ok(());
            }
            slots.closed = true;
            slots.idle.drain(..).collect()
        };
        self.available.notify_all();

        let total = drained.len();
        let mut failures = Vec::new();
        for mut item in drained {
            if let Err(err) = item.close() {
                failures.push(err.to_string());
            }
        }
        debug!(closed = total, failed = failures.len(), "pool closed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::PoolClose { failures })
        }
    }
}

impl<T: Close> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slots = self.slots.lock();
        f.debug_struct("Pool")
            .field("capacity", &self.capacity)
            .field("idle", &slots.idle.len())
            .field("closed", &slots.closed)
            .finish()
    }
}

/// Exclusive access to one pooled resource.
pub struct Pooled<'a, T: Close> {
    pool: &'a Pool<T>,
    item: Option<T>,
}

impl<T: Close> Pooled<'_, T> {
    /// Hands the resource back to its pool. Dropping the guard does the same.
    pub fn release(self) {}
}

impl<T: Close> Deref for Pooled<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pooled item is present until drop")
    }
}

impl<T: Close> DerefMut for Pooled<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pooled item is present until drop")
    }
}

impl<T: Close> Drop for Pooled<'_, T> {
    fn drop(&mut self) {
        if let Some(item) = self.item.take() {
            self.pool.put(item);
        }
    }
}
