//! A resizable counting semaphore bounding simultaneous checks.
//!
//! The capacity follows `max_concurrent_checks`, which can change through a
//! hot reload. Resizing swaps in a fresh semaphore: permits already handed out
//! keep draining against the old one, while waiters parked on the old
//! semaphore are woken (it gets closed) and re-queue on the new one.

use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// A slot held in a [`ConcurrencyLimiter`]. Dropping it releases the slot,
/// so every exit path (including cancellation) gives the slot back.
#[derive(Debug)]
pub struct LimiterPermit {
    _permit: OwnedSemaphorePermit,
}

impl LimiterPermit {
    /// Explicitly returns the slot. Equivalent to dropping the permit.
    pub fn release(self) {}
}

#[derive(Debug)]
pub struct ConcurrencyLimiter {
    name: &'static str,
    semaphore: ArcSwap<Semaphore>,
    capacity: AtomicUsize,
    // Held across the capacity and semaphore swaps so both always agree.
    resize_lock: Mutex<()>,
}

impl ConcurrencyLimiter {
    /// Creates a limiter with `capacity` slots. A capacity of zero would
    /// block forever and is clamped to one.
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            name,
            semaphore: ArcSwap::from_pointee(Semaphore::new(capacity)),
            capacity: AtomicUsize::new(capacity),
            resize_lock: Mutex::new(()),
        }
    }

    /// Waits until a slot is free and takes it.
    pub async fn acquire(&self) -> LimiterPermit {
        loop {
            let semaphore = self.semaphore.load_full();
            // Only a semaphore retired by `resize` is ever closed.
            if let Ok(permit) = semaphore.acquire_owned().await {
                return LimiterPermit { _permit: permit };
            }
        }
    }

    /// Replaces the capacity for subsequent acquisitions. Returns `false`
    /// when the capacity is unchanged and nothing was swapped.
    pub fn resize(&self, capacity: usize) -> bool {
        let capacity = capacity.max(1);
        let _guard = self.resize_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = self.capacity.swap(capacity, Ordering::SeqCst);
        if previous == capacity {
            return false;
        }
        let retired = self.semaphore.swap(Arc::new(Semaphore::new(capacity)));
        retired.close();
        debug!(limiter = self.name, previous, capacity, "Resized concurrency limiter");
        true
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::SeqCst)
    }

    /// Free slots on the current semaphore.
    pub fn available(&self) -> usize {
        self.semaphore.load().available_permits()
    }
}
