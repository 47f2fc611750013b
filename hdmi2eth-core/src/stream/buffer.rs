//! Fixed-rate capture buffer with an explicit overflow policy.
//!
//! A capture source produces at its own pixel rate and cannot be paused,
//! so [`CaptureBuffer::push`] never waits. When the buffer is full the
//! configured [`OverflowPolicy`] decides which sample is lost; every loss
//! is counted and nothing is escalated.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::error::{Result, SocError};

/// A `warn` summary is logged every this many drops.
pub const DROP_WARN_INTERVAL: u64 = 1024;

/// What a full buffer does with a new sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the new sample.
    #[default]
    DropIncoming,
    /// Discard the oldest queued sample to make room.
    OverwriteOldest,
}

/// Bounded FIFO between a fixed-rate producer and a DMA consumer.
#[derive(Debug)]
pub struct CaptureBuffer<T> {
    name: String,
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    policy: OverflowPolicy,
    available: Notify,
    accepted: AtomicU64,
    drops: AtomicU64,
}

impl<T> CaptureBuffer<T> {
    pub fn new(name: &str, capacity: usize, policy: OverflowPolicy) -> Result<Self> {
        if capacity == 0 {
            return Err(SocError::InvalidConfig(format!(
                "capture buffer {name} needs a depth of at least one"
            )));
        }
        Ok(Self {
            name: name.to_string(),
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            policy,
            available: Notify::new(),
            accepted: AtomicU64::new(0),
            drops: AtomicU64::new(0),
        })
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer one sample. Returns whether `item` was stored.
    pub fn push(&self, item: T) -> bool {
        let (stored, dropped) = {
            let mut queue = self.lock();
            if queue.len() < self.capacity {
                queue.push_back(item);
                (true, false)
            } else {
                match self.policy {
                    OverflowPolicy::DropIncoming => (false, true),
                    OverflowPolicy::OverwriteOldest => {
                        queue.pop_front();
                        queue.push_back(item);
                        (true, true)
                    }
                }
            }
        };

        if stored {
            self.accepted.fetch_add(1, Ordering::Relaxed);
            self.available.notify_one();
        }
        if dropped {
            self.record_drop();
        }
        stored
    }

    /// Wait for the oldest sample.
    pub async fn pop(&self) -> T {
        loop {
            if let Some(item) = self.try_pop() {
                return item;
            }
            self.available.notified().await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.lock().pop_front()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Samples stored since construction.
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Samples lost to overflow since construction.
    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    fn record_drop(&self) {
        let drops = self.drops.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("{}: sample dropped ({drops} total)", self.name);
        if drops % DROP_WARN_INTERVAL == 0 {
            warn!("{}: {drops} samples dropped on overflow", self.name);
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────
