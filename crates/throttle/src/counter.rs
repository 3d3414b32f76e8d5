//! Per-direction traffic accounting for the current analysis window.
//!
//! Collaborators report every completed operation through
//! [`TrafficCounter::record`], which may be called from any number of threads
//! at once. The owning analyzer drains the window once per analysis period with
//! [`TrafficCounter::snapshot_and_reset`].
//!
//! # Lock-free window swap
//!
//! The counters of the in-progress window live in a [`WindowCell`] behind an
//! [`ArcSwap`]. Recording loads the current cell and adds to it with atomic
//! operations. Taking a snapshot swaps a fresh cell in and then waits until the
//! last recorder still holding the retired cell has released it. From that point
//! the retired cell is owned exclusively and its totals are final, so every
//! recorded byte lands in exactly one window.

use std::hint;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use arc_swap::ArcSwap;

/// Spins before yielding while a retired window is still held by recorders.
const DRAIN_SPIN_LIMIT: u32 = 64;

/// Bytes and requests accumulated during one analysis window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Window {
    pub success_bytes: u64,
    pub failed_bytes: u64,
    pub success_requests: u64,
    pub failed_requests: u64,
}

impl Window {
    pub fn total_bytes(&self) -> u64 {
        self.success_bytes.saturating_add(self.failed_bytes)
    }

    pub fn total_requests(&self) -> u64 {
        self.success_requests.saturating_add(self.failed_requests)
    }

    /// True when nothing at all was recorded in the window.
    pub fn is_empty(&self) -> bool {
        self.total_bytes() == 0 && self.total_requests() == 0
    }
}

#[derive(Debug, Default)]
struct WindowCell {
    success_bytes: AtomicU64,
    failed_bytes: AtomicU64,
    success_requests: AtomicU64,
    failed_requests: AtomicU64,
}

impl WindowCell {
    fn add(&self, byte_count: u64, failed: bool) {
        let (bytes, requests) = if failed {
            (&self.failed_bytes, &self.failed_requests)
        } else {
            (&self.success_bytes, &self.success_requests)
        };
        saturating_add(bytes, byte_count);
        saturating_add(requests, 1);
    }

    fn load(&self) -> Window {
        Window {
            success_bytes: self.success_bytes.load(Ordering::Relaxed),
            failed_bytes: self.failed_bytes.load(Ordering::Relaxed),
            success_requests: self.success_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }

    fn into_window(self) -> Window {
        Window {
            success_bytes: self.success_bytes.into_inner(),
            failed_bytes: self.failed_bytes.into_inner(),
            success_requests: self.success_requests.into_inner(),
            failed_requests: self.failed_requests.into_inner(),
        }
    }
}

// Pins at u64::MAX instead of wrapping.
fn saturating_add(counter: &AtomicU64, value: u64) {
    counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_add(value))
        })
        .ok();
}

/// Concurrency-safe accumulator of the traffic seen in one direction of a
/// session.
#[derive(Debug)]
pub struct TrafficCounter {
    current: ArcSwap<WindowCell>,
    lifetime: WindowCell,
}

impl Default for TrafficCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TrafficCounter {
    pub fn new() -> Self {
        Self {
            current: ArcSwap::from_pointee(WindowCell::default()),
            lifetime: WindowCell::default(),
        }
    }

    /// Record a completed operation of `byte_count` bytes.
    ///
    /// Never blocks and never fails.
    pub fn record(&self, byte_count: u64, failed: bool) {
        let cell = self.current.load_full();
        cell.add(byte_count, failed);
        self.lifetime.add(byte_count, failed);
    }

    /// Take the totals of the current window and start a new, empty one.
    ///
    /// Must not be called concurrently with itself on the same counter; the
    /// analyzer tick that owns this counter is the only caller.
    pub fn snapshot_and_reset(&self) -> Window {
        let mut retired = self.current.swap(Arc::new(WindowCell::default()));
        let mut spins = 0u32;
        loop {
            match Arc::try_unwrap(retired) {
                Ok(cell) => return cell.into_window(),
                Err(still_shared) => {
                    // A recorder loaded the cell before the swap and has not
                    // finished adding to it yet.
                    retired = still_shared;
                    if spins < DRAIN_SPIN_LIMIT {
                        spins += 1;
                        hint::spin_loop();
                    } else {
                        thread::yield_now();
                    }
                }
            }
        }
    }

    /// Best-effort view of the in-progress window, without resetting it.
    pub fn peek(&self) -> Window {
        self.current.load().load()
    }

    /// Totals since the counter was created. Never reset.
    pub fn lifetime(&self) -> Window {
        self.lifetime.load()
    }
}
