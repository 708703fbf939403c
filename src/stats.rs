//! Allocation counters maintained at the pool boundary, outside every lock.

use core::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

#[derive(Debug, Default)]
pub(crate) struct Stats {
  allocations: CachePadded<AtomicUsize>,
  frees: CachePadded<AtomicUsize>,
  current_bytes: CachePadded<AtomicUsize>,
  peak_bytes: CachePadded<AtomicUsize>,
}

/// Point-in-time view of a pool's counters. Byte figures use requested sizes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
  pub allocations: usize,
  pub frees: usize,
  pub current_bytes: usize,
  /// High-water mark of `current_bytes` since creation or the last reset.
  pub peak_bytes: usize,
}

impl Stats {
  #[inline]
  pub(crate) fn record_alloc(&self, size: usize) {
    self.allocations.fetch_add(1, Ordering::Relaxed);
    let now = self.current_bytes.fetch_add(size, Ordering::Relaxed) + size;
    self.peak_bytes.fetch_max(now, Ordering::Relaxed);
  }

  #[inline]
  pub(crate) fn record_free(&self, size: usize) {
    self.frees.fetch_add(1, Ordering::Relaxed);
    // Blocks allocated before a reset are freed against a smaller figure.
    let _ = self
      .current_bytes
      .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |now| {
        Some(now.saturating_sub(size))
      });
  }

  pub(crate) fn snapshot(&self) -> PoolStats {
    PoolStats {
      allocations: self.allocations.load(Ordering::Relaxed),
      frees: self.frees.load(Ordering::Relaxed),
      current_bytes: self.current_bytes.load(Ordering::Relaxed),
      peak_bytes: self.peak_bytes.load(Ordering::Relaxed),
    }
  }

  pub(crate) fn reset(&self) {
    self.allocations.store(0, Ordering::Relaxed);
    self.frees.store(0, Ordering::Relaxed);
    self.current_bytes.store(0, Ordering::Relaxed);
    self.peak_bytes.store(0, Ordering::Relaxed);
  }
}
