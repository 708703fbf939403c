//! Per-thread cache: one free list per size class, no locking.

use core::ptr::NonNull;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::{
  NUM_CLASSES,
  central_cache::CentralCache,
  error::PoolError,
  free_list::FreeList,
  size_class::{self, CLASSES},
};

/// Longest a free list may grow before half of it goes back to the central cache.
/// Big objects pin more memory per cached entry, so their lists stay shorter.
pub const fn max_cached(index: usize) -> usize {
  match index {
    0..=15 => 1536,   // <= 128B
    16..=71 => 768,   // <= 1KiB
    72..=127 => 384,  // <= 8KiB
    _ => 192,
  }
}

pub struct ThreadCache {
  lists: Box<[FreeList]>,
  central: Arc<CentralCache>,
}

impl ThreadCache {
  pub fn new(central: Arc<CentralCache>) -> Self {
    Self {
      lists: (0..NUM_CLASSES).map(|_| FreeList::new()).collect(),
      central,
    }
  }

  pub fn central(&self) -> &Arc<CentralCache> {
    &self.central
  }

  /// Most recently freed object of the class first, otherwise a batch refill.
  ///
  /// A refill hands out the head of the fetched batch and caches the rest in order.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, PoolError> {
    let index = size_class::index(size);
    match self.lists[index].pop() {
      Some(block) => Ok(block),
      None => self.fetch_from_central(index),
    }
  }

  #[inline(never)]
  fn fetch_from_central(&mut self, index: usize) -> Result<NonNull<u8>, PoolError> {
    let class = &CLASSES[index];
    let mut batch = self.central.fetch_range_obj(class.size, class.batch)?;
    let Some(block) = batch.next() else {
      warn!(size = class.size, "central cache returned an empty batch");
      return Err(PoolError::Exhausted { size: class.size });
    };
    self.lists[index].push_batch(batch);
    Ok(block)
  }

  /// # Safety
  ///
  /// `ptr` must have been allocated from this cache's central cache with a size of the same
  /// class, and must not be used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    let index = size_class::index(size);
    let list = &mut self.lists[index];
    unsafe { list.push(ptr) };
    let len = list.len();
    if len > max_cached(index) {
      self.release_to_central(index, len / 2);
    }
  }

  fn release_to_central(&mut self, index: usize, n: usize) {
    let batch = self.lists[index].take(n);
    self.central.release_list_to_spans(batch, CLASSES[index].size);
  }

  /// Objects cached for the class of `size`.
  pub fn cached(&self, size: usize) -> usize {
    self.lists[size_class::index(size)].len()
  }

  /// Returns every cached object to the central cache.
  pub fn flush(&mut self) -> usize {
    let mut flushed = 0;
    for index in 0..NUM_CLASSES {
      let len = self.lists[index].len();
      if len > 0 {
        self.release_to_central(index, len);
        flushed += len;
      }
    }
    flushed
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    let flushed = self.flush();
    if flushed > 0 {
      debug!(flushed, "thread cache flushed");
    }
  }
}
