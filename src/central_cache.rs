//! Central cache: one shard per size class.
//!
//! Each shard owns the spans carved for its class, plus a map from every page of those
//! spans back to the span. A shard lock is never held across a call into the page
//! cache, and never together with another shard's lock.

use std::{collections::HashMap, sync::Arc};

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use tracing::trace;

use crate::{
  NUM_CLASSES,
  error::PoolError,
  free_list::Batch,
  page_cache::PageCache,
  page_map_corrupted,
  size_class::{self, CLASSES},
  span::{PageId, Span},
};

#[derive(Default)]
struct Shard {
  /// Carved spans by start page.
  spans: HashMap<PageId, Span>,
  /// Every page of every span above -> that span's start page.
  owners: HashMap<PageId, PageId>,
}

impl Shard {
  fn partial_span(&self) -> Option<PageId> {
    self
      .spans
      .iter()
      .find(|(_, span)| span.free_count() > 0)
      .map(|(&start, _)| start)
  }

  fn adopt(&mut self, span: Span) -> PageId {
    let start = span.page_id();
    for page in span.page_ids() {
      self.owners.insert(page, start);
    }
    self.spans.insert(start, span);
    start
  }

  fn retire(&mut self, start: PageId) -> Span {
    let Some(span) = self.spans.remove(&start) else {
      page_map_corrupted(start, "retiring a span the shard does not hold");
    };
    for page in span.page_ids() {
      self.owners.remove(&page);
    }
    span
  }
}

pub struct CentralCache {
  shards: Box<[CachePadded<Mutex<Shard>>]>,
  page_cache: Arc<PageCache>,
}

impl CentralCache {
  pub fn new(page_cache: Arc<PageCache>) -> Self {
    Self {
      shards: (0..NUM_CLASSES)
        .map(|_| CachePadded::new(Mutex::new(Shard::default())))
        .collect(),
      page_cache,
    }
  }

  pub fn page_cache(&self) -> &Arc<PageCache> {
    &self.page_cache
  }

  /// Hands out up to `num` objects of class size `size`.
  ///
  /// The batch may be shorter than requested when the chosen span runs out. That is a
  /// normal result, not an error.
  pub fn fetch_range_obj(&self, size: usize, num: usize) -> Result<Batch, PoolError> {
    debug_assert_eq!(size_class::round_up(size), size, "fetch with an unrounded size");
    let index = size_class::index(size);
    let mut shard = self.shards[index].lock();

    let start = match shard.partial_span() {
      Some(start) => start,
      None => {
        let span = MutexGuard::unlocked(&mut shard, || self.grow(index))?;
        shard.adopt(span)
      }
    };

    let Some(span) = shard.spans.get_mut(&start) else {
      page_map_corrupted(start, "partial span vanished from its shard");
    };
    let batch = span.take(num);
    trace!(size, requested = num, fetched = batch.len(), "central cache fetch");
    Ok(batch)
  }

  /// Gets a fresh span for class `index` from the page cache and carves it.
  fn grow(&self, index: usize) -> Result<Span, PoolError> {
    let class = &CLASSES[index];
    let mut span = self.page_cache.new_span(class.pages)?;
    let blocks = span.carve(class.size);
    trace!(
      size = class.size,
      pages = class.pages,
      blocks,
      start = span.page_id().0,
      "carved new span"
    );
    Ok(span)
  }

  /// Returns objects of class size `size` to their spans. Spans left with no live
  /// object go back to the page cache.
  pub fn release_list_to_spans(&self, batch: Batch, size: usize) {
    let index = size_class::index(size);
    let mut shard = self.shards[index].lock();
    let mut released = 0usize;

    for block in batch {
      let page = PageId::of(block.as_ptr());
      let Some(&start) = shard.owners.get(&page) else {
        page_map_corrupted(page, "released block outside every span of its class");
      };
      let Some(span) = shard.spans.get_mut(&start) else {
        page_map_corrupted(page, "page maps to a span the shard does not hold");
      };

      #[cfg(feature = "debug-tripwire")]
      if !span.owns(block.as_ptr()) {
        page_map_corrupted(page, "released pointer is not on an object boundary");
      }

      // SAFETY: the block was carved from this span and its user has given it up.
      unsafe { span.give_back(block) };
      released += 1;

      if span.is_idle() {
        let span = shard.retire(start);
        trace!(start = start.0, pages = span.pages(), "span idle, returning to page cache");
        MutexGuard::unlocked(&mut shard, || {
          self.page_cache.release_span_to_page_cache(span)
        });
      }
    }

    trace!(size, released, "central cache release");
  }

  /// Spans currently carved for the class of `size`.
  pub fn span_count(&self, size: usize) -> usize {
    self.shards[size_class::index(size)].lock().spans.len()
  }

  /// Objects of the class of `size` not handed out to any thread cache.
  pub fn free_objects(&self, size: usize) -> usize {
    let shard = self.shards[size_class::index(size)].lock();
    shard.spans.values().map(Span::free_count).sum()
  }
}
