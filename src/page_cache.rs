//! Page cache: the global, page-granular tier.
//!
//! Idle spans sit in buckets indexed by page count. Requests take the smallest idle span
//! that fits and split off the remainder. Released spans are coalesced with idle
//! neighbours before going back into a bucket, which is what keeps long-running
//! workloads from fragmenting the address space.
//!
//! Every page of every span the cache has handed out or holds idle is recorded in a
//! page map, so the neighbours of a released span can be found in O(1).

use std::{
  collections::{BTreeSet, HashMap},
  sync::Arc,
};

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{
  MAX_PAGES,
  error::PoolError,
  page_map_corrupted,
  page_source::PageSource,
  span::{PageId, Span},
};

pub struct PageCache {
  heap: Mutex<PageHeap>,
  source: Arc<dyn PageSource>,
}

struct PageHeap {
  /// `buckets[n]` holds the start pages of idle spans of exactly `n` pages.
  buckets: Vec<BTreeSet<PageId>>,
  /// Idle spans by start page.
  idle: HashMap<PageId, Span>,
  /// Managed page -> start page of the span covering it.
  owners: HashMap<PageId, PageId>,
  /// Released spans above `MAX_PAGES`, kept for later oversized requests.
  oversized: Vec<Span>,
  mapped_pages: usize,
  idle_pages: usize,
}

impl PageCache {
  pub fn new(source: Arc<dyn PageSource>) -> Self {
    Self {
      heap: Mutex::new(PageHeap {
        buckets: vec![BTreeSet::new(); MAX_PAGES + 1],
        idle: HashMap::new(),
        owners: HashMap::new(),
        oversized: Vec::new(),
        mapped_pages: 0,
        idle_pages: 0,
      }),
      source,
    }
  }

  /// Returns an uncarved span of exactly `pages` pages.
  ///
  /// Requests above [`MAX_PAGES`] bypass the buckets: they are served whole from a parked
  /// oversized span or mapped directly, and are never split or registered.
  ///
  /// # Panics
  ///
  /// Panics if `pages` is zero.
  pub fn new_span(&self, pages: usize) -> Result<Span, PoolError> {
    assert!(pages > 0, "a span covers at least one page");
    let mut heap = self.heap.lock();
    if pages > MAX_PAGES {
      heap.oversized_span(&*self.source, pages)
    } else {
      heap.managed_span(&*self.source, pages)
    }
  }

  /// Takes back a span with no live blocks, merging it with idle neighbours.
  pub fn release_span_to_page_cache(&self, span: Span) {
    self.heap.lock().release(span);
  }

  /// Pages obtained from the page source over the cache's lifetime.
  pub fn mapped_pages(&self) -> usize {
    self.heap.lock().mapped_pages
  }

  /// Pages currently idle in the buckets.
  pub fn idle_pages(&self) -> usize {
    self.heap.lock().idle_pages
  }

  /// `(start, pages)` of every idle bucketed span, lowest address first.
  pub fn idle_spans(&self) -> Vec<(PageId, usize)> {
    let heap = self.heap.lock();
    let mut spans: Vec<_> = heap.idle.values().map(|s| (s.page_id(), s.pages())).collect();
    spans.sort_unstable();
    spans
  }
}

impl PageHeap {
  fn managed_span(&mut self, source: &dyn PageSource, pages: usize) -> Result<Span, PoolError> {
    loop {
      if let Some(mut span) = self.pop_fit(pages) {
        if span.pages() > pages {
          let rest = span.split_off(pages);
          self.insert_idle(rest);
        }
        let start = span.page_id();
        for page in span.page_ids() {
          self.owners.insert(page, start);
        }
        trace!(start = start.0, pages, "span handed out");
        return Ok(span);
      }

      let chunk = self.map(source, MAX_PAGES)?;
      self.insert_idle(chunk);
    }
  }

  fn oversized_span(&mut self, source: &dyn PageSource, pages: usize) -> Result<Span, PoolError> {
    let parked = self
      .oversized
      .iter()
      .enumerate()
      .filter(|(_, span)| span.pages() >= pages)
      .min_by_key(|(_, span)| span.pages())
      .map(|(pos, _)| pos);
    match parked {
      Some(pos) => Ok(self.oversized.swap_remove(pos)),
      None => self.map(source, pages),
    }
  }

  fn map(&mut self, source: &dyn PageSource, pages: usize) -> Result<Span, PoolError> {
    let base = source.request_pages(pages)?;
    self.mapped_pages += pages;
    debug!(pages, base = ?base, "mapped pages from source");
    Ok(Span::new(base, pages))
  }

  /// Smallest idle span of at least `pages` pages, lowest address among equals.
  fn pop_fit(&mut self, pages: usize) -> Option<Span> {
    let start = (pages..=MAX_PAGES).find_map(|n| self.buckets[n].pop_first())?;
    let Some(span) = self.idle.remove(&start) else {
      page_map_corrupted(start, "bucketed span missing from idle set");
    };
    self.idle_pages -= span.pages();
    Some(span)
  }

  fn insert_idle(&mut self, span: Span) {
    let start = span.page_id();
    for page in span.page_ids() {
      self.owners.insert(page, start);
    }
    self.buckets[span.pages()].insert(start);
    self.idle_pages += span.pages();
    self.idle.insert(start, span);
  }

  /// Removes the idle span starting at `start` if merging it keeps within `MAX_PAGES`.
  fn take_neighbour(&mut self, start: PageId, merged_with: usize) -> Option<Span> {
    let pages = self.idle.get(&start)?.pages();
    if pages + merged_with > MAX_PAGES {
      return None;
    }
    let span = self.idle.remove(&start)?;
    self.buckets[pages].remove(&start);
    self.idle_pages -= pages;
    Some(span)
  }

  fn release(&mut self, mut span: Span) {
    span.reset();
    if span.is_oversized() {
      trace!(pages = span.pages(), "parked oversized span");
      self.oversized.push(span);
      return;
    }

    loop {
      let mut merged = false;

      if let Some(prev) = span.page_id().prev()
        && let Some(&left) = self.owners.get(&prev)
        && let Some(neighbour) = self.take_neighbour(left, span.pages())
      {
        trace!(left = left.0, pages = neighbour.pages(), "coalesced with left neighbour");
        span.absorb(neighbour);
        merged = true;
      }

      let next = span.end();
      if let Some(&right) = self.owners.get(&next)
        && right == next
        && let Some(neighbour) = self.take_neighbour(right, span.pages())
      {
        trace!(right = right.0, pages = neighbour.pages(), "coalesced with right neighbour");
        span.absorb(neighbour);
        merged = true;
      }

      if !merged {
        break;
      }
    }

    trace!(start = span.page_id().0, pages = span.pages(), "span returned to page cache");
    self.insert_idle(span);
  }
}
