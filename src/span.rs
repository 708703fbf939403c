//! Spans: runs of contiguous pages.
//!
//! A span is either idle in the page cache, or carved into equal blocks and held by
//! exactly one central cache shard. It moves between the two by value.

use core::ptr::NonNull;

use crate::{
  MAX_PAGES, PAGE_SHIFT, PAGE_SIZE,
  free_list::{Batch, FreeList},
};

/// Page number: an address shifted right by [`PAGE_SHIFT`].
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct PageId(pub usize);

impl PageId {
  /// Page containing `ptr`.
  #[inline]
  pub fn of(ptr: *const u8) -> Self {
    Self(ptr as usize >> PAGE_SHIFT)
  }

  #[inline]
  pub const fn addr(self) -> usize {
    self.0 << PAGE_SHIFT
  }

  #[inline]
  pub const fn add(self, pages: usize) -> Self {
    Self(self.0 + pages)
  }

  #[inline]
  pub const fn prev(self) -> Option<Self> {
    match self.0.checked_sub(1) {
      Some(id) => Some(Self(id)),
      None => None,
    }
  }
}

#[derive(Debug)]
pub struct Span {
  start: NonNull<u8>,
  pages: usize,
  /// 0 until carved.
  object_size: usize,
  /// Blocks handed out and not yet returned.
  use_count: usize,
  free_list: FreeList,
}

// A span's pages belong to whichever cache currently holds the span.
unsafe impl Send for Span {}

impl Span {
  /// `start` must be page-aligned memory of `pages` pages owned by the new span.
  pub(crate) fn new(start: NonNull<u8>, pages: usize) -> Self {
    debug_assert!(start.as_ptr() as usize % PAGE_SIZE == 0, "span start not page aligned");
    debug_assert!(pages > 0);
    Self {
      start,
      pages,
      object_size: 0,
      use_count: 0,
      free_list: FreeList::new(),
    }
  }

  #[inline]
  pub fn page_id(&self) -> PageId {
    PageId::of(self.start.as_ptr())
  }

  /// First page after the span.
  #[inline]
  pub fn end(&self) -> PageId {
    self.page_id().add(self.pages)
  }

  #[inline]
  pub fn pages(&self) -> usize {
    self.pages
  }

  #[inline]
  pub fn bytes(&self) -> usize {
    self.pages << PAGE_SHIFT
  }

  pub fn start(&self) -> NonNull<u8> {
    self.start
  }

  pub fn page_ids(&self) -> impl Iterator<Item = PageId> + use<> {
    let first = self.page_id().0;
    (first..first + self.pages).map(PageId)
  }

  pub fn object_size(&self) -> usize {
    self.object_size
  }

  pub fn use_count(&self) -> usize {
    self.use_count
  }

  /// Blocks still available in this span.
  pub fn free_count(&self) -> usize {
    self.free_list.len()
  }

  #[inline]
  pub fn is_idle(&self) -> bool {
    self.use_count == 0
  }

  /// Too large for the page cache buckets.
  pub fn is_oversized(&self) -> bool {
    self.pages > MAX_PAGES
  }

  /// Whether `ptr` is the start of one of this span's blocks.
  pub fn owns(&self, ptr: *const u8) -> bool {
    let base = self.start.as_ptr() as usize;
    let addr = ptr as usize;
    self.object_size != 0
      && addr >= base
      && addr < base + self.capacity() * self.object_size
      && (addr - base) % self.object_size == 0
  }

  fn capacity(&self) -> usize {
    self.bytes() / self.object_size
  }

  /// Splits the span into blocks of `object_size`, returning how many. Trailing bytes
  /// that do not fit a whole block stay unused.
  pub(crate) fn carve(&mut self, object_size: usize) -> usize {
    debug_assert!(self.is_idle(), "carving a span with live blocks");
    let count = self.bytes() / object_size;
    // SAFETY: the span exclusively owns its pages and none of its blocks are handed out.
    self.free_list = unsafe { FreeList::carve(self.start, object_size, count) };
    self.object_size = object_size;
    count
  }

  /// Hands out up to `n` blocks.
  pub(crate) fn take(&mut self, n: usize) -> Batch {
    let batch = self.free_list.take(n);
    self.use_count += batch.len();
    batch
  }

  /// # Safety
  ///
  /// `block` must have been handed out by this span and given up by its user.
  pub(crate) unsafe fn give_back(&mut self, block: NonNull<u8>) {
    debug_assert!(self.use_count > 0, "span use count underflow");
    unsafe { self.free_list.push(block) };
    self.use_count -= 1;
  }

  /// Drops the carving so the pages can be reused at any size.
  pub(crate) fn reset(&mut self) {
    debug_assert!(self.is_idle());
    self.free_list.clear();
    self.object_size = 0;
  }

  /// Keeps the first `pages` pages and returns the rest as a new span.
  pub(crate) fn split_off(&mut self, pages: usize) -> Span {
    assert!(pages > 0 && pages < self.pages, "split outside the span");
    debug_assert!(self.object_size == 0, "splitting a carved span");
    let rest = unsafe { NonNull::new_unchecked(self.start.as_ptr().add(pages << PAGE_SHIFT)) };
    let rest = Span::new(rest, self.pages - pages);
    self.pages = pages;
    rest
  }

  /// Merges an idle span that ends where this one starts or starts where this one ends.
  pub(crate) fn absorb(&mut self, other: Span) {
    if other.end() == self.page_id() {
      self.start = other.start;
    } else {
      assert!(other.page_id() == self.end(), "absorbing a span that is not adjacent");
    }
    self.pages += other.pages;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{PageSource, SystemPageSource, size_class};

  fn fresh(pages: usize) -> Span {
    Span::new(SystemPageSource.request_pages(pages).unwrap(), pages)
  }

  #[test]
  fn carving_fills_span_without_overflow() {
    for &size in &[8, 24, 136, 1152, 9 * 1024, 72 * 1024, crate::MAX_BYTES] {
      let pages = size_class::num_move_page(size);
      let mut span = fresh(pages);
      let n = span.carve(size);
      assert!(n * size <= pages * PAGE_SIZE);
      assert!(pages * PAGE_SIZE < (n + 1) * size);
      assert_eq!(span.free_count(), n);
    }
  }

  #[test]
  fn take_and_give_back_track_use_count() {
    let mut span = fresh(1);
    let n = span.carve(64);
    let batch = span.take(10);
    assert_eq!(span.use_count(), 10);
    assert_eq!(span.free_count(), n - 10);
    for block in batch {
      assert!(span.owns(block.as_ptr()));
      unsafe { span.give_back(block) };
    }
    assert!(span.is_idle());
    assert_eq!(span.free_count(), n);
  }

  #[test]
  fn owns_rejects_interior_pointers() {
    let mut span = fresh(1);
    span.carve(48);
    let base = span.start().as_ptr();
    assert!(span.owns(base));
    assert!(span.owns(unsafe { base.add(48) }));
    assert!(!span.owns(unsafe { base.add(8) }));
    assert!(!span.owns(unsafe { base.add(PAGE_SIZE) }));
  }

  #[test]
  fn split_and_absorb() {
    let mut span = fresh(10);
    let first = span.page_id();
    let rest = span.split_off(3);
    assert_eq!(span.pages(), 3);
    assert_eq!(rest.page_id(), first.add(3));
    assert_eq!(rest.pages(), 7);
    assert_eq!(span.end(), rest.page_id());

    let mut right = rest;
    right.absorb(span);
    assert_eq!(right.page_id(), first);
    assert_eq!(right.pages(), 10);
    assert_eq!(right.page_ids().count(), 10);
  }

  #[test]
  fn page_id_round_trip() {
    let span = fresh(2);
    let id = span.page_id();
    assert_eq!(id.addr(), span.start().as_ptr() as usize);
    assert_eq!(PageId::of(unsafe { span.start().as_ptr().add(PAGE_SIZE + 5) }), id.add(1));
    assert_eq!(PageId(0).prev(), None);
    assert_eq!(id.add(1).prev(), Some(id));
  }
}
