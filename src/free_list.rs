//! Intrusive lists over untyped blocks.
//!
//! A free block carries no header. Its first word holds the address of the next free
//! block. Every read or write of that word in the crate goes through this module.

use core::ptr::{NonNull, null_mut};

#[inline(always)]
unsafe fn next_of(block: *mut u8) -> *mut u8 {
  unsafe { block.cast::<*mut u8>().read() }
}

#[inline(always)]
unsafe fn set_next(block: *mut u8, next: *mut u8) {
  unsafe { block.cast::<*mut u8>().write(next) }
}

/// LIFO stack of same-sized free blocks. `len` always equals the number of linked nodes.
#[derive(Debug)]
pub struct FreeList {
  head: *mut u8,
  len: usize,
}

// Blocks belong to whichever list links them, never to a thread.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  /// Links `count` blocks of `size` bytes laid out back to back from `base`, lowest
  /// address first.
  ///
  /// # Safety
  ///
  /// `base..base + count * size` must be writable memory owned by the caller, `base` must be
  /// pointer-aligned and `size` a non-zero multiple of the pointer size.
  pub unsafe fn carve(base: NonNull<u8>, size: usize, count: usize) -> Self {
    debug_assert!(size >= size_of::<*mut u8>() && size % size_of::<*mut u8>() == 0);
    let base = base.as_ptr();
    let mut next = null_mut();
    for i in (0..count).rev() {
      let block = unsafe { base.add(i * size) };
      unsafe { set_next(block, next) };
      next = block;
    }
    Self {
      head: next,
      len: count,
    }
  }

  #[inline]
  pub const fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub const fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  /// # Safety
  ///
  /// `block` must be pointer-aligned, at least one pointer wide, owned by the caller, and
  /// not linked in any list.
  #[inline]
  pub unsafe fn push(&mut self, block: NonNull<u8>) {
    let block = block.as_ptr();
    unsafe { set_next(block, self.head) };
    self.head = block;
    self.len += 1;
  }

  #[inline]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = NonNull::new(self.head)?;
    self.head = unsafe { next_of(block.as_ptr()) };
    self.len -= 1;
    Some(block)
  }

  /// Detaches up to `n` blocks from the head.
  pub fn take(&mut self, n: usize) -> Batch {
    let n = n.min(self.len);
    if n == 0 {
      return Batch::empty();
    }

    let head = self.head;
    let mut tail = head;
    for _ in 1..n {
      tail = unsafe { next_of(tail) };
    }
    self.head = unsafe { next_of(tail) };
    unsafe { set_next(tail, null_mut()) };
    self.len -= n;

    Batch { head, tail, len: n }
  }

  /// Prepends a detached chain in O(1).
  pub fn push_batch(&mut self, batch: Batch) {
    if batch.len == 0 {
      return;
    }
    unsafe { set_next(batch.tail, self.head) };
    self.head = batch.head;
    self.len += batch.len;
  }

  /// Forgets every block without touching the memory.
  pub fn clear(&mut self) {
    self.head = null_mut();
    self.len = 0;
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

/// Detached chain of free blocks, moved between tiers in one transaction.
///
/// Iterating yields each block after its link has been read, so the consumer may
/// overwrite the block immediately.
#[derive(Debug)]
pub struct Batch {
  head: *mut u8,
  tail: *mut u8,
  len: usize,
}

unsafe impl Send for Batch {}

impl Batch {
  pub const fn empty() -> Self {
    Self {
      head: null_mut(),
      tail: null_mut(),
      len: 0,
    }
  }

  pub const fn is_empty(&self) -> bool {
    self.len == 0
  }
}

impl Iterator for Batch {
  type Item = NonNull<u8>;

  fn next(&mut self) -> Option<NonNull<u8>> {
    if self.len == 0 {
      return None;
    }
    let block = NonNull::new(self.head)?;
    self.head = unsafe { next_of(block.as_ptr()) };
    self.len -= 1;
    if self.len == 0 {
      self.tail = null_mut();
    }
    Some(block)
  }

  fn size_hint(&self) -> (usize, Option<usize>) {
    (self.len, Some(self.len))
  }
}

impl ExactSizeIterator for Batch {}

#[cfg(test)]
mod tests {
  use super::*;

  const BLOCK: usize = 32;

  /// Backing store of `n` 32-byte blocks.
  fn arena(n: usize) -> Vec<[u64; 4]> {
    vec![[0; 4]; n]
  }

  fn block_at(arena: &mut [[u64; 4]], i: usize) -> NonNull<u8> {
    NonNull::from(&mut arena[i]).cast()
  }

  #[test]
  fn lifo_order() {
    let mut mem = arena(2);
    let a = block_at(&mut mem, 0);
    let b = block_at(&mut mem, 1);
    let mut list = FreeList::new();
    unsafe {
      list.push(a);
      list.push(b);
    }
    assert_eq!(list.len(), 2);
    assert_eq!(list.pop(), Some(b));
    assert_eq!(list.pop(), Some(a));
    assert_eq!(list.pop(), None);
    assert!(list.is_empty());
  }

  #[test]
  fn carve_links_in_address_order() {
    let mut mem = arena(5);
    let base = block_at(&mut mem, 0);
    let mut list = unsafe { FreeList::carve(base, BLOCK, 5) };
    assert_eq!(list.len(), 5);
    for i in 0..5 {
      let block = list.pop().unwrap();
      assert_eq!(block.as_ptr() as usize - base.as_ptr() as usize, i * BLOCK);
    }
    assert!(list.is_empty());
  }

  #[test]
  fn take_and_push_batch() {
    let mut mem = arena(10);
    let base = block_at(&mut mem, 0);
    let mut list = unsafe { FreeList::carve(base, BLOCK, 10) };

    let batch = list.take(4);
    assert_eq!(batch.len(), 4);
    assert_eq!(list.len(), 6);

    let mut other = FreeList::new();
    unsafe { other.push(list.pop().unwrap()) };
    other.push_batch(batch);
    assert_eq!(other.len(), 5);
    // Batch blocks come first, followed by what was already there.
    let order: Vec<usize> = std::iter::from_fn(|| other.pop())
      .map(|b| (b.as_ptr() as usize - base.as_ptr() as usize) / BLOCK)
      .collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4]);
  }

  #[test]
  fn take_more_than_available() {
    let mut mem = arena(3);
    let mut list = unsafe { FreeList::carve(block_at(&mut mem, 0), BLOCK, 3) };
    let batch = list.take(100);
    assert_eq!(batch.len(), 3);
    assert!(list.is_empty());
    assert!(list.take(1).is_empty());
  }

  #[test]
  fn batch_survives_overwriting_yielded_blocks() {
    let mut mem = arena(4);
    let mut list = unsafe { FreeList::carve(block_at(&mut mem, 0), BLOCK, 4) };
    let mut seen = 0;
    for block in list.take(4) {
      unsafe { block.as_ptr().write_bytes(0xAB, BLOCK) };
      seen += 1;
    }
    assert_eq!(seen, 4);
  }
}
