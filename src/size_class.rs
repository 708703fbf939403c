//! Size classes.
//!
//! Requests are rounded up with an alignment that grows with the size, which keeps the
//! rounding waste at or below 12.5% above 128 bytes while the table stays small:
//!
//! | range          | alignment | classes |
//! |----------------|-----------|---------|
//! | [1, 128]       | 8         | 16      |
//! | (128, 1K]      | 16        | 56      |
//! | (1K, 8K]       | 128       | 56      |
//! | (8K, 64K]      | 1K        | 56      |
//! | (64K, 256K]    | 8K        | 24      |
//!
//! Everything here is `const fn` and has no side effects.

use crate::{MAX_BYTES, NUM_CLASSES, PAGE_SHIFT, align_up};

/// Inclusive upper bound and alignment of each tier.
const TIERS: [(usize, usize); 5] = [
  (128, 8),
  (1024, 16),
  (8 * 1024, 128),
  (64 * 1024, 1024),
  (256 * 1024, 8 * 1024),
];

/// First class index of each tier: the class counts of all finer tiers summed.
const TIER_BASE: [usize; 5] = tier_bases();

/// Batch bounds for transfers between a thread cache and the central cache.
pub const MIN_BATCH: usize = 2;
pub const MAX_BATCH: usize = 512;

const _: () = assert!(TIERS[TIERS.len() - 1].0 == MAX_BYTES);
const _: () = assert!(TIER_BASE[4] + (MAX_BYTES - TIERS[3].0) / TIERS[4].1 == NUM_CLASSES);

const fn tier_bases() -> [usize; 5] {
  let mut bases = [0; 5];
  let mut t = 1;
  while t < TIERS.len() {
    let lower = if t == 1 { 0 } else { TIERS[t - 2].0 };
    bases[t] = bases[t - 1] + (TIERS[t - 1].0 - lower) / TIERS[t - 1].1;
    t += 1;
  }
  bases
}

#[inline(always)]
const fn tier_of(size: usize) -> usize {
  let mut t = 0;
  while t < TIERS.len() - 1 && size > TIERS[t].0 {
    t += 1;
  }
  t
}

#[inline(always)]
const fn tier_lower(tier: usize) -> usize {
  if tier == 0 { 0 } else { TIERS[tier - 1].0 }
}

#[inline(always)]
const fn check(size: usize) {
  assert!(size > 0 && size <= MAX_BYTES, "size outside the class table");
}

/// Alignment of the tier `size` falls in.
pub const fn alignment(size: usize) -> usize {
  check(size);
  TIERS[tier_of(size)].1
}

/// Rounds `size` up to its class size.
pub const fn round_up(size: usize) -> usize {
  align_up(size, alignment(size))
}

/// Class index of `size`, in `[0, NUM_CLASSES)`.
pub const fn index(size: usize) -> usize {
  check(size);
  let tier = tier_of(size);
  TIER_BASE[tier] + (size - tier_lower(tier)).div_ceil(TIERS[tier].1) - 1
}

/// Object size of class `index`. Inverse of [`index`] on rounded sizes.
pub const fn class_size(index: usize) -> usize {
  assert!(index < NUM_CLASSES, "class index out of range");
  let mut tier = TIERS.len() - 1;
  while TIER_BASE[tier] > index {
    tier -= 1;
  }
  tier_lower(tier) + (index - TIER_BASE[tier] + 1) * TIERS[tier].1
}

/// Objects moved per thread cache / central cache transaction.
pub const fn num_move_size(size: usize) -> usize {
  let num = MAX_BYTES / round_up(size);
  if num < MIN_BATCH {
    MIN_BATCH
  } else if num > MAX_BATCH {
    MAX_BATCH
  } else {
    num
  }
}

/// Pages to request from the page cache when a shard of this class runs dry.
pub const fn num_move_page(size: usize) -> usize {
  let pages = (num_move_size(size) * round_up(size)) >> PAGE_SHIFT;
  if pages == 0 { 1 } else { pages }
}

// =============================================================================
// Class table
// =============================================================================

/// Precomputed parameters of one size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassInfo {
  /// Object size.
  pub size: usize,
  pub align: usize,
  /// Objects per central cache transaction.
  pub batch: usize,
  /// Pages per span growth.
  pub pages: usize,
}

pub static CLASSES: [ClassInfo; NUM_CLASSES] = build_classes();

const fn build_classes() -> [ClassInfo; NUM_CLASSES] {
  let mut table = [ClassInfo {
    size: 0,
    align: 0,
    batch: 0,
    pages: 0,
  }; NUM_CLASSES];
  let mut i = 0;
  while i < NUM_CLASSES {
    let size = class_size(i);
    table[i] = ClassInfo {
      size,
      align: alignment(size),
      batch: num_move_size(size),
      pages: num_move_page(size),
    };
    i += 1;
  }
  table
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::PAGE_SIZE;
  use proptest::prelude::*;

  #[test]
  fn round_up_covers_and_is_idempotent() {
    for size in 1..=MAX_BYTES {
      let rounded = round_up(size);
      assert!(rounded >= size, "round_up({size}) = {rounded}");
      assert_eq!(round_up(rounded), rounded, "round_up not idempotent at {size}");
    }
  }

  #[test]
  fn index_is_monotonic_and_bounded() {
    let mut prev = 0;
    for size in 1..=MAX_BYTES {
      let idx = index(size);
      assert!(idx < NUM_CLASSES);
      assert!(idx >= prev, "index({size}) = {idx} < {prev}");
      prev = idx;
    }
    assert_eq!(prev, NUM_CLASSES - 1);
  }

  #[test]
  fn class_size_inverts_index() {
    for size in 1..=MAX_BYTES {
      assert_eq!(class_size(index(size)), round_up(size), "size {size}");
    }
    for idx in 0..NUM_CLASSES {
      assert_eq!(index(class_size(idx)), idx);
    }
  }

  #[test]
  fn tier_boundaries() {
    assert_eq!((round_up(1), index(1)), (8, 0));
    assert_eq!((round_up(128), index(128)), (128, 15));
    assert_eq!((round_up(129), index(129)), (144, 16));
    assert_eq!((round_up(1024), index(1024)), (1024, 71));
    assert_eq!((round_up(1025), index(1025)), (1152, 72));
    assert_eq!((round_up(8 * 1024), index(8 * 1024)), (8 * 1024, 127));
    assert_eq!((round_up(8 * 1024 + 1), index(8 * 1024 + 1)), (9 * 1024, 128));
    assert_eq!((round_up(64 * 1024), index(64 * 1024)), (64 * 1024, 183));
    assert_eq!((round_up(64 * 1024 + 1), index(64 * 1024 + 1)), (72 * 1024, 184));
    assert_eq!((round_up(MAX_BYTES), index(MAX_BYTES)), (MAX_BYTES, 207));
  }

  #[test]
  fn waste_bounded_above_first_tier() {
    for size in 129..=MAX_BYTES {
      assert!((round_up(size) - size) * 8 <= size, "size {size} wastes too much");
    }
  }

  #[test]
  fn batch_sizes_are_clamped() {
    assert_eq!(num_move_size(8), MAX_BATCH);
    assert_eq!(num_move_size(1024), 256);
    assert_eq!(num_move_size(MAX_BYTES), MIN_BATCH);
    assert_eq!(num_move_size(200 * 1024), MIN_BATCH);
  }

  #[test]
  fn growth_pages() {
    assert_eq!(num_move_page(8), 1);
    assert_eq!(num_move_page(1024), 32);
    assert_eq!(num_move_page(MAX_BYTES), 64);
  }

  #[test]
  fn table_matches_functions() {
    for (i, class) in CLASSES.iter().enumerate() {
      assert_eq!(class.size, class_size(i));
      assert_eq!(class.align, alignment(class.size));
      assert_eq!(class.batch, num_move_size(class.size));
      assert_eq!(class.pages, num_move_page(class.size));
      assert_eq!(class.size % class.align, 0);
    }
  }

  #[test]
  #[should_panic(expected = "outside the class table")]
  fn oversized_request_is_rejected() {
    index(MAX_BYTES + 1);
  }

  proptest! {
    #[test]
    fn growth_span_holds_a_batch_worth(size in 1..=MAX_BYTES) {
      let class = CLASSES[index(size)];
      let objects = class.pages * PAGE_SIZE / class.size;
      prop_assert!(objects >= 1);
      prop_assert!((MIN_BATCH..=MAX_BATCH).contains(&class.batch));
      prop_assert!(class.pages <= crate::MAX_PAGES);
    }
  }
}
