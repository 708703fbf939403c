//! Three-tier concurrent memory pool.
//!
//! Small and medium requests (up to [`MAX_BYTES`]) are served by a per-thread
//! [`ThreadCache`], which refills from and drains into a [`CentralCache`] sharded by
//! size class, which in turn carves [`Span`]s obtained from the global [`PageCache`].
//! Larger requests go straight to the system allocator.
//!
//! ```
//! let pool = cmpool::Pool::new();
//! let block = pool.allocate(48).unwrap();
//! unsafe { pool.deallocate(block, 48) };
//! ```
//!
//! Mapped pages are never handed back to the operating system.

#![allow(clippy::missing_safety_doc)]

use core::{
  alloc::{GlobalAlloc, Layout},
  cell::RefCell,
  ptr::NonNull,
};
use std::{
  alloc::System,
  sync::{Arc, OnceLock, Weak},
};

pub mod central_cache;
pub mod error;
pub mod free_list;
pub mod page_cache;
pub mod page_source;
pub mod size_class;
pub mod span;
pub mod stats;
pub mod thread_cache;

pub use central_cache::CentralCache;
pub use error::PoolError;
pub use free_list::{Batch, FreeList};
pub use page_cache::PageCache;
pub use page_source::{CountingPageSource, OsPageSource, PageSource, SystemPageSource};
pub use span::{PageId, Span};
pub use stats::PoolStats;
pub use thread_cache::ThreadCache;

use stats::Stats;

// =============================================================================
// Constants
// =============================================================================

pub const PAGE_SHIFT: usize = 13;
/// Page granularity of the page cache (8KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Largest request served by the caches. Anything above goes to the system allocator.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes, and of central cache shards.
pub const NUM_CLASSES: usize = 208;

/// Largest span the page cache keeps in its buckets. Bigger requests are mapped directly.
pub const MAX_PAGES: usize = 128;

/// Alignment used for requests routed to the system allocator.
const LARGE_ALIGN: usize = 16;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % PAGE_SIZE == 0);
const _: () = assert!(size_class::index(MAX_BYTES) == NUM_CLASSES - 1);
const _: () = assert!(size_class::class_size(NUM_CLASSES - 1) == MAX_BYTES);
const _: () = assert!(size_class::num_move_page(MAX_BYTES) <= MAX_PAGES);
const _: () = assert!(size_class::round_up(1) >= core::mem::size_of::<*mut u8>());

// =============================================================================
// Pool
// =============================================================================

struct Tiers {
  central: Arc<CentralCache>,
  stats: Stats,
}

/// Allocator context owning the central and page caches.
///
/// Cloning is cheap and yields a handle to the same tiers. Each thread that touches a
/// pool gets its own [`ThreadCache`] for it, created lazily and flushed back to the
/// central cache when the thread exits.
#[derive(Clone)]
pub struct Pool {
  inner: Arc<Tiers>,
}

/// A thread's cache for one pool. Holds the pool weakly, so dropping the last `Pool`
/// handle lets the entry be pruned.
struct CacheEntry {
  tiers: Weak<Tiers>,
  cache: ThreadCache,
}

thread_local! {
  static CACHES: RefCell<Vec<CacheEntry>> = const { RefCell::new(Vec::new()) };
}

impl Pool {
  /// Creates a pool backed by the operating system's virtual memory.
  pub fn new() -> Self {
    Self::with_page_source(Arc::new(OsPageSource::default()))
  }

  pub fn with_page_source(source: Arc<dyn PageSource>) -> Self {
    let page_cache = Arc::new(PageCache::new(source));
    Self {
      inner: Arc::new(Tiers {
        central: Arc::new(CentralCache::new(page_cache)),
        stats: Stats::default(),
      }),
    }
  }

  /// Process-wide pool used by [`allocate`] and [`deallocate`].
  pub fn global() -> &'static Pool {
    static GLOBAL: OnceLock<Pool> = OnceLock::new();
    GLOBAL.get_or_init(Pool::new)
  }

  /// Allocates `size` bytes.
  ///
  /// # Panics
  ///
  /// Panics if `size` is zero or too large to describe as a [`Layout`].
  pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, PoolError> {
    assert!(size > 0, "zero-sized allocation");

    let result = if size <= MAX_BYTES {
      self.with_thread_cache(|cache| cache.allocate(size))
    } else {
      alloc_large(size)
    };
    let block = result.inspect_err(|err| tracing::warn!(size, %err, "allocation failed"))?;

    self.inner.stats.record_alloc(size);
    Ok(block)
  }

  /// Returns a block obtained from [`Pool::allocate`].
  ///
  /// # Safety
  ///
  /// `ptr` must come from `allocate` on this pool with the same `size`, and must not be
  /// used or freed again afterwards. Violations are undefined behavior: blocks carry no
  /// header, so nothing here can detect a double free or a mismatched size.
  pub unsafe fn deallocate(&self, ptr: NonNull<u8>, size: usize) {
    assert!(size > 0, "zero-sized deallocation");

    if size <= MAX_BYTES {
      self.with_thread_cache(|cache| unsafe { cache.deallocate(ptr, size) });
    } else {
      unsafe { free_large(ptr, size) };
    }

    self.inner.stats.record_free(size);
  }

  pub fn stats(&self) -> PoolStats {
    self.inner.stats.snapshot()
  }

  /// Restarts every counter at zero. Frees of blocks allocated earlier never take
  /// `current_bytes` below zero.
  pub fn reset_stats(&self) {
    self.inner.stats.reset();
  }

  pub fn central_cache(&self) -> &Arc<CentralCache> {
    &self.inner.central
  }

  pub fn page_cache(&self) -> &Arc<PageCache> {
    self.inner.central.page_cache()
  }

  /// Runs `f` on the calling thread's cache for this pool.
  fn with_thread_cache<R>(&self, f: impl FnOnce(&mut ThreadCache) -> R) -> R {
    let central = &self.inner.central;
    let tiers = Arc::as_ptr(&self.inner);

    // TLS may already be destroyed while the thread exits.
    if CACHES.try_with(|_| ()).is_err() {
      let mut cache = ThreadCache::new(Arc::clone(central));
      return f(&mut cache);
    }

    CACHES.with(|caches| {
      let mut caches = caches.borrow_mut();
      // A weak entry keeps its allocation, so a live address cannot be reused by a new pool.
      let pos = match caches.iter().position(|e| e.tiers.as_ptr() == tiers) {
        Some(pos) => pos,
        None => {
          // Entries of dropped pools flush back to their own tiers, which then go away.
          caches.retain(|e| e.tiers.strong_count() > 0);
          caches.push(CacheEntry {
            tiers: Arc::downgrade(&self.inner),
            cache: ThreadCache::new(Arc::clone(central)),
          });
          caches.len() - 1
        }
      };
      f(&mut caches[pos].cache)
    })
  }
}

impl Default for Pool {
  fn default() -> Self {
    Self::new()
  }
}

/// Allocates from the global pool. See [`Pool::allocate`].
pub fn allocate(size: usize) -> Result<NonNull<u8>, PoolError> {
  Pool::global().allocate(size)
}

/// Frees into the global pool. See [`Pool::deallocate`].
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
  unsafe { Pool::global().deallocate(ptr, size) }
}

// =============================================================================
// Large objects
// =============================================================================

fn large_layout(size: usize) -> Layout {
  match Layout::from_size_align(size, LARGE_ALIGN) {
    Ok(layout) => layout,
    Err(_) => panic!("allocation of {size} bytes exceeds the addressable maximum"),
  }
}

fn alloc_large(size: usize) -> Result<NonNull<u8>, PoolError> {
  let ptr = unsafe { System.alloc(large_layout(size)) };
  NonNull::new(ptr).ok_or(PoolError::SystemExhausted { size })
}

unsafe fn free_large(ptr: NonNull<u8>, size: usize) {
  unsafe { System.dealloc(ptr.as_ptr(), large_layout(size)) }
}

// =============================================================================
// C API (enabled with --features c_api)
// =============================================================================

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cmpool_alloc(size: usize) -> *mut u8 {
  if size == 0 {
    return core::ptr::null_mut();
  }
  allocate(size).map_or(core::ptr::null_mut(), NonNull::as_ptr)
}

#[cfg(feature = "c_api")]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn cmpool_free(ptr: *mut u8, size: usize) {
  if let Some(ptr) = NonNull::new(ptr)
    && size != 0
  {
    unsafe { deallocate(ptr, size) }
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}

/// The page map lost track of `page`. Nothing sane can follow.
#[cold]
pub(crate) fn page_map_corrupted(page: PageId, context: &'static str) -> ! {
  tracing::error!(page = page.0, context, "page has no owning span, page map is corrupted");
  std::process::abort()
}
