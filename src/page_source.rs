//! Where pages come from.
//!
//! The page cache only sees [`PageSource`]. Platform specifics stay in this module, and
//! [`OsPageSource`] names the implementation for the current target.

use core::{
  alloc::{GlobalAlloc, Layout},
  fmt,
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};
use std::alloc::System;

use crate::{PAGE_SIZE, error::PoolError};

/// Supplier of page-aligned, committed memory. Nothing is ever given back.
pub trait PageSource: Send + Sync + fmt::Debug {
  /// Maps `count` contiguous pages and returns their base. Contents are unspecified.
  fn request_pages(&self, count: usize) -> Result<NonNull<u8>, PoolError>;
}

#[cfg(unix)]
pub type OsPageSource = MmapPageSource;
#[cfg(windows)]
pub type OsPageSource = VirtualAllocPageSource;
#[cfg(not(any(unix, windows)))]
pub type OsPageSource = SystemPageSource;

fn bytes_for(count: usize) -> Result<usize, PoolError> {
  count
    .checked_mul(PAGE_SIZE)
    .ok_or_else(|| PoolError::out_of_pages(count))
}

// =============================================================================
// Platform
// =============================================================================

/// Anonymous private mappings.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct MmapPageSource;

#[cfg(unix)]
impl PageSource for MmapPageSource {
  fn request_pages(&self, count: usize) -> Result<NonNull<u8>, PoolError> {
    // mmap only guarantees OS page alignment. Over-allocate for alignment padding.
    let bytes = bytes_for(count)?
      .checked_add(PAGE_SIZE)
      .ok_or_else(|| PoolError::out_of_pages(count))?;

    let raw = unsafe {
      libc::mmap(
        core::ptr::null_mut(),
        bytes,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
        -1,
        0,
      )
    };
    if raw == libc::MAP_FAILED {
      return Err(PoolError::PageSource {
        pages: count,
        source: std::io::Error::last_os_error(),
      });
    }

    let aligned = crate::align_up(raw as usize, PAGE_SIZE) as *mut u8;
    NonNull::new(aligned).ok_or_else(|| PoolError::out_of_pages(count))
  }
}

#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct VirtualAllocPageSource;

#[cfg(windows)]
impl PageSource for VirtualAllocPageSource {
  fn request_pages(&self, count: usize) -> Result<NonNull<u8>, PoolError> {
    use winapi::um::{
      memoryapi::VirtualAlloc,
      winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE},
    };

    // Allocation granularity is 64KiB, so the base is already page aligned.
    let raw = unsafe {
      VirtualAlloc(
        core::ptr::null_mut(),
        bytes_for(count)?,
        MEM_COMMIT | MEM_RESERVE,
        PAGE_READWRITE,
      )
    };
    NonNull::new(raw.cast::<u8>()).ok_or_else(|| PoolError::PageSource {
      pages: count,
      source: std::io::Error::last_os_error(),
    })
  }
}

/// Pages carved out of the system allocator with page alignment. Works everywhere.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPageSource;

impl PageSource for SystemPageSource {
  fn request_pages(&self, count: usize) -> Result<NonNull<u8>, PoolError> {
    let layout = Layout::from_size_align(bytes_for(count)?, PAGE_SIZE)
      .map_err(|_| PoolError::out_of_pages(count))?;
    NonNull::new(unsafe { System.alloc(layout) }).ok_or_else(|| PoolError::out_of_pages(count))
  }
}

// =============================================================================
// Instrumentation
// =============================================================================

/// Wraps a source and counts what passes through it.
#[derive(Debug, Default)]
pub struct CountingPageSource<S> {
  inner: S,
  requests: AtomicUsize,
  pages: AtomicUsize,
}

impl<S: PageSource> CountingPageSource<S> {
  pub fn new(inner: S) -> Self {
    Self {
      inner,
      requests: AtomicUsize::new(0),
      pages: AtomicUsize::new(0),
    }
  }

  /// Successful requests so far.
  pub fn requests(&self) -> usize {
    self.requests.load(Ordering::Relaxed)
  }

  /// Pages handed out so far.
  pub fn pages(&self) -> usize {
    self.pages.load(Ordering::Relaxed)
  }
}

impl<S: PageSource> PageSource for CountingPageSource<S> {
  fn request_pages(&self, count: usize) -> Result<NonNull<u8>, PoolError> {
    let base = self.inner.request_pages(count)?;
    self.requests.fetch_add(1, Ordering::Relaxed);
    self.pages.fetch_add(count, Ordering::Relaxed);
    Ok(base)
  }
}
