use std::io;

use thiserror::Error;

/// Recoverable allocation failures. Contract violations panic instead.
#[derive(Debug, Error)]
pub enum PoolError {
  #[error("page source could not supply {pages} pages")]
  PageSource {
    pages: usize,
    #[source]
    source: io::Error,
  },

  #[error("system allocator refused a {size}-byte block")]
  SystemExhausted { size: usize },

  #[error("central cache produced no {size}-byte objects")]
  Exhausted { size: usize },
}

impl PoolError {
  pub(crate) fn out_of_pages(pages: usize) -> Self {
    Self::PageSource {
      pages,
      source: io::ErrorKind::OutOfMemory.into(),
    }
  }
}
