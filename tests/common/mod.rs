#![allow(dead_code)]

use std::sync::{Arc, Once};

use cmpool::{CountingPageSource, Pool, SystemPageSource};

/// Installs a test-friendly subscriber once. Set `RUST_LOG=cmpool=trace` to see events.
pub fn init_tracing() {
  static INIT: Once = Once::new();
  INIT.call_once(|| {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  });
}

/// Pool over a counting source, so tests can see when pages get mapped.
pub fn counted_pool() -> (Pool, Arc<CountingPageSource<SystemPageSource>>) {
  init_tracing();
  let source = Arc::new(CountingPageSource::new(SystemPageSource));
  (Pool::with_page_source(source.clone()), source)
}
