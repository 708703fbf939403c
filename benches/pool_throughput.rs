use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use std::{hint::black_box, thread};

const OPS: u64 = 100_000;

/// cmpool alloc/free throughput.
fn pool_alloc_free(pool: &cmpool::Pool, size: usize) {
  for _ in 0..OPS {
    let ptr = pool.allocate(size).unwrap();
    black_box(ptr);
    unsafe { pool.deallocate(ptr, size) };
  }
}

/// libc alloc/free throughput.
fn libc_malloc_free(size: usize) {
  for _ in 0..OPS {
    unsafe {
      let ptr = libc::malloc(size);
      black_box(ptr);
      libc::free(ptr);
    }
  }
}

fn benchmark_pool_throughput(c: &mut Criterion) {
  let mut group = c.benchmark_group("pool_throughput");
  let pool = cmpool::Pool::new();

  for size in [16, 64, 256, 1024, 4096, 65536] {
    group.throughput(Throughput::Elements(OPS));

    group.bench_with_input(BenchmarkId::new("cmpool", size), &size, |b, &size| {
      b.iter(|| pool_alloc_free(&pool, size))
    });

    group.bench_with_input(BenchmarkId::new("libc", size), &size, |b, &size| {
      b.iter(|| libc_malloc_free(size))
    });
  }

  group.finish();
}

/// Several threads each holding a window of live blocks, so batches move between tiers.
fn benchmark_contended(c: &mut Criterion) {
  const THREADS: usize = 4;
  const WINDOW: usize = 1024;

  let mut group = c.benchmark_group("contended");
  group.throughput(Throughput::Elements(OPS * THREADS as u64));
  let pool = cmpool::Pool::new();

  group.bench_function("cmpool_4_threads_64B", |b| {
    b.iter(|| {
      thread::scope(|s| {
        for _ in 0..THREADS {
          s.spawn(|| {
            let mut live = Vec::with_capacity(WINDOW);
            for i in 0..OPS as usize {
              live.push(pool.allocate(64).unwrap());
              if i % WINDOW == WINDOW - 1 {
                for ptr in live.drain(..) {
                  unsafe { pool.deallocate(ptr, 64) };
                }
              }
            }
            for ptr in live {
              unsafe { pool.deallocate(ptr, 64) };
            }
          });
        }
      })
    })
  });

  group.finish();
}

criterion_group!(benches, benchmark_pool_throughput, benchmark_contended);
criterion_main!(benches);
