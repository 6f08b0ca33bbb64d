//! Benchmarks for the request scope lifecycle.
//!
//! Measures the per-request overhead the scope adds on top of the pool:
//! - Cloning a root scope
//! - Clone, lazy transaction, cleanup
//! - Clone, transaction, commit, cleanup
//! - Logging with scope fields into a discarding sink

// Criterion macros generate items without docs - this is expected for benchmarks
// Benchmarks use expect/unwrap for simplicity - panics are acceptable in benchmarks
#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use ctxscope::observability::{LogRecord, LogSink};
use ctxscope::{Logger, MemoryPool, Scope};
use std::hint::black_box;
use std::sync::Arc;

/// Sink that drops every record.
struct NullSink;

impl LogSink for NullSink {
    fn emit(&self, record: &LogRecord) {
        black_box(record);
    }
}

fn root(max_size: usize) -> Scope<MemoryPool> {
    Scope::builder()
        .pool(MemoryPool::new(max_size))
        .logger(Logger::with_sink(Arc::new(NullSink)))
        .build()
}

fn bench_clone(c: &mut Criterion) {
    let root = root(1);
    c.bench_function("scope_clone", |b| {
        b.iter(|| black_box(root.clone()));
    });
}

fn bench_request_cycle(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("request_cycle");

    for commit in [false, true] {
        let root = root(8);
        let label = if commit { "commit" } else { "rollback" };
        group.bench_with_input(BenchmarkId::from_parameter(label), &commit, |b, &commit| {
            b.to_async(&rt).iter(|| async {
                let mut scope = root.clone();
                let mut tx = scope.transaction().await.unwrap();
                tx.put("bench", "value");
                if commit {
                    tx.commit().await.unwrap();
                }
                scope.cleanup().await;
            });
        });
    }

    group.finish();
}

fn bench_logging(c: &mut Criterion) {
    let mut scope = root(1).clone();
    scope.add_log_field("request_id", "0192e0b4-7d3a-7c1e-9f00-000000000000");
    scope.add_log_field("route", "/orders");

    c.bench_function("scope_log_with_fields", |b| {
        b.iter(|| scope.info(black_box("handled request")));
    });
}

criterion_group!(benches, bench_clone, bench_request_cycle, bench_logging);
criterion_main!(benches);
