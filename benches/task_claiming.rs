//! Call dispatch benchmark
//!
//! Benchmarks the critical path of the Call state machine's durable leg:
//! insert -> dispatch -> running -> succeeded, each a separate
//! persistence transaction (spec.md §4.H). This is the core scheduling
//! performance metric now that dispatch goes through `PersistenceAdapter`
//! rather than a task queue.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tokio::runtime::Runtime;

use dagrunner_engine::call::Call;
use dagrunner_engine::model::{CallKey, WorkflowId};
use dagrunner_engine::persistence::{InMemoryPersistence, PersistenceAdapter};

async fn drive_one_call(store: &InMemoryPersistence, key: CallKey) {
    let mut call = Call::new(key, false);
    store.insert_call(&call).await.unwrap();

    call.dispatch(format!("/tmp/{}", call.key.call_root_segment())).unwrap();
    store.update_call(&call, &[]).await.unwrap();

    call.acknowledge_running(Some("ext-1".into())).unwrap();
    store.update_call(&call, &[]).await.unwrap();

    call.succeed(serde_json::Map::new()).unwrap();
    store.update_call(&call, &[]).await.unwrap();
}

/// Single-threaded call dispatch throughput (baseline).
fn bench_dispatch_single(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("call_dispatch/single");
    group.throughput(Throughput::Elements(1));

    for batch_size in [1, 5, 10] {
        group.bench_with_input(BenchmarkId::new("batch", batch_size), &batch_size, |b, &batch_size| {
            b.to_async(&rt).iter_custom(|iters| async move {
                let store = InMemoryPersistence::new();
                let workflow_id = WorkflowId::new();
                let call_count = (iters * batch_size as u64).max(100);

                let start = Instant::now();
                for i in 0..call_count {
                    let key = CallKey::first_attempt(workflow_id, format!("task-{i}"), None);
                    drive_one_call(&store, key).await;
                }
                start.elapsed()
            });
        });
    }

    group.finish();
}

/// Concurrent call dispatch (contention on the in-memory store's lock).
fn bench_dispatch_concurrent(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("call_dispatch/concurrent");
    group.sample_size(20);

    for workers in [2, 4, 8] {
        let call_count = 2000u64;
        group.throughput(Throughput::Elements(call_count));
        group.bench_with_input(BenchmarkId::new("workers", workers), &workers, |b, &workers| {
            b.to_async(&rt).iter(|| async {
                let store = Arc::new(InMemoryPersistence::new());
                let workflow_id = WorkflowId::new();
                let dispatched = Arc::new(AtomicU64::new(0));

                let mut handles = Vec::new();
                for worker_id in 0..workers {
                    let store = store.clone();
                    let dispatched = dispatched.clone();
                    handles.push(tokio::spawn(async move {
                        loop {
                            let i = dispatched.fetch_add(1, Ordering::Relaxed);
                            if i >= call_count {
                                break;
                            }
                            let key = CallKey::first_attempt(workflow_id, format!("w{worker_id}-task-{i}"), None);
                            drive_one_call(&store, key).await;
                        }
                    }));
                }
                for handle in handles {
                    handle.await.unwrap();
                }
            });
        });
    }

    group.finish();
}

/// Insert-only latency (the first write in a Call's lifetime).
fn bench_insert(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("call_dispatch/insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single", |b| {
        b.to_async(&rt).iter_custom(|iters| async move {
            let store = InMemoryPersistence::new();
            let workflow_id = WorkflowId::new();

            let start = Instant::now();
            for i in 0..iters {
                let key = CallKey::first_attempt(workflow_id, format!("task-{i}"), None);
                let call = Call::new(key, false);
                store.insert_call(&call).await.unwrap();
            }
            start.elapsed()
        });
    });

    group.finish();
}

criterion_group!(benches, bench_dispatch_single, bench_dispatch_concurrent, bench_insert);
criterion_main!(benches);
