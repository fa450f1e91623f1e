//! Concurrent call execution load test
//!
//! Drives many Calls through the local-shell backend concurrently and
//! renders an HTML report, in the teacher's Gatling-style reporting
//! idiom (`dagrunner_engine::bench`).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::sync::Semaphore;

use dagrunner_engine::backend::{BackendContract, InitData};
use dagrunner_engine::bench::{BenchmarkMetrics, BenchmarkReport, ReportConfig};
use dagrunner_engine::backend::LocalShellBackend;
use dagrunner_engine::model::{CallKey, WorkflowId, WorkflowOptions};

struct TestScenario {
    backend: Arc<LocalShellBackend>,
    call_count: u64,
    worker_count: usize,
}

impl TestScenario {
    fn new(call_count: u64, worker_count: usize) -> Self {
        let dir = std::env::temp_dir().join(format!("dagrunner-bench-{}", uuid::Uuid::now_v7()));
        Self {
            backend: Arc::new(LocalShellBackend::new(dir)),
            call_count,
            worker_count,
        }
    }

    async fn run(&self, metrics: Arc<BenchmarkMetrics>) {
        self.backend
            .validate_options(&WorkflowOptions::default())
            .await
            .unwrap();
        let workflow_id = WorkflowId::new();
        let semaphore = Arc::new(Semaphore::new(self.worker_count));
        let mut handles = Vec::new();

        for i in 0..self.call_count {
            let backend = self.backend.clone();
            let semaphore = semaphore.clone();
            let metrics = metrics.clone();
            handles.push(tokio::spawn(async move {
                let enqueued_at = Instant::now();
                let _permit = semaphore.acquire_owned().await.unwrap();
                metrics.schedule_to_start.record(enqueued_at.elapsed());

                let key = CallKey::first_attempt(workflow_id, format!("task-{i}"), None);
                let init = InitData::default();

                let started = Instant::now();
                let bound = backend.prepare_call(&key, &init).await.unwrap();
                let handle = backend.execute(&bound).await.unwrap();
                loop {
                    use dagrunner_engine::backend::PollOutcome;
                    match backend.poll(&handle).await.unwrap() {
                        PollOutcome::StillRunning(_) => {
                            tokio::time::sleep(Duration::from_millis(5)).await;
                        }
                        _ => break,
                    }
                }
                metrics.execution.record(started.elapsed());
                metrics.end_to_end.record(enqueued_at.elapsed());
                metrics.tasks_completed.increment();
                metrics.sample();
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
    }
}

fn bench_concurrent_calls(call_count: u64, worker_count: usize) -> std::io::Result<String> {
    let rt = Runtime::new().unwrap();
    let metrics = Arc::new(BenchmarkMetrics::new(format!(
        "concurrent_workers_{worker_count}"
    )));
    let scenario = TestScenario::new(call_count, worker_count);

    rt.block_on(async {
        scenario.run(metrics.clone()).await;
    });

    let report = BenchmarkReport::new(ReportConfig {
        title: format!("concurrent_workers (workers={worker_count})"),
        ..Default::default()
    });
    report.generate(&metrics)
}

fn main() {
    for worker_count in [4usize, 16, 64] {
        let path = bench_concurrent_calls(500, worker_count).expect("benchmark run failed");
        println!("wrote report to {path}");
    }
}
