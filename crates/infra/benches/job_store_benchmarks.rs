use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chrono::{Duration as ChronoDuration, Utc};
use jobforge_core::{Definition, Job, JobUid};
use jobforge_infra::{InMemoryJobStore, JobStore};
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

fn runtime() -> Runtime {
    Builder::new_current_thread().enable_all().build().unwrap()
}

fn job(i: usize) -> Job {
    let now = Utc::now();
    let mut job = Definition {
        uid: JobUid::from(format!("job-{i:06}")),
        job_type: "bench".to_string(),
        max_retries: 3,
        timeout: Duration::from_secs(30),
        data: String::new(),
    }
    .into_job(now)
    .unwrap();
    // Spread due times so half the jobs are ready and half are in the future.
    job.scheduled_at = now + ChronoDuration::seconds(i as i64 % 2 * 3600 - 1800);
    job
}

fn seeded_store(rt: &Runtime, size: usize) -> InMemoryJobStore {
    let store = InMemoryJobStore::new();
    rt.block_on(async {
        for i in 0..size {
            store.create(&job(i)).await.unwrap();
        }
    });
    store
}

fn bench_list_ready(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("list_ready");

    for size in [100, 1_000, 10_000].iter() {
        let store = seeded_store(&rt, *size);
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| {
                let ready = rt.block_on(store.list_ready(Utc::now(), 11)).unwrap();
                black_box(ready);
            });
        });
    }

    group.finish();
}

fn bench_poll_queries(c: &mut Criterion) {
    let rt = runtime();
    let store = seeded_store(&rt, 1_000);
    let mut group = c.benchmark_group("poll_queries");

    group.bench_function("count_running", |b| {
        b.iter(|| black_box(rt.block_on(store.count_running()).unwrap()));
    });
    group.bench_function("next_scheduled_time", |b| {
        b.iter(|| black_box(rt.block_on(store.next_scheduled_time(Utc::now())).unwrap()));
    });

    group.finish();
}

fn bench_execution_cycle(c: &mut Criterion) {
    let rt = runtime();
    let store = seeded_store(&rt, 1_000);
    let mut group = c.benchmark_group("execution_cycle");
    group.sample_size(1000);

    // Claim, complete and persist one job, as the scheduler does per execution.
    group.bench_function("claim_and_complete", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let uid = JobUid::from(format!("job-{:06}", i % 1_000));
            i += 1;
            rt.block_on(async {
                let now = Utc::now();
                let mut job = store.find(&uid).await.unwrap();
                job.state = jobforge_core::JobState::Scheduled;
                job.mark_running("bench", now);
                store.update_execution(&job).await.unwrap();
                job.apply_execution_result("ok".to_string(), None, now);
                store.update_execution(&job).await.unwrap();
            });
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_list_ready,
    bench_poll_queries,
    bench_execution_cycle
);
criterion_main!(benches);
