// Copyright (C) 2026-present The rcaflow Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput};
use rcaflow_metricsdb::{
    sample::{dimensions, DimensionKey, MetricValues},
    store::WindowedMetricStore,
};
use std::{hint::black_box, time::Duration};

/// Helper to create an OS metrics row similar to what a node reports per
/// thread
fn os_metrics() -> MetricValues {
    [
        ("CPU_Utilization", 100.0),
        ("Paging_MajfltRate", 100.0),
        ("Paging_MinfltRate", 13223.323243),
        ("Paging_RSS", 444.0),
        ("Sched_Runtime", 22222.0),
        ("Sched_Waittime", 2132134.0),
        ("Sched_CtxRate", 3243.21321),
        ("Heap_AllocRate", 32432.324),
        ("IO_ReadThroughput", 23432.0),
        ("IO_WriteThroughput", 32432432.0),
        ("IO_TotThroughput", 32423.0),
        ("IO_ReadSyscallRate", 234324.3432),
        ("IO_WriteSyscallRate", 324323432.0),
        ("IO_TotalSyscallRate", 2342343223.0),
        ("Thread_Blocked_Time", 23432.32432),
        ("Thread_Blocked_Event", 23432.32432),
        ("Thread_Waited_Time", 23432.32432),
        ("Thread_Waited_Event", 23432.32432),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v))
    .collect()
}

fn thread_keys(count: usize) -> Vec<DimensionKey> {
    (0..count)
        .map(|tid| dimensions([("tid", format!("{tid}")), ("tName", "GC".to_string())]))
        .collect()
}

fn bench_batch_insert(c: &mut Criterion) {
    let metrics = os_metrics();
    let mut group = c.benchmark_group("batch_insert");
    for rows in [100usize, 1_000, 10_000, 100_000] {
        let keys = thread_keys(rows);
        group.throughput(Throughput::Elements(rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &keys, |b, keys| {
            b.iter_batched(
                || WindowedMetricStore::new(Duration::from_secs(5)).unwrap(),
                |store| {
                    let window = store.window_for(1).unwrap();
                    let batch = window.start_batch().unwrap();
                    for key in keys {
                        batch.put_metric(key.clone(), metrics.clone(), 1).unwrap();
                    }
                    black_box(batch.commit().unwrap())
                },
                BatchSize::LargeInput,
            )
        });
    }
    group.finish();
}

fn bench_concurrent_writers(c: &mut Criterion) {
    const WRITERS: usize = 3;
    const ROWS_PER_WRITER: usize = 10_000;

    let metrics = os_metrics();
    let keys = thread_keys(ROWS_PER_WRITER);
    let mut group = c.benchmark_group("concurrent_batch_insert");
    group.throughput(Throughput::Elements((WRITERS * ROWS_PER_WRITER) as u64));
    group.sample_size(10);
    group.bench_function("3x10000", |b| {
        b.iter_batched(
            || WindowedMetricStore::new(Duration::from_secs(5)).unwrap(),
            |store| {
                let window = store.window_for(1).unwrap();
                let batch = window.start_batch().unwrap();
                std::thread::scope(|scope| {
                    for _ in 0..WRITERS {
                        let batch = &batch;
                        let keys = &keys;
                        let metrics = &metrics;
                        scope.spawn(move || {
                            for key in keys {
                                batch.put_metric(key.clone(), metrics.clone(), 1).unwrap();
                            }
                        });
                    }
                });
                black_box(batch.commit().unwrap())
            },
            BatchSize::LargeInput,
        )
    });
    group.finish();
}

criterion_group!(benches, bench_batch_insert, bench_concurrent_writers);
criterion_main!(benches);
