//! Benchmarks for pipeline execution.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use flowline::prelude::*;
use flowline::testing::{branch_flow, linear_flow};
use serde_json::{json, Value};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
}

fn offer_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("offer");

    for batch in [1usize, 16, 128] {
        let pipeline = PipelineBuilder::<Value>::new(linear_flow(), FlowServices::in_memory())
            .build()
            .unwrap();
        let payloads: Vec<Value> = (0..batch).map(|n| json!({"n": n})).collect();

        group.bench_with_input(BenchmarkId::new("linear", batch), &payloads, |b, payloads| {
            b.to_async(&rt)
                .iter(|| async { black_box(pipeline.offer(payloads.clone()).await.unwrap()) });
        });
    }
    group.finish();
}

fn routing_benchmark(c: &mut Criterion) {
    let rt = runtime();
    let pipeline = PipelineBuilder::<Value>::new(branch_flow(), FlowServices::in_memory())
        .build()
        .unwrap();

    c.bench_function("offer/branch", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(
                pipeline
                    .offer(vec![json!({"bool1": true}), json!({"bool1": false})])
                    .await
                    .unwrap(),
            )
        });
    });
}

criterion_group!(benches, offer_benchmark, routing_benchmark);
criterion_main!(benches);
