use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use sirocco::prelude::*;

fn forward_chain(c: &mut Criterion) {
    let mut group = c.benchmark_group("forward_chain");
    for &n in &[10_000u64, 100_000] {
        group.throughput(Throughput::Elements(n));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, &n| {
            b.iter(|| {
                let graph = PipeGraph::new("bench");
                let (sink, output) = collect_sink();
                graph
                    .add_source(Source::from_iter(0..n).with_output_batch_size(256))
                    .chain(
                        Map::new(|x: u64| x.wrapping_mul(0x9e3779b9))
                            .with_output_batch_size(256),
                    )
                    .chain_sink(sink);
                graph.run();
                output.get().len()
            })
        });
    }
    group.finish();
}

fn keyed_windows(c: &mut Criterion) {
    let mut group = c.benchmark_group("keyed_windows");
    let n = 50_000u64;
    group.throughput(Throughput::Elements(n));
    group.bench_function("cb_sum", |b| {
        b.iter(|| {
            let graph = PipeGraph::new("bench");
            let (sink, output) = collect_sink();
            graph
                .add_source(
                    Source::from_iter((0..n).map(|i| (i % 64, i))).with_output_batch_size(256),
                )
                .chain(
                    KeyedWindows::new(
                        |t: &(u64, u64)| t.0,
                        0u64,
                        |acc: &mut u64, t: &(u64, u64)| *acc += t.1,
                    )
                    .with_cb_windows(100, 25)
                    .with_parallelism(4)
                    .with_output_batch_size(256),
                )
                .chain_sink(sink);
            graph.run();
            output.get().len()
        })
    });
    group.finish();
}

criterion_group!(benches, forward_chain, keyed_windows);
criterion_main!(benches);
