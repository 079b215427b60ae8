use sirocco::prelude::*;

#[test]
fn forward_chain_sums() {
    let _ = env_logger::builder().is_test(true).try_init();
    let graph = PipeGraph::new("forward_chain");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter(1..=1000i64))
        .chain(Map::new(|x: i64| x + 1))
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 1000);
    assert_eq!(res.iter().sum::<i64>(), 501_500);
}

#[test]
fn matching_parallelism_chains_pairwise() {
    let graph = PipeGraph::new("pairwise");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..10_000u64))
        .chain(Map::new(|x: u64| x * 2).with_parallelism(2))
        .chain(Map::new(|x: u64| x + 1).with_parallelism(2))
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 10_000);
    assert_eq!(res.iter().sum::<u64>(), (0..10_000u64).map(|x| x * 2 + 1).sum::<u64>());
}

#[test]
fn flatmap_and_filter() {
    let graph = PipeGraph::new("flatmap_filter");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..100u64))
        .chain(FlatMap::new(|x: u64, shipper: &mut Shipper<'_, u64>| {
            shipper.push(x);
            shipper.push(x + 1000);
        }))
        .chain(Filter::new(|x: &u64| x % 2 == 0))
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 100);
    let expected: u64 = (0..100u64)
        .flat_map(|x| [x, x + 1000])
        .filter(|x| x % 2 == 0)
        .sum();
    assert_eq!(res.iter().sum::<u64>(), expected);
}

#[test]
fn closing_runs_once_per_replica() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let closed = Arc::new(AtomicUsize::new(0));
    let graph = PipeGraph::new("closing");
    let (sink, output) = collect_sink();
    let counter = closed.clone();
    graph
        .add_source(Source::from_iter(0..10u64))
        .chain(
            Map::new(|x: u64| x)
                .with_parallelism(3)
                .with_closing(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
        )
        .chain_sink(sink);
    graph.run();
    assert_eq!(output.get().len(), 10);
    assert_eq!(closed.load(std::sync::atomic::Ordering::SeqCst), 3);
}

#[test]
fn ingress_time_pipeline_delivers_everything() {
    let config = GraphConfig::default().time_policy(TimePolicy::IngressTime);
    let graph = PipeGraph::with_config("ingress", config);
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::new(|ctx: &mut SourceContext<'_, u64>| {
            for i in 0..1000u64 {
                ctx.emit(i);
            }
        }))
        .chain(Map::new(|x: u64| x).with_parallelism(2))
        .chain_sink(sink);
    graph.run();
    assert_eq!(output.get().len(), 1000);
}

#[test]
fn sharded_source_replicas() {
    let graph = PipeGraph::new("sharded_source");
    let (sink, output) = collect_sink();
    graph
        .add_source(
            Source::new(|ctx: &mut SourceContext<'_, u64>| {
                let (replica, parallelism) = (ctx.replica() as u64, ctx.parallelism() as u64);
                let mut i = replica;
                while i < 1000 {
                    ctx.emit_ts(i, i);
                    i += parallelism;
                }
            })
            .with_parallelism(4),
        )
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 1000);
    assert_eq!(res.iter().sum::<u64>(), 499_500);
}
