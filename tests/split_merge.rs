use sirocco::prelude::*;

#[test]
fn split_select_merge_preserves_the_stream() {
    let graph = PipeGraph::new("split_merge");
    let (sink, output) = collect_sink();
    let mut split = graph
        .add_source(Source::from_iter(0..1000i64))
        .split(|v: &i64| (*v % 2) as usize, 2);
    let evens = split
        .select(0)
        .chain(Map::new(|x: i64| x).with_parallelism(2).with_name("evens"));
    let odds = split
        .select(1)
        .chain(Map::new(|x: i64| x).with_parallelism(3).with_name("odds"));
    evens.merge(odds).chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 1000);
    assert_eq!(res.iter().sum::<i64>(), 499_500);
}

#[test]
fn split_routes_by_selector() {
    let graph = PipeGraph::new("split_routes");
    let (even_sink, even_out) = collect_sink();
    let (odd_sink, odd_out) = collect_sink();
    let mut split = graph
        .add_source(Source::from_iter(0..1000u64))
        .split(|v: &u64| (*v % 2) as usize, 2);
    split.select(0).chain_sink(even_sink);
    split.select(1).chain_sink(odd_sink);
    graph.run();
    let evens = even_out.get();
    let odds = odd_out.get();
    assert_eq!(evens.len(), 500);
    assert_eq!(odds.len(), 500);
    assert!(evens.iter().all(|v| v % 2 == 0));
    assert!(odds.iter().all(|v| v % 2 == 1));
}

#[test]
fn merge_feeds_every_upstream_channel() {
    let graph = PipeGraph::new("merge_many");
    let (sink, output) = collect_sink();
    let left = graph
        .add_source(Source::from_iter(0..500u64))
        .chain(Map::new(|x: u64| x).with_parallelism(2));
    let right = graph
        .add_source(Source::from_iter(500..1000u64))
        .chain(Map::new(|x: u64| x).with_parallelism(3));
    left.merge(right)
        .chain(Map::new(|x: u64| x + 1).with_parallelism(2))
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 1000);
    assert_eq!(res.iter().sum::<u64>(), (1..=1000u64).sum::<u64>());
}

#[test]
fn broadcast_reaches_every_window_replica() {
    // parallel windows receive by broadcast; every replica observes the
    // whole stream or the window ownership would break
    let graph = PipeGraph::new("broadcast");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter(1..=100u64))
        .chain(
            ParallelWindows::new(0u64, |acc: &mut u64, v: &u64| *acc += *v)
                .with_cb_windows(10, 10)
                .with_parallelism(4),
        )
        .chain_sink(sink);
    graph.run();
    let mut res = output.get();
    res.sort_unstable();
    let mut expected: Vec<u64> = (0..10u64)
        .map(|w| (w * 10 + 1..=w * 10 + 10).sum())
        .collect();
    expected.sort_unstable();
    assert_eq!(res, expected);
}
