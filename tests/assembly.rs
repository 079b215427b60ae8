use sirocco::prelude::*;

#[test]
#[should_panic(expected = "parallelism cannot be zero")]
fn zero_parallelism_is_rejected() {
    let graph = PipeGraph::new("bad_parallelism");
    let (sink, _output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..10u64))
        .chain(Map::new(|x: u64| x).with_parallelism(0))
        .chain_sink(sink);
}

#[test]
#[should_panic(expected = "lateness only applies to time-based windows")]
fn lateness_on_cb_windows_is_rejected() {
    let graph = PipeGraph::new("bad_lateness");
    let (sink, _output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..10u64).with_name("src"))
        .chain(
            KeyedWindows::new(|v: &u64| *v, 0u64, |acc: &mut u64, v: &u64| *acc += *v)
                .with_cb_windows(4, 2)
                .with_lateness(100),
        )
        .chain_sink(sink);
}

#[test]
#[should_panic(expected = "multiples of the quantum")]
fn quantum_must_divide_the_window() {
    let graph = PipeGraph::new("bad_quantum");
    let (sink, _output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..10u64))
        .chain(
            FfatAggregator::new(|v: &u64| *v, |v: &u64| *v, |a: &u64, b: &u64| a + b)
                .with_tb_windows(1000, 500)
                .with_quantum(300),
        )
        .chain_sink(sink);
}

#[test]
#[should_panic(expected = "a window specification is required")]
fn missing_window_spec_is_rejected() {
    let graph = PipeGraph::new("no_window_spec");
    let (sink, _output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..10u64))
        .chain(KeyedWindows::new(
            |v: &u64| *v,
            0u64,
            |acc: &mut u64, v: &u64| *acc += *v,
        ))
        .chain_sink(sink);
}

#[test]
#[should_panic(expected = "not terminated by a sink")]
fn dangling_pipe_is_rejected() {
    let graph = PipeGraph::new("dangling");
    let pipe = graph.add_source(Source::from_iter(0..10u64));
    drop(pipe);
    graph.run();
}

#[test]
#[should_panic(expected = "branches that were never used")]
fn unused_split_branch_is_rejected() {
    let graph = PipeGraph::new("unused_branch");
    let (sink, _output) = collect_sink();
    let mut split = graph
        .add_source(Source::from_iter(0..10u64))
        .split(|v: &u64| (*v % 2) as usize, 2);
    split.select(0).chain_sink(sink);
    graph.run();
}

#[test]
#[should_panic(expected = "selected twice")]
fn split_branch_cannot_be_taken_twice() {
    let graph = PipeGraph::new("double_select");
    let mut split = graph
        .add_source(Source::from_iter(0..10u64))
        .split(|v: &u64| (*v % 2) as usize, 2);
    let _first = split.select(0);
    let _second = split.select(0);
}
