use sirocco::prelude::*;

fn timestamped_source() -> Source<u64, impl FnMut(&mut SourceContext<'_, u64>) + Clone + Send + 'static>
{
    Source::new(|ctx: &mut SourceContext<'_, u64>| {
        for i in 0..5_000u64 {
            ctx.set_next_watermark(i);
            ctx.emit_ts(i, i);
        }
    })
}

fn run_mode(mode: ExecutionMode) -> Vec<u64> {
    let config = GraphConfig::default()
        .execution_mode(mode)
        .probabilistic_slack(100);
    let graph = PipeGraph::with_config("modes", config);
    let (sink, output) = collect_sink();
    graph
        .add_source(timestamped_source())
        .chain(Map::new(|x: u64| x * 3 + 1).with_parallelism(3))
        .chain_sink(sink);
    graph.run();
    output.get()
}

#[test]
fn deterministic_merges_by_timestamp() {
    let res = run_mode(ExecutionMode::Deterministic);
    // the sink merges its channels in timestamp order, so the output is the
    // input order itself
    let expected: Vec<u64> = (0..5_000u64).map(|x| x * 3 + 1).collect();
    assert_eq!(res, expected);
}

#[test]
fn deterministic_runs_are_identical() {
    let first = run_mode(ExecutionMode::Deterministic);
    let second = run_mode(ExecutionMode::Deterministic);
    assert_eq!(first, second);
}

#[test]
fn probabilistic_preserves_the_multiset() {
    let mut res = run_mode(ExecutionMode::Probabilistic);
    res.sort_unstable();
    let expected: Vec<u64> = (0..5_000u64).map(|x| x * 3 + 1).collect();
    assert_eq!(res, expected);
}

#[test]
fn default_preserves_the_multiset() {
    let mut res = run_mode(ExecutionMode::Default);
    res.sort_unstable();
    let expected: Vec<u64> = (0..5_000u64).map(|x| x * 3 + 1).collect();
    assert_eq!(res, expected);
}

#[test]
fn deterministic_windows_are_reproducible() {
    let run = || {
        let config = GraphConfig::default().execution_mode(ExecutionMode::Deterministic);
        let graph = PipeGraph::with_config("det_windows", config);
        let (sink, output) = collect_sink();
        graph
            .add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
                for i in 0..2_000u64 {
                    ctx.set_next_watermark(i * 50);
                    ctx.emit_ts((i % 5, i), i * 50);
                }
            }))
            .chain(
                KeyedWindows::new(
                    |t: &(u64, u64)| t.0,
                    0u64,
                    |acc: &mut u64, t: &(u64, u64)| *acc += t.1,
                )
                .with_tb_windows(2_000, 1_000)
                .with_parallelism(3),
            )
            .chain_sink(sink);
        graph.run();
        output.get()
    };
    let first = run();
    assert!(!first.is_empty());
    assert_eq!(first, run());
}
