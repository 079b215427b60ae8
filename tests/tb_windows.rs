use sirocco::prelude::*;

#[test]
fn tb_windows_fire_in_order() {
    let graph = PipeGraph::new("tb_windows");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
            for i in 0..100u64 {
                let ts = i * 100;
                ctx.set_next_watermark(ts);
                ctx.emit_ts((0, 1), ts);
            }
        }))
        .chain(
            KeyedWindows::new(
                |t: &(u64, u64)| t.0,
                0u64,
                |acc: &mut u64, _t: &(u64, u64)| *acc += 1,
            )
            .with_tb_windows(1000, 1000),
        )
        .chain_sink(sink);
    graph.run();
    let res = output.get();
    assert_eq!(res.len(), 10);
    assert!(res.iter().all(|&(key, count)| key == 0 && count == 10));
}

#[test]
fn tb_lateness_counts_dead_tuples_as_ignored() {
    let graph = PipeGraph::new("tb_lateness");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
            for i in 0..100u64 {
                let ts = i * 100;
                ctx.set_next_watermark(ts);
                ctx.emit_ts((0, 1), ts);
            }
            // behind the frontier, and the [0, 1000) window fired when the
            // watermark passed 1500: dead on arrival
            ctx.emit_ts((0, 1), 350);
        }))
        .chain(
            KeyedWindows::new(
                |t: &(u64, u64)| t.0,
                0u64,
                |acc: &mut u64, _t: &(u64, u64)| *acc += 1,
            )
            .with_tb_windows(1000, 1000)
            .with_lateness(500)
            .with_name("windows"),
        )
        .chain_sink(sink);
    let summary = graph.run();
    let res = output.get();
    assert_eq!(res.len(), 10);
    assert!(res.iter().all(|&(key, count)| key == 0 && count == 10));
    assert_eq!(summary.operator("windows").unwrap().ignored_tuples(), 1);
}

#[test]
fn tb_lateness_keeps_windows_open_for_stragglers() {
    let graph = PipeGraph::new("tb_straggler");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
            for i in 0..20u64 {
                let ts = i * 100;
                ctx.set_next_watermark(ts);
                ctx.emit_ts((0, 1), ts);
            }
            // frontier is 1900; with lateness 500 the [1000, 2000) window
            // has not fired yet and still accepts this tuple
            ctx.emit_ts((0, 1), 1400);
        }))
        .chain(
            KeyedWindows::new(
                |t: &(u64, u64)| t.0,
                0u64,
                |acc: &mut u64, _t: &(u64, u64)| *acc += 1,
            )
            .with_tb_windows(1000, 1000)
            .with_lateness(500)
            .with_name("windows"),
        )
        .chain_sink(sink);
    let summary = graph.run();
    let mut counts: Vec<u64> = output.get().into_iter().map(|(_, c)| c).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![10, 11]);
    assert_eq!(summary.operator("windows").unwrap().ignored_tuples(), 0);
}

#[test]
fn ffat_tb_matches_keyed_windows() {
    let run_ffat = |ffat: bool| -> Vec<(u64, u64)> {
        let graph = PipeGraph::new(if ffat { "tb_ffat" } else { "tb_plain" });
        let (sink, output) = collect_sink();
        let pipe = graph.add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
            for i in 0..100u64 {
                let ts = i * 100;
                ctx.set_next_watermark(ts);
                ctx.emit_ts((i % 2, 1), ts);
            }
        }));
        if ffat {
            pipe.chain(
                FfatAggregator::new(
                    |t: &(u64, u64)| t.0,
                    |t: &(u64, u64)| t.1,
                    |a: &u64, b: &u64| a + b,
                )
                .with_tb_windows(1000, 500)
                .with_parallelism(2),
            )
            .chain_sink(sink);
        } else {
            pipe.chain(
                KeyedWindows::new(
                    |t: &(u64, u64)| t.0,
                    0u64,
                    |acc: &mut u64, t: &(u64, u64)| *acc += t.1,
                )
                .with_tb_windows(1000, 500)
                .with_parallelism(2),
            )
            .chain_sink(sink);
        }
        graph.run();
        let mut res = output.get();
        res.sort_unstable();
        res
    };
    let plain = run_ffat(false);
    assert_eq!(run_ffat(true), plain);
    assert!(!plain.is_empty());
}

#[test]
fn quantum_aligns_the_panes() {
    let graph = PipeGraph::new("quantum");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::new(|ctx: &mut SourceContext<'_, (u64, u64)>| {
            for i in 0..100u64 {
                let ts = i * 100;
                ctx.set_next_watermark(ts);
                ctx.emit_ts((0, 1), ts);
            }
        }))
        .chain(
            FfatAggregator::new(
                |t: &(u64, u64)| t.0,
                |t: &(u64, u64)| t.1,
                |a: &u64, b: &u64| a + b,
            )
            .with_tb_windows(2000, 1000)
            .with_quantum(500),
        )
        .chain_sink(sink);
    graph.run();
    // windows [0, 2000), [1000, 3000), ..., [9000, 11000)
    let mut counts: Vec<u64> = output.get().into_iter().map(|(_, c)| c).collect();
    counts.sort_unstable();
    let mut expected: Vec<u64> = (0..=9u64)
        .map(|k| {
            let (start, end) = (k * 1000, k * 1000 + 2000);
            (0..100u64).filter(|i| i * 100 >= start && i * 100 < end).count() as u64
        })
        .collect();
    expected.sort_unstable();
    assert_eq!(counts, expected);
}
