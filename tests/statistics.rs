use sirocco::prelude::*;

#[test]
fn summary_counts_and_json_files() {
    let dir = tempfile::tempdir().unwrap();
    let config = GraphConfig::default()
        .collect_statistics(true)
        .log_dir(dir.path());
    let graph = PipeGraph::with_config("stats", config);
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter(0..100u64).with_name("gen"))
        .chain(Map::new(|x: u64| x).with_name("ident").with_parallelism(2))
        .chain_sink(sink.with_name("collector"));
    let summary = graph.run();

    assert_eq!(output.get().len(), 100);
    assert_eq!(summary.operator("gen").unwrap().outputs(), 100);
    assert_eq!(summary.operator("ident").unwrap().inputs(), 100);
    assert_eq!(summary.operator("ident").unwrap().outputs(), 100);
    assert_eq!(summary.operator("collector").unwrap().inputs(), 100);
    assert_eq!(summary.operator("ident").unwrap().replicas.len(), 2);

    let pid = std::process::id();
    for name in ["gen", "ident", "collector"] {
        let path = dir.path().join(format!("{}_{}.json", pid, name));
        let content = std::fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&content).unwrap();
        assert_eq!(value["Operator_name"], name);
        assert!(value["Replicas"].is_array());
    }
    let ident = std::fs::read_to_string(dir.path().join(format!("{}_ident.json", pid))).unwrap();
    let ident: serde_json::Value = serde_json::from_str(&ident).unwrap();
    assert_eq!(ident["Operator_type"], "Map");
    assert_eq!(ident["Distribution"], "RESHUFFLE");
    assert_eq!(ident["Parallelism"], 2);
    assert_eq!(ident["isWindowed"], false);
}

#[test]
fn windowed_operators_report_their_shape() {
    let dir = tempfile::tempdir().unwrap();
    let config = GraphConfig::default()
        .collect_statistics(true)
        .log_dir(dir.path());
    let graph = PipeGraph::with_config("windowed_stats", config);
    let (sink, _output) = collect_sink();
    graph
        .add_source(Source::from_iter((0..100u64).map(|i| (i % 2, i))))
        .chain(
            KeyedWindows::new(
                |t: &(u64, u64)| t.0,
                0u64,
                |acc: &mut u64, t: &(u64, u64)| *acc += t.1,
            )
            .with_cb_windows(10, 5)
            .with_name("wins"),
        )
        .chain_sink(sink);
    let summary = graph.run();
    let wins = summary.operator("wins").unwrap();
    assert!(wins.is_windowed);
    assert_eq!(wins.window_type.as_deref(), Some("CB"));
    assert_eq!(wins.window_length, Some(10));
    assert_eq!(wins.window_slide, Some(5));
    assert_eq!(wins.distribution, "KEYBY");
}
