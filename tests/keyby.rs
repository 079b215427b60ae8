use itertools::Itertools;
use sirocco::prelude::*;

fn run_keyed(batch: usize) -> Vec<(u64, u64)> {
    let graph = PipeGraph::new(format!("keyby_batch_{}", batch));
    let (sink, output) = collect_sink();
    graph
        .add_source(
            Source::from_iter((0..10_000u64).map(|i| (i % 4, i))).with_output_batch_size(batch),
        )
        .chain(
            Map::new(|t: (u64, u64)| {
                // keyby stability: everything landing here hashes to us
                let replica = replica_coord().unwrap().replica_id as u64;
                assert_eq!(key_hash(&t.0) % 4, replica, "tuple routed to the wrong replica");
                t
            })
            .with_key_by(|t: &(u64, u64)| t.0)
            .with_parallelism(4)
            .with_output_batch_size(batch),
        )
        .chain_sink(sink);
    graph.run();
    output.get()
}

#[test]
fn keyby_partitions_and_sums() {
    let res = run_keyed(0);
    assert_eq!(res.len(), 10_000);
    assert_eq!(res.iter().map(|t| t.1).sum::<u64>(), 49_995_000);
}

#[test]
fn batched_emission_is_equivalent() {
    let unbatched = run_keyed(0).into_iter().sorted().collect_vec();
    let batched = run_keyed(100).into_iter().sorted().collect_vec();
    assert_eq!(unbatched, batched);
}

#[test]
fn same_key_preserves_producer_order() {
    // one source replica, keyed map: per key the arrival order is FIFO
    let graph = PipeGraph::new("keyby_fifo");
    let (sink, output) = collect_sink();
    graph
        .add_source(Source::from_iter((0..5_000u64).map(|i| (i % 8, i))))
        .chain(
            Map::new({
                let mut last_per_key = std::collections::HashMap::<u64, u64>::new();
                move |t: (u64, u64)| {
                    let last = last_per_key.insert(t.0, t.1);
                    assert!(last.map_or(true, |prev| prev < t.1), "reordered within a key");
                    t
                }
            })
            .with_key_by(|t: &(u64, u64)| t.0)
            .with_parallelism(3),
        )
        .chain_sink(sink);
    graph.run();
    assert_eq!(output.get().len(), 5_000);
}
