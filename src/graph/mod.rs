//! Graph ownership and execution: a [`PipeGraph`] owns every operator
//! added through its [`MultiPipe`]s and runs one worker thread per replica.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

pub use multipipe::{MultiPipe, SplitPipe};
pub(crate) use multipipe::{Pending, RoutingSpec, StageSpec, WindowMeta};

use crate::config::GraphConfig;
use crate::operator::{run_source, Data, Source, SourceContext};
use crate::replica::{set_replica_coord, CatchPanic, Coord};
use crate::stats::{GraphSummary, OperatorStats, ReplicaStats, StatsCollector};

mod multipipe;

pub(crate) struct Worker {
    pub coord: Coord,
    pub thread_name: String,
    pub body: Box<dyn FnOnce() + Send + 'static>,
}

pub(crate) struct OperatorEntry {
    pub name: String,
    pub op_type: &'static str,
    pub distribution: &'static str,
    pub is_terminated: bool,
    pub window: Option<WindowMeta>,
    pub parallelism: usize,
    pub batch_size: usize,
    pub replicas: Arc<Mutex<Vec<ReplicaStats>>>,
}

pub(crate) struct GraphInner {
    pub config: GraphConfig,
    pub workers: Vec<Worker>,
    pub operators: Vec<OperatorEntry>,
    /// Replicas still waiting for their output side to be wired.
    pub dangling: usize,
    /// Splits with at least one branch not yet chained.
    pub open_splits: usize,
    pub next_op: usize,
}

/// A dataflow graph under construction.
///
/// Pipes start at [`PipeGraph::add_source`], grow with
/// [`MultiPipe::chain`] / [`MultiPipe::split`] / [`MultiPipe::merge`] and
/// terminate with [`MultiPipe::chain_sink`]. [`PipeGraph::run`] starts one
/// worker thread per replica, blocks until the whole graph drained, and
/// returns the statistics snapshot.
///
/// ## Example
///
/// ```
/// use sirocco::prelude::*;
///
/// let graph = PipeGraph::new("doubler");
/// let (sink, output) = collect_sink();
/// graph
///     .add_source(Source::from_iter(0..10i64))
///     .chain(Map::new(|x: i64| x * 2))
///     .chain_sink(sink);
/// graph.run();
/// assert_eq!(output.get(), (0..10).map(|x| x * 2).collect::<Vec<i64>>());
/// ```
pub struct PipeGraph {
    name: String,
    inner: Arc<Mutex<GraphInner>>,
}

impl PipeGraph {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_config(name, GraphConfig::default())
    }

    pub fn with_config(name: impl Into<String>, config: GraphConfig) -> Self {
        PipeGraph {
            name: name.into(),
            inner: Arc::new(Mutex::new(GraphInner {
                config,
                workers: Vec::new(),
                operators: Vec::new(),
                dangling: 0,
                open_splits: 0,
                next_op: 0,
            })),
        }
    }

    /// Root a new pipe at a source operator.
    pub fn add_source<T: Data, F>(&self, source: Source<T, F>) -> MultiPipe<T>
    where
        F: FnMut(&mut SourceContext<'_, T>) + Clone + Send + 'static,
    {
        let (gen, opts) = source.into_parts();
        let mut inner = self.inner.lock();
        assert!(opts.parallelism >= 1, "source parallelism cannot be zero");
        let parallelism = opts.parallelism;
        let op_id = inner.next_op;
        inner.next_op += 1;
        let name = opts
            .name
            .unwrap_or_else(|| format!("source{}", op_id));
        let replicas = Arc::new(Mutex::new(Vec::new()));
        inner.operators.push(OperatorEntry {
            name: name.clone(),
            op_type: "Source",
            distribution: "NONE",
            is_terminated: false,
            window: None,
            parallelism,
            batch_size: opts.batch_size,
            replicas: replicas.clone(),
        });
        let policy = inner.config.time_policy;
        let pendings = (0..parallelism)
            .map(|replica| {
                let gen = gen.clone();
                let closing = opts.closing.clone();
                let stats = StatsCollector::new(replica, replicas.clone());
                let coord = Coord {
                    op_id,
                    replica_id: replica,
                };
                Pending {
                    coord,
                    thread_name: format!("{}-{}", name, replica),
                    finish: Box::new(move |out| {
                        Box::new(move || {
                            run_source(out, gen, policy, replica, parallelism, closing, stats)
                        })
                    }),
                }
            })
            .collect();
        inner.dangling += parallelism;
        drop(inner);
        MultiPipe::direct(self.inner.clone(), pendings)
    }

    /// Start every replica, wait for the graph to drain, and return the
    /// statistics snapshot. Panics if the graph is not fully assembled or a
    /// worker crashed.
    pub fn run(self) -> GraphSummary {
        let PipeGraph { name, inner } = self;
        let (workers, entries, config) = {
            let mut inner = inner.lock();
            assert_eq!(
                inner.open_splits, 0,
                "graph {:?}: a split has branches that were never used",
                name
            );
            assert_eq!(
                inner.dangling, 0,
                "graph {:?}: a pipe is not terminated by a sink",
                name
            );
            (
                mem::take(&mut inner.workers),
                mem::take(&mut inner.operators),
                inner.config.clone(),
            )
        };
        info!("starting graph {:?} with {} replicas", name, workers.len());
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            let Worker {
                coord,
                thread_name,
                body,
            } = worker;
            debug!("starting worker {}", coord);
            let handle = std::thread::Builder::new()
                .name(thread_name)
                .spawn(move || {
                    set_replica_coord(coord);
                    let mut catch_panic = CatchPanic::new(move || error!("worker {} crashed!", coord));
                    body();
                    catch_panic.defuse();
                    debug!("worker {} completed", coord);
                })
                .unwrap();
            handles.push(handle);
        }
        let mut crashed = false;
        for handle in handles {
            crashed |= handle.join().is_err();
        }
        if crashed {
            panic!("graph {:?}: one or more workers crashed", name);
        }
        let operators = entries
            .into_iter()
            .map(|entry| {
                let mut replicas = mem::take(&mut *entry.replicas.lock());
                replicas.sort_by_key(|r| r.replica_id);
                OperatorStats {
                    name: entry.name,
                    op_type: entry.op_type.to_string(),
                    distribution: entry.distribution.to_string(),
                    is_terminated: entry.is_terminated,
                    is_windowed: entry.window.is_some(),
                    window_type: entry.window.as_ref().map(|w| w.kind.to_string()),
                    window_length: entry.window.as_ref().map(|w| w.len),
                    window_slide: entry.window.as_ref().map(|w| w.slide),
                    parallelism: entry.parallelism,
                    output_batch_size: entry.batch_size,
                    replicas,
                }
            })
            .collect();
        let summary = GraphSummary::new(operators);
        if config.statistics {
            summary.dump(&config.resolved_log_dir());
        }
        info!("graph {:?} completed", name);
        summary
    }
}
