//! The pipe-construction DSL: chaining, splitting, selecting and merging,
//! plus the edge-wiring logic choosing channels and emitter kinds.

use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::channel::{self, CHANNEL_CAPACITY};
use crate::config::ExecutionMode;
use crate::emitter::{Emitter, EmitterSet, Routing, SplitEmitter};
use crate::graph::{GraphInner, OperatorEntry, Worker};
use crate::input::Input;
use crate::message::{BatchPool, MessageSender};
use crate::operator::{Chainable, CommonOpts, Data, Sink, SinkStage};
use crate::replica::{run_stage, Coord, StageLogic};
use crate::stats::StatsCollector;

/// A replica whose input side is wired but whose output side is not: it
/// becomes a worker as soon as the next stage hands it an emitter.
pub(crate) struct Pending<T> {
    pub coord: Coord,
    pub thread_name: String,
    pub finish: Box<dyn FnOnce(EmitterSet<T>) -> Box<dyn FnOnce() + Send + 'static> + Send + 'static>,
}

/// Input-routing requirement an operator declares for its edge.
pub(crate) enum RoutingSpec<I> {
    /// No requirement: forward when the shapes line up, reshuffle otherwise.
    Any,
    KeyBy(Arc<dyn Fn(&I) -> u64 + Send + Sync>),
    Broadcast,
}

#[derive(Clone, Copy, Debug)]
pub(crate) struct WindowMeta {
    pub kind: &'static str,
    pub len: u64,
    pub slide: u64,
}

/// Everything a builder hands over to wire one stage.
pub(crate) struct StageSpec<I, O> {
    op_type: &'static str,
    name: Option<String>,
    parallelism: usize,
    batch_size: usize,
    routing: RoutingSpec<I>,
    window: Option<WindowMeta>,
    logics: Vec<Box<dyn StageLogic<I, O>>>,
}

impl<I: Data, O: Data> StageSpec<I, O> {
    pub(crate) fn new(
        op_type: &'static str,
        name: Option<String>,
        parallelism: usize,
        batch_size: usize,
        routing: RoutingSpec<I>,
        window: Option<WindowMeta>,
        logics: Vec<Box<dyn StageLogic<I, O>>>,
    ) -> Self {
        StageSpec {
            op_type,
            name,
            parallelism,
            batch_size,
            routing,
            window,
            logics,
        }
    }

    pub(crate) fn unary(
        op_type: &'static str,
        opts: CommonOpts<I>,
        logics: Vec<Box<dyn StageLogic<I, O>>>,
    ) -> Self {
        let routing = match opts.key_route {
            Some(route) => RoutingSpec::KeyBy(route),
            None => RoutingSpec::Any,
        };
        Self::new(
            op_type,
            opts.name,
            opts.parallelism,
            opts.batch_size,
            routing,
            None,
            logics,
        )
    }
}

pub(crate) enum OutputGroup<T: Data> {
    Direct(Vec<Pending<T>>),
    Branch {
        state: Arc<Mutex<SplitState<T>>>,
        branch: usize,
    },
}

/// Book-keeping of a `split` whose branches are not all chained yet. The
/// upstream replicas stay parked here until every branch contributed its
/// emitters.
pub(crate) struct SplitState<T: Data> {
    upstream: Vec<Pending<T>>,
    selector: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    branches: Vec<Option<Vec<Emitter<T>>>>,
}

/// A bundle of parallel stream outputs flowing towards the next operator.
///
/// See [`PipeGraph`](crate::PipeGraph) for the construction entry point.
pub struct MultiPipe<T: Data> {
    graph: Arc<Mutex<GraphInner>>,
    groups: Vec<OutputGroup<T>>,
}

/// The branches of a [`MultiPipe::split`]; take each one with
/// [`SplitPipe::select`].
pub struct SplitPipe<T: Data> {
    graph: Arc<Mutex<GraphInner>>,
    state: Arc<Mutex<SplitState<T>>>,
    taken: Vec<bool>,
}

impl<T: Data> SplitPipe<T> {
    /// The `branch`-th output pipe of the split. Each branch can be taken
    /// exactly once.
    pub fn select(&mut self, branch: usize) -> MultiPipe<T> {
        assert!(
            branch < self.taken.len(),
            "split branch {} out of range ({} branches)",
            branch,
            self.taken.len()
        );
        assert!(!self.taken[branch], "split branch {} selected twice", branch);
        self.taken[branch] = true;
        MultiPipe {
            graph: self.graph.clone(),
            groups: vec![OutputGroup::Branch {
                state: self.state.clone(),
                branch,
            }],
        }
    }
}

impl<T: Data> MultiPipe<T> {
    pub(crate) fn direct(graph: Arc<Mutex<GraphInner>>, pendings: Vec<Pending<T>>) -> Self {
        MultiPipe {
            graph,
            groups: vec![OutputGroup::Direct(pendings)],
        }
    }

    /// Append an operator to this pipe.
    pub fn chain<C: Chainable<T>>(self, op: C) -> MultiPipe<C::Out> {
        op.attach(self)
    }

    /// Terminate this pipe with a sink.
    pub fn chain_sink<F>(self, sink: Sink<T, F>)
    where
        F: FnMut(Option<T>) + Clone + Send + 'static,
    {
        let (f, opts) = sink.into_parts();
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                Box::new(SinkStage::new(Box::new(f.clone()), opts.closing.clone()))
                    as Box<dyn StageLogic<T, T>>
            })
            .collect();
        let routing = match opts.key_route {
            Some(route) => RoutingSpec::KeyBy(route),
            None => RoutingSpec::Any,
        };
        let spec = StageSpec::new(
            "Sink",
            opts.name,
            opts.parallelism,
            0,
            routing,
            None,
            logics,
        );
        self.wire(spec, true);
    }

    /// Fan this pipe out into `branches` pipes; each tuple goes to the
    /// branch the selector returns.
    pub fn split<F>(self, selector: F, branches: usize) -> SplitPipe<T>
    where
        F: Fn(&T) -> usize + Send + Sync + 'static,
    {
        assert!(branches >= 1, "split needs at least one branch");
        let MultiPipe { graph, groups } = self;
        let mut pendings = Vec::new();
        for group in groups {
            match group {
                OutputGroup::Direct(v) => pendings.extend(v),
                OutputGroup::Branch { .. } => {
                    panic!("chain an operator between two consecutive splits")
                }
            }
        }
        graph.lock().open_splits += 1;
        let state = Arc::new(Mutex::new(SplitState {
            upstream: pendings,
            selector: Arc::new(selector),
            branches: (0..branches).map(|_| None).collect(),
        }));
        SplitPipe {
            graph,
            state,
            taken: vec![false; branches],
        }
    }

    /// Fold another pipe of the same type into this one: the next operator
    /// reads from the replicas of both.
    pub fn merge(mut self, mut other: MultiPipe<T>) -> MultiPipe<T> {
        assert!(
            Arc::ptr_eq(&self.graph, &other.graph),
            "cannot merge pipes belonging to different graphs"
        );
        self.groups.append(&mut other.groups);
        self
    }

    pub(crate) fn chain_stage<O: Data>(self, spec: StageSpec<T, O>) -> MultiPipe<O> {
        self.wire(spec, false).expect("non-terminal stage returns a pipe")
    }

    /// Wire one stage: create the input channels of the new replicas, build
    /// one emitter per upstream replica and turn the upstream replicas into
    /// runnable workers.
    fn wire<O: Data>(mut self, spec: StageSpec<T, O>, terminal: bool) -> Option<MultiPipe<O>> {
        let graph = self.graph.clone();
        let mut inner = graph.lock();
        assert!(
            spec.parallelism >= 1,
            "{}: parallelism cannot be zero",
            spec.op_type
        );
        let parallelism = spec.parallelism;
        assert_eq!(spec.logics.len(), parallelism);
        let op_id = inner.next_op;
        inner.next_op += 1;
        let name = spec
            .name
            .unwrap_or_else(|| format!("{}{}", spec.op_type.to_lowercase(), op_id));

        let sizes: Vec<usize> = self
            .groups
            .iter()
            .map(|group| match group {
                OutputGroup::Direct(v) => v.len(),
                OutputGroup::Branch { state, .. } => state.lock().upstream.len(),
            })
            .collect();
        let total_up: usize = sizes.iter().sum();
        assert!(total_up > 0, "{}: chained on an empty pipe", name);

        // emitter kind of this edge: an explicit requirement wins, otherwise
        // forward on matching shapes and reshuffle on mismatch
        let single_direct =
            self.groups.len() == 1 && matches!(self.groups[0], OutputGroup::Direct(_));
        let (pairwise, distribution) = match &spec.routing {
            RoutingSpec::KeyBy(_) => (false, "KEYBY"),
            RoutingSpec::Broadcast => (false, "BROADCAST"),
            RoutingSpec::Any if single_direct && total_up == parallelism => (true, "FORWARD"),
            RoutingSpec::Any => (false, "RESHUFFLE"),
        };

        let replicas = Arc::new(Mutex::new(Vec::new()));
        inner.operators.push(OperatorEntry {
            name: name.clone(),
            op_type: spec.op_type,
            distribution,
            is_terminated: terminal,
            window: spec.window,
            parallelism,
            batch_size: spec.batch_size,
            replicas: replicas.clone(),
        });

        let mode = inner.config.execution_mode;
        let slack = match mode {
            ExecutionMode::Probabilistic => Some(inner.config.probabilistic_slack),
            _ => None,
        };
        let ordered = mode != ExecutionMode::Default;

        // channels, pools and per-upstream emitter halves
        let pools: Vec<BatchPool<T>> = (0..total_up).map(|_| BatchPool::new()).collect();
        let mut inputs: Vec<Input<T>> = Vec::with_capacity(parallelism);
        let mut emitter_halves: Vec<(Vec<MessageSender<T>>, usize)> = Vec::with_capacity(total_up);
        if pairwise {
            // dedicated producer/consumer pair per replica, no redistribution
            for u in 0..total_up {
                let (tx, rx) = channel::bounded(CHANNEL_CAPACITY);
                let recycler = pools[u].recycler();
                inputs.push(if ordered {
                    Input::ordered(vec![(rx, recycler)], slack)
                } else {
                    Input::fifo(rx, 1, vec![recycler])
                });
                emitter_halves.push((vec![tx], 0));
            }
        } else if ordered {
            // one dedicated channel per (upstream, downstream) pair
            let mut per_replica: Vec<Vec<_>> = (0..parallelism).map(|_| Vec::new()).collect();
            for (u, pool) in pools.iter().enumerate() {
                let mut dests = Vec::with_capacity(parallelism);
                for rxs in per_replica.iter_mut() {
                    let (tx, rx) = channel::bounded(CHANNEL_CAPACITY);
                    dests.push(tx);
                    rxs.push((rx, pool.recycler()));
                }
                emitter_halves.push((dests, u));
            }
            for rxs in per_replica {
                inputs.push(Input::ordered(rxs, slack));
            }
        } else {
            // one shared FIFO queue per downstream replica
            let mut dests = Vec::with_capacity(parallelism);
            for _ in 0..parallelism {
                let (tx, rx) = channel::bounded(CHANNEL_CAPACITY);
                let recyclers = pools.iter().map(|p| p.recycler()).collect();
                inputs.push(Input::fifo(rx, total_up, recyclers));
                dests.push(tx);
            }
            for u in 0..total_up {
                emitter_halves.push((dests.clone(), u));
            }
        }

        let mut pool_iter = pools.into_iter();
        let mut emitters: Vec<Emitter<T>> = emitter_halves
            .into_iter()
            .enumerate()
            .map(|(u, (dests, channel))| {
                let routing = if pairwise {
                    Routing::Forward
                } else {
                    match &spec.routing {
                        RoutingSpec::KeyBy(route) => Routing::KeyBy(route.clone()),
                        RoutingSpec::Broadcast => Routing::Broadcast,
                        RoutingSpec::Any => Routing::Reshuffle,
                    }
                };
                Emitter::new(
                    routing,
                    dests,
                    channel,
                    spec.batch_size,
                    u,
                    pool_iter.next().unwrap(),
                )
            })
            .collect();

        // the new replicas: workers right away for sinks, pendings otherwise
        let mut new_pendings = Vec::with_capacity(parallelism);
        let mut input_iter = inputs.into_iter();
        for (replica, logic) in spec.logics.into_iter().enumerate() {
            let input = input_iter.next().unwrap();
            let coord = Coord {
                op_id,
                replica_id: replica,
            };
            let thread_name = format!("{}-{}", name, replica);
            let stats = StatsCollector::new(replica, replicas.clone());
            if terminal {
                inner.workers.push(Worker {
                    coord,
                    thread_name,
                    body: Box::new(move || run_stage(input, EmitterSet::Null, logic, stats)),
                });
            } else {
                new_pendings.push(Pending {
                    coord,
                    thread_name,
                    finish: Box::new(move |out| {
                        Box::new(move || run_stage(input, out, logic, stats))
                    }),
                });
                inner.dangling += 1;
            }
        }

        // hand one emitter to every upstream replica
        let mut emitter_iter = emitters.drain(..);
        for group in self.groups.drain(..) {
            match group {
                OutputGroup::Direct(pendings) => {
                    for pending in pendings {
                        let emitter = emitter_iter.next().unwrap();
                        finish_pending(pending, EmitterSet::Single(emitter), &mut inner);
                    }
                }
                OutputGroup::Branch { state, branch } => {
                    let mut st = state.lock();
                    let taken: Vec<Emitter<T>> =
                        (0..st.upstream.len()).map(|_| emitter_iter.next().unwrap()).collect();
                    assert!(
                        st.branches[branch].is_none(),
                        "split branch {} wired twice",
                        branch
                    );
                    st.branches[branch] = Some(taken);
                    if st.branches.iter().all(Option::is_some) {
                        finalize_split(&mut st, &mut inner);
                    }
                }
            }
        }
        drop(emitter_iter);
        drop(inner);

        if terminal {
            None
        } else {
            Some(MultiPipe {
                graph,
                groups: vec![OutputGroup::Direct(new_pendings)],
            })
        }
    }
}

fn finish_pending<T: Data>(pending: Pending<T>, out: EmitterSet<T>, inner: &mut GraphInner) {
    let body = (pending.finish)(out);
    inner.workers.push(Worker {
        coord: pending.coord,
        thread_name: pending.thread_name,
        body,
    });
    inner.dangling -= 1;
}

/// Every branch is wired: assemble one split emitter per upstream replica
/// and release the parked replicas.
fn finalize_split<T: Data>(st: &mut SplitState<T>, inner: &mut GraphInner) {
    let upstream = mem::take(&mut st.upstream);
    let mut per_branch: Vec<_> = st
        .branches
        .iter_mut()
        .map(|b| b.take().unwrap().into_iter())
        .collect();
    for pending in upstream {
        let branches: Vec<Emitter<T>> = per_branch
            .iter_mut()
            .map(|it| it.next().expect("branch emitter count mismatch"))
            .collect();
        let split = SplitEmitter::new(st.selector.clone(), branches);
        finish_pending(pending, EmitterSet::Split(split), inner);
    }
    inner.open_splits -= 1;
}
