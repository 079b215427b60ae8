//! The windowed operators.
//!
//! Four variants share the same event-time machinery:
//! - [`KeyedWindows`]: one window set per key, parallel over the key space;
//! - [`ParallelWindows`]: the windows of a single stream spread over the
//!   replicas by window id;
//! - [`PanedWindows`]: two-stage pane pre-aggregation (PLQ/WLQ) for
//!   associative aggregations;
//! - [`FfatAggregator`]: incremental sliding aggregation over a flat
//!   aggregator tree, `O(log n)` per window.

use std::marker::PhantomData;
use std::sync::Arc;

pub use ffat::FfatAggregator;
pub use paned::PanedWindows;

use crate::emitter::EmitterSet;
use crate::graph::{MultiPipe, RoutingSpec, StageSpec, WindowMeta};
use crate::message::Timestamp;
use crate::operator::{key_hash, Chainable, CommonOpts, Data, DataKey, KeyerFn};
use crate::replica::StageLogic;

pub(crate) use index::{Fired, WindowIndex};

mod ffat;
mod index;
mod paned;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum WindowKind {
    CountBased,
    TimeBased,
}

impl WindowKind {
    pub(crate) fn label(&self) -> &'static str {
        match self {
            WindowKind::CountBased => "CB",
            WindowKind::TimeBased => "TB",
        }
    }
}

/// Validated window parameters. Count-based units are tuple arrivals,
/// time-based units are microseconds of event time.
#[derive(Clone, Copy, Debug)]
pub(crate) struct WindowSpec {
    pub kind: WindowKind,
    pub len: u64,
    pub slide: u64,
    pub lateness: Timestamp,
    pub quantum: Option<u64>,
}

fn gcd(mut a: u64, mut b: u64) -> u64 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

impl WindowSpec {
    /// Width of the panes shared by the overlapping windows: the quantum
    /// when one is configured, `gcd(len, slide)` otherwise.
    pub fn pane(&self) -> u64 {
        self.quantum.unwrap_or_else(|| gcd(self.len, self.slide))
    }

    /// First window id whose firing point is still ahead of `frontier`.
    pub fn first_live_window(&self, frontier: Timestamp) -> u64 {
        if self.len + self.lateness > frontier {
            0
        } else {
            (frontier - self.len - self.lateness) / self.slide + 1
        }
    }
}

/// Window options collected by the builders and validated when the operator
/// is chained.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct WindowOpts {
    kind: Option<WindowKind>,
    len: u64,
    slide: u64,
    lateness: Option<Timestamp>,
    quantum: Option<u64>,
}

impl WindowOpts {
    fn cb(&mut self, len: u64, slide: u64) {
        self.kind = Some(WindowKind::CountBased);
        self.len = len;
        self.slide = slide;
    }

    fn tb(&mut self, len: Timestamp, slide: Timestamp) {
        self.kind = Some(WindowKind::TimeBased);
        self.len = len;
        self.slide = slide;
    }

    /// Misconfigurations are caught here, at graph-assembly time.
    fn build(&self, op: &str) -> WindowSpec {
        let kind = self.kind.unwrap_or_else(|| {
            panic!(
                "{}: a window specification is required (with_cb_windows or with_tb_windows)",
                op
            )
        });
        assert!(self.len > 0, "{}: the window length cannot be zero", op);
        assert!(self.slide > 0, "{}: the window slide cannot be zero", op);
        if self.lateness.is_some() && kind == WindowKind::CountBased {
            panic!("{}: lateness only applies to time-based windows", op);
        }
        if let Some(quantum) = self.quantum {
            if kind == WindowKind::CountBased {
                panic!("{}: the quantum only applies to time-based windows", op);
            }
            assert!(quantum > 0, "{}: the quantum cannot be zero", op);
            assert!(
                self.len % quantum == 0 && self.slide % quantum == 0,
                "{}: window length and slide must be integer multiples of the quantum",
                op
            );
        }
        WindowSpec {
            kind,
            len: self.len,
            slide: self.slide,
            lateness: self.lateness.unwrap_or(0),
            quantum: self.quantum,
        }
    }

    fn meta(spec: &WindowSpec) -> WindowMeta {
        WindowMeta {
            kind: spec.kind.label(),
            len: spec.len,
            slide: spec.slide,
        }
    }
}

macro_rules! window_options {
    () => {
        /// Count-based semantics: `len` and `slide` are tuple arrivals.
        pub fn with_cb_windows(mut self, len: u64, slide: u64) -> Self {
            self.win.cb(len, slide);
            self
        }

        /// Time-based semantics: `len` and `slide` are microseconds.
        pub fn with_tb_windows(
            mut self,
            len: crate::message::Timestamp,
            slide: crate::message::Timestamp,
        ) -> Self {
            self.win.tb(len, slide);
            self
        }

        /// Delay firing until the watermark passed `end + lateness`, keeping
        /// the window alive for out-of-order tuples. Time-based only.
        pub fn with_lateness(mut self, lateness: crate::message::Timestamp) -> Self {
            self.win.lateness = Some(lateness);
            self
        }

        /// Align windows on multiples of `quantum` microseconds; the panes
        /// coincide with the quanta. Time-based only.
        pub fn with_quantum(mut self, quantum: u64) -> Self {
            self.win.quantum = Some(quantum);
            self
        }

        /// Diagnostic label of the operator.
        pub fn with_name(mut self, name: impl Into<String>) -> Self {
            self.opts.name = Some(name.into());
            self
        }

        /// Number of worker replicas of the operator.
        pub fn with_parallelism(mut self, parallelism: usize) -> Self {
            self.opts.parallelism = parallelism;
            self
        }

        /// 0 emits one envelope per tuple, a positive value batches up to
        /// that many tuples per destination.
        pub fn with_output_batch_size(mut self, batch_size: usize) -> Self {
            self.opts.batch_size = batch_size;
            self
        }

        /// Per-replica teardown callback, invoked after end-of-stream.
        pub fn with_closing(mut self, closing: impl Fn() + Send + Sync + 'static) -> Self {
            self.opts.closing = Some(std::sync::Arc::new(closing));
            self
        }
    };
}
pub(crate) use window_options;

/// The replica logic shared by the keyed and parallel window operators:
/// route to the per-key index, then emit whatever fired.
pub(crate) struct WindowStage<I, K, A, O> {
    keyer: Box<dyn FnMut(&I) -> K + Send>,
    index: WindowIndex<I, K, A>,
    emit: Box<dyn FnMut(K, A) -> O + Send>,
    fired: Vec<Fired<K, A>>,
    next_id: u64,
    closing: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<I, K: DataKey, A: Clone, O> WindowStage<I, K, A, O> {
    pub fn new(
        keyer: Box<dyn FnMut(&I) -> K + Send>,
        index: WindowIndex<I, K, A>,
        emit: Box<dyn FnMut(K, A) -> O + Send>,
        closing: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        WindowStage {
            keyer,
            index,
            emit,
            fired: Vec::new(),
            next_id: 0,
            closing,
        }
    }

    fn drain(&mut self, frontier: Timestamp, out: &mut EmitterSet<O>)
    where
        O: Data,
    {
        let shift = self.index.lateness();
        for fired in self.fired.drain(..) {
            let output = (self.emit)(fired.key, fired.acc);
            let id = self.next_id;
            self.next_id += 1;
            out.push(
                output,
                fired.timestamp,
                frontier.saturating_sub(shift),
                id,
            );
        }
    }
}

impl<I, K, A, O> StageLogic<I, O> for WindowStage<I, K, A, O>
where
    I: Data,
    K: DataKey,
    A: Clone + Send + 'static,
    O: Data,
{
    fn on_tuple(
        &mut self,
        payload: I,
        timestamp: Timestamp,
        _identifier: u64,
        frontier: Timestamp,
        out: &mut EmitterSet<O>,
    ) {
        let key = (self.keyer)(&payload);
        self.index
            .on_tuple(key, &payload, timestamp, frontier, &mut self.fired);
        if !self.fired.is_empty() {
            self.drain(frontier, out);
        }
    }

    fn on_frontier(&mut self, frontier: Timestamp, out: &mut EmitterSet<O>) {
        self.index.on_frontier(frontier, &mut self.fired);
        if !self.fired.is_empty() {
            self.drain(frontier, out);
        }
    }

    fn on_close(&mut self, _out: &mut EmitterSet<O>) {
        if let Some(closing) = &self.closing {
            closing();
        }
    }

    fn watermark_shift(&self) -> Timestamp {
        self.index.lateness()
    }

    fn ignored(&self) -> u64 {
        self.index.ignored()
    }
}

/// Sliding windows over each key partition of the stream.
///
/// The aggregation is an incremental fold: `init` is cloned when a window
/// opens and `fold` is applied to every tuple mapping into it. The operator
/// emits `(key, accumulator)` when a window fires.
pub struct KeyedWindows<I, K, A, Fk, Ff> {
    keyer: Fk,
    init: A,
    fold: Ff,
    pub(crate) opts: CommonOpts<I>,
    pub(crate) win: WindowOpts,
    _marker: PhantomData<fn(&I) -> (K, A)>,
}

impl<I, K, A, Fk, Ff> KeyedWindows<I, K, A, Fk, Ff>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Ff: Fn(&mut A, &I) + Clone + Send + 'static,
{
    pub fn new(keyer: Fk, init: A, fold: Ff) -> Self {
        KeyedWindows {
            keyer,
            init,
            fold,
            opts: CommonOpts::default(),
            win: WindowOpts::default(),
            _marker: PhantomData,
        }
    }

    window_options!();
}

impl<I, K, A, Fk, Ff> Chainable<I> for KeyedWindows<I, K, A, Fk, Ff>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Ff: Fn(&mut A, &I) + Clone + Send + 'static,
{
    type Out = (K, A);

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<(K, A)> {
        let KeyedWindows {
            keyer,
            init,
            fold,
            opts,
            win,
            ..
        } = self;
        let spec = win.build("KeyedWindows");
        let route = {
            let keyer = keyer.clone();
            Arc::new(move |item: &I| key_hash(&keyer(item))) as Arc<dyn Fn(&I) -> u64 + Send + Sync>
        };
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                let keyer = keyer.clone();
                let fold = fold.clone();
                Box::new(WindowStage::new(
                    Box::new(move |item: &I| keyer(item)),
                    WindowIndex::new(spec, 1, 0, init.clone(), Box::new(move |acc, x| fold(acc, x))),
                    Box::new(|key, acc| (key, acc)),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, (K, A)>>
            })
            .collect();
        pipe.chain_stage(StageSpec::new(
            "Keyed_Windows",
            opts.name,
            opts.parallelism,
            opts.batch_size,
            RoutingSpec::KeyBy(route),
            Some(WindowOpts::meta(&spec)),
            logics,
        ))
    }
}

/// Sliding windows of a single stream distributed over the replicas.
///
/// Replica `r` of `P` owns the windows with `id % P == r`, working with an
/// effective slide of `P * slide`; inputs arrive by broadcast and tuples
/// mapping only into windows owned elsewhere are dropped locally. Results
/// from different replicas interleave downstream by event time.
pub struct ParallelWindows<I, A, Ff> {
    init: A,
    fold: Ff,
    pub(crate) opts: CommonOpts<I>,
    pub(crate) win: WindowOpts,
    _marker: PhantomData<fn(&I) -> A>,
}

impl<I, A, Ff> ParallelWindows<I, A, Ff>
where
    I: Data,
    A: Data,
    Ff: Fn(&mut A, &I) + Clone + Send + 'static,
{
    pub fn new(init: A, fold: Ff) -> Self {
        ParallelWindows {
            init,
            fold,
            opts: CommonOpts::default(),
            win: WindowOpts::default(),
            _marker: PhantomData,
        }
    }

    window_options!();
}

impl<I, A, Ff> Chainable<I> for ParallelWindows<I, A, Ff>
where
    I: Data,
    A: Data,
    Ff: Fn(&mut A, &I) + Clone + Send + 'static,
{
    type Out = A;

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<A> {
        let ParallelWindows {
            init,
            fold,
            opts,
            win,
            ..
        } = self;
        let spec = win.build("ParallelWindows");
        let parallelism = opts.parallelism.max(1);
        let logics = (0..parallelism)
            .map(|replica| {
                let fold = fold.clone();
                Box::new(WindowStage::new(
                    Box::new(|_item: &I| ()),
                    WindowIndex::new(
                        spec,
                        parallelism as u64,
                        replica as u64,
                        init.clone(),
                        Box::new(move |acc, x| fold(acc, x)),
                    ),
                    Box::new(|_, acc| acc),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, A>>
            })
            .collect();
        pipe.chain_stage(StageSpec::new(
            "Parallel_Windows",
            opts.name,
            opts.parallelism,
            opts.batch_size,
            RoutingSpec::Broadcast,
            Some(WindowOpts::meta(&spec)),
            logics,
        ))
    }
}
