//! Two-stage pane pre-aggregation for associative window aggregations.
//!
//! The PLQ stage folds tuples into tumbling panes of width
//! `gcd(len, slide)`; the WLQ stage combines the panes of each window into
//! the final result. Every pane is computed once and shared by all the
//! windows overlapping it. Both stages run data-parallel over the key space.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::graph::{MultiPipe, RoutingSpec, StageSpec};
use crate::operator::window::{window_options, WindowIndex, WindowKind, WindowOpts, WindowSpec, WindowStage};
use crate::operator::{key_hash, Chainable, CommonOpts, Data, DataKey, KeyerFn};
use crate::replica::StageLogic;

/// Keyed sliding windows computed as panes (PLQ) combined per window (WLQ).
///
/// `lift` turns one tuple into a partial aggregate, `combine` merges two
/// partial aggregates and must be associative. The operator emits
/// `(key, aggregate)` exactly like [`KeyedWindows`](super::KeyedWindows).
pub struct PanedWindows<I, K, A, Fk, Fl, Fc> {
    keyer: Fk,
    lift: Fl,
    combine: Fc,
    plq_parallelism: Option<usize>,
    wlq_parallelism: Option<usize>,
    pub(crate) opts: CommonOpts<I>,
    pub(crate) win: WindowOpts,
    _marker: PhantomData<fn(&I) -> (K, A)>,
}

impl<I, K, A, Fk, Fl, Fc> PanedWindows<I, K, A, Fk, Fl, Fc>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Fl: Fn(&I) -> A + Clone + Send + 'static,
    Fc: Fn(&A, &A) -> A + Clone + Send + 'static,
{
    pub fn new(keyer: Fk, lift: Fl, combine: Fc) -> Self {
        PanedWindows {
            keyer,
            lift,
            combine,
            plq_parallelism: None,
            wlq_parallelism: None,
            opts: CommonOpts::default(),
            win: WindowOpts::default(),
            _marker: PhantomData,
        }
    }

    window_options!();

    /// Parallelism of the pane stage alone (defaults to `with_parallelism`).
    pub fn with_plq_parallelism(mut self, parallelism: usize) -> Self {
        self.plq_parallelism = Some(parallelism);
        self
    }

    /// Parallelism of the window stage alone (defaults to
    /// `with_parallelism`).
    pub fn with_wlq_parallelism(mut self, parallelism: usize) -> Self {
        self.wlq_parallelism = Some(parallelism);
        self
    }
}

impl<I, K, A, Fk, Fl, Fc> Chainable<I> for PanedWindows<I, K, A, Fk, Fl, Fc>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Fl: Fn(&I) -> A + Clone + Send + 'static,
    Fc: Fn(&A, &A) -> A + Clone + Send + 'static,
{
    type Out = (K, A);

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<(K, A)> {
        let PanedWindows {
            keyer,
            lift,
            combine,
            plq_parallelism,
            wlq_parallelism,
            opts,
            win,
            ..
        } = self;
        let spec = win.build("PanedWindows");
        let pane = spec.pane();
        let base = opts.name.unwrap_or_else(|| "paned_windows".into());
        let plq_p = plq_parallelism.unwrap_or(opts.parallelism);
        let wlq_p = wlq_parallelism.unwrap_or(opts.parallelism);
        assert!(
            plq_p >= 1 && wlq_p >= 1,
            "PanedWindows: parallelism cannot be zero"
        );

        // PLQ: tumbling panes, folding tuples with lift + combine
        let plq_spec = WindowSpec {
            kind: spec.kind,
            len: pane,
            slide: pane,
            lateness: spec.lateness,
            quantum: None,
        };
        let plq_route = {
            let keyer = keyer.clone();
            Arc::new(move |item: &I| key_hash(&keyer(item))) as Arc<dyn Fn(&I) -> u64 + Send + Sync>
        };
        let plq_logics = (0..plq_p)
            .map(|_| {
                let keyer = keyer.clone();
                let lift = lift.clone();
                let combine = combine.clone();
                Box::new(WindowStage::new(
                    Box::new(move |item: &I| keyer(item)),
                    WindowIndex::new(
                        plq_spec,
                        1,
                        0,
                        None::<A>,
                        Box::new(move |acc: &mut Option<A>, item: &I| {
                            let value = lift(item);
                            *acc = match acc.take() {
                                Some(prev) => Some(combine(&prev, &value)),
                                None => Some(value),
                            };
                        }),
                    ),
                    Box::new(|key, acc: Option<A>| (key, acc.expect("fired an empty pane"))),
                    None,
                )) as Box<dyn StageLogic<I, (K, A)>>
            })
            .collect();
        let plq_pipe = pipe.chain_stage(StageSpec::new(
            "Paned_Windows_PLQ",
            Some(format!("{}-plq", base)),
            plq_p,
            opts.batch_size,
            RoutingSpec::KeyBy(plq_route),
            Some(WindowOpts::meta(&plq_spec)),
            plq_logics,
        ));

        // WLQ: combine the panes of each window; counts are in panes for CB
        let wlq_spec = match spec.kind {
            WindowKind::CountBased => WindowSpec {
                kind: spec.kind,
                len: spec.len / pane,
                slide: spec.slide / pane,
                lateness: 0,
                quantum: None,
            },
            WindowKind::TimeBased => WindowSpec {
                kind: spec.kind,
                len: spec.len,
                slide: spec.slide,
                lateness: 0,
                quantum: None,
            },
        };
        let wlq_route = Arc::new(|item: &(K, A)| key_hash(&item.0))
            as Arc<dyn Fn(&(K, A)) -> u64 + Send + Sync>;
        let wlq_logics = (0..wlq_p)
            .map(|_| {
                let combine = combine.clone();
                Box::new(WindowStage::new(
                    Box::new(|item: &(K, A)| item.0.clone()),
                    WindowIndex::new(
                        wlq_spec,
                        1,
                        0,
                        None::<A>,
                        Box::new(move |acc: &mut Option<A>, item: &(K, A)| {
                            *acc = match acc.take() {
                                Some(prev) => Some(combine(&prev, &item.1)),
                                None => Some(item.1.clone()),
                            };
                        }),
                    ),
                    Box::new(|key, acc: Option<A>| (key, acc.expect("fired an empty window"))),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<(K, A), (K, A)>>
            })
            .collect();
        plq_pipe.chain_stage(StageSpec::new(
            "Paned_Windows_WLQ",
            Some(format!("{}-wlq", base)),
            wlq_p,
            opts.batch_size,
            RoutingSpec::KeyBy(wlq_route),
            Some(WindowOpts::meta(&spec)),
            wlq_logics,
        ))
    }
}
