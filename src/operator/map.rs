//! The stateless-or-replica-stateful unary operators: `Map`, `Filter` and
//! `FlatMap`.
//!
//! The user closures are `FnMut` and are cloned once per replica, so any
//! state they capture is per-replica state. With `with_key_by` all the
//! tuples of a key reach the same replica, which is what keyed user state
//! needs.

use std::marker::PhantomData;

use crate::emitter::EmitterSet;
use crate::graph::{MultiPipe, StageSpec};
use crate::message::Timestamp;
use crate::operator::{Chainable, CommonOpts, Data, DataKey, KeyerFn};
use crate::replica::StageLogic;

/// Handle given to a `FlatMap` closure to emit any number of outputs.
///
/// Every pushed tuple inherits the timestamp and the watermark of the input
/// tuple that produced it.
pub struct Shipper<'a, T: Data> {
    out: &'a mut EmitterSet<T>,
    timestamp: Timestamp,
    watermark: Timestamp,
    next_id: &'a mut u64,
}

impl<'a, T: Data> Shipper<'a, T> {
    pub fn push(&mut self, item: T) {
        let id = *self.next_id;
        *self.next_id += 1;
        self.out.push(item, self.timestamp, self.watermark, id);
    }
}

/// The user callable of a unary replica, tagged by output arity.
pub(crate) enum UnaryFn<I, O: Data> {
    /// map / filter / filter_map collapsed into one shape
    One(Box<dyn FnMut(I) -> Option<O> + Send>),
    /// flat_map, emitting through a [`Shipper`]
    Many(Box<dyn FnMut(I, &mut Shipper<'_, O>) + Send>),
}

pub(crate) struct UnaryStage<I, O: Data> {
    f: UnaryFn<I, O>,
    closing: Option<std::sync::Arc<dyn Fn() + Send + Sync>>,
    next_id: u64,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I, O: Data> UnaryStage<I, O> {
    pub fn new(
        f: UnaryFn<I, O>,
        closing: Option<std::sync::Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        UnaryStage {
            f,
            closing,
            next_id: 0,
            _marker: PhantomData,
        }
    }
}

impl<I: Data, O: Data> StageLogic<I, O> for UnaryStage<I, O> {
    fn on_tuple(
        &mut self,
        payload: I,
        timestamp: Timestamp,
        _identifier: u64,
        frontier: Timestamp,
        out: &mut EmitterSet<O>,
    ) {
        match &mut self.f {
            UnaryFn::One(f) => {
                if let Some(output) = f(payload) {
                    let id = self.next_id;
                    self.next_id += 1;
                    out.push(output, timestamp, frontier, id);
                }
            }
            UnaryFn::Many(f) => {
                let mut shipper = Shipper {
                    out,
                    timestamp,
                    watermark: frontier,
                    next_id: &mut self.next_id,
                };
                f(payload, &mut shipper);
            }
        }
    }

    fn on_close(&mut self, _out: &mut EmitterSet<O>) {
        if let Some(closing) = &self.closing {
            closing();
        }
    }
}

macro_rules! builder_options {
    () => {
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

        /// Route the inputs by key instead of reshuffling them.
        pub fn with_key_by<K: DataKey, Fk: KeyerFn<K, I> + Sync>(mut self, keyer: Fk) -> Self {
            self.opts.key_by(keyer);
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

/// One output per input: `x -> f(x)`.
pub struct Map<I, O, F> {
    f: F,
    opts: CommonOpts<I>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I: Data, O: Data, F> Map<I, O, F>
where
    F: FnMut(I) -> O + Clone + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Map {
            f,
            opts: CommonOpts::default(),
            _marker: PhantomData,
        }
    }

    builder_options!();
}

impl<I: Data, O: Data, F> Chainable<I> for Map<I, O, F>
where
    F: FnMut(I) -> O + Clone + Send + 'static,
{
    type Out = O;

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<O> {
        let Map { f, opts, .. } = self;
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                let mut f = f.clone();
                Box::new(UnaryStage::new(
                    UnaryFn::One(Box::new(move |x| Some(f(x)))),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, O>>
            })
            .collect();
        pipe.chain_stage(StageSpec::unary("Map", opts, logics))
    }
}

/// Keep only the inputs matching a predicate.
pub struct Filter<I, F> {
    predicate: F,
    opts: CommonOpts<I>,
}

impl<I: Data, F> Filter<I, F>
where
    F: FnMut(&I) -> bool + Clone + Send + 'static,
{
    pub fn new(predicate: F) -> Self {
        Filter {
            predicate,
            opts: CommonOpts::default(),
        }
    }

    builder_options!();
}

impl<I: Data, F> Chainable<I> for Filter<I, F>
where
    F: FnMut(&I) -> bool + Clone + Send + 'static,
{
    type Out = I;

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<I> {
        let Filter { predicate, opts } = self;
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                let mut predicate = predicate.clone();
                Box::new(UnaryStage::new(
                    UnaryFn::One(Box::new(
                        move |x| if predicate(&x) { Some(x) } else { None },
                    )),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, I>>
            })
            .collect();
        pipe.chain_stage(StageSpec::unary("Filter", opts, logics))
    }
}

/// Any number of outputs per input, pushed through a [`Shipper`].
pub struct FlatMap<I, O, F> {
    f: F,
    opts: CommonOpts<I>,
    _marker: PhantomData<fn(I) -> O>,
}

impl<I: Data, O: Data, F> FlatMap<I, O, F>
where
    F: FnMut(I, &mut Shipper<'_, O>) + Clone + Send + 'static,
{
    pub fn new(f: F) -> Self {
        FlatMap {
            f,
            opts: CommonOpts::default(),
            _marker: PhantomData,
        }
    }

    builder_options!();
}

impl<I: Data, O: Data, F> Chainable<I> for FlatMap<I, O, F>
where
    F: FnMut(I, &mut Shipper<'_, O>) + Clone + Send + 'static,
{
    type Out = O;

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<O> {
        let FlatMap { f, opts, .. } = self;
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                Box::new(UnaryStage::new(
                    UnaryFn::Many(Box::new(f.clone())),
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, O>>
            })
            .collect();
        pipe.chain_stage(StageSpec::unary("FlatMap", opts, logics))
    }
}
