//! The terminal operators.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::emitter::EmitterSet;
use crate::message::Timestamp;
use crate::operator::{CommonOpts, Data, DataKey, KeyerFn};
use crate::replica::StageLogic;

/// Consumes the stream: the user closure receives `Some(payload)` for every
/// tuple and `None` exactly once when the stream ends, so it can emit a
/// final record.
pub struct Sink<I, F> {
    f: F,
    pub(crate) opts: CommonOpts<I>,
}

impl<I: Data, F> Sink<I, F>
where
    F: FnMut(Option<I>) + Clone + Send + 'static,
{
    pub fn new(f: F) -> Self {
        Sink {
            f,
            opts: CommonOpts::default(),
        }
    }

    /// Diagnostic label of the operator.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    /// Number of worker replicas of the sink.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.opts.parallelism = parallelism;
        self
    }

    /// Route the inputs by key instead of reshuffling them.
    pub fn with_key_by<K: DataKey, Fk: KeyerFn<K, I> + Sync>(mut self, keyer: Fk) -> Self {
        self.opts.key_by(keyer);
        self
    }

    /// Per-replica teardown callback, invoked after end-of-stream.
    pub fn with_closing(mut self, closing: impl Fn() + Send + Sync + 'static) -> Self {
        self.opts.closing = Some(Arc::new(closing));
        self
    }

    pub(crate) fn into_parts(self) -> (F, CommonOpts<I>) {
        (self.f, self.opts)
    }
}

/// A sink accumulating every received tuple into a shared vector, readable
/// through the returned handle after the graph terminates.
pub fn collect_sink<I: Data>() -> (
    Sink<I, impl FnMut(Option<I>) + Clone + Send + 'static>,
    OutputHandle<I>,
) {
    let slot: Arc<Mutex<Vec<I>>> = Arc::new(Mutex::new(Vec::new()));
    let handle = OutputHandle(slot.clone());
    let sink = Sink::new(move |item: Option<I>| {
        if let Some(item) = item {
            slot.lock().push(item);
        }
    });
    (sink, handle)
}

/// The results gathered by a [`collect_sink`], available after
/// [`PipeGraph::run`](crate::PipeGraph::run) returns.
pub struct OutputHandle<T>(Arc<Mutex<Vec<T>>>);

impl<T> OutputHandle<T> {
    /// Take the collected tuples. With more than one sink replica the order
    /// is the interleaving of the replicas.
    pub fn get(&self) -> Vec<T> {
        std::mem::take(&mut *self.0.lock())
    }
}

pub(crate) struct SinkStage<I> {
    f: Box<dyn FnMut(Option<I>) + Send>,
    closing: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<I> SinkStage<I> {
    pub fn new(
        f: Box<dyn FnMut(Option<I>) + Send>,
        closing: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        SinkStage { f, closing }
    }
}

impl<I: Data> StageLogic<I, I> for SinkStage<I> {
    fn on_tuple(
        &mut self,
        payload: I,
        _timestamp: Timestamp,
        _identifier: u64,
        _frontier: Timestamp,
        _out: &mut EmitterSet<I>,
    ) {
        (self.f)(Some(payload));
    }

    fn on_close(&mut self, _out: &mut EmitterSet<I>) {
        (self.f)(None);
        if let Some(closing) = &self.closing {
            closing();
        }
    }
}
