//! The source operators, roots of every pipe.

use std::marker::PhantomData;
use std::sync::Arc;

use coarsetime::Instant;

use crate::config::TimePolicy;
use crate::emitter::EmitterSet;
use crate::message::{duration_usec, Timestamp};
use crate::operator::{CommonOpts, Data};
use crate::stats::StatsCollector;

/// Handle given to a source generator to produce the stream.
///
/// Under [`TimePolicy::EventTime`] the generator drives event time itself
/// with [`emit_ts`](SourceContext::emit_ts) and
/// [`set_next_watermark`](SourceContext::set_next_watermark); under
/// [`TimePolicy::IngressTime`] plain [`emit`](SourceContext::emit) stamps
/// tuples with the runtime clock and the watermark follows it.
pub struct SourceContext<'a, T: Data> {
    out: &'a mut EmitterSet<T>,
    policy: TimePolicy,
    epoch: Instant,
    next_wm: Timestamp,
    next_id: u64,
    replica: usize,
    parallelism: usize,
}

impl<'a, T: Data> SourceContext<'a, T> {
    pub(crate) fn new(
        out: &'a mut EmitterSet<T>,
        policy: TimePolicy,
        replica: usize,
        parallelism: usize,
    ) -> Self {
        SourceContext {
            out,
            policy,
            epoch: Instant::now(),
            next_wm: 0,
            next_id: 0,
            replica,
            parallelism,
        }
    }

    /// Emit a tuple. Its timestamp is the runtime clock under ingress time,
    /// the current watermark under event time.
    pub fn emit(&mut self, item: T) {
        let ts = match self.policy {
            TimePolicy::IngressTime => {
                let now = duration_usec(self.epoch.elapsed());
                self.next_wm = self.next_wm.max(now);
                now
            }
            TimePolicy::EventTime => self.next_wm,
        };
        self.send(item, ts);
    }

    /// Emit a tuple with an explicit event-time timestamp.
    ///
    /// A timestamp behind the current watermark is allowed: downstream
    /// window operators account such tuples as ignored when they can no
    /// longer contribute.
    pub fn emit_ts(&mut self, item: T, timestamp: Timestamp) {
        self.send(item, timestamp);
    }

    /// Watermark attached to the tuples emitted from now on. Must be
    /// non-decreasing.
    pub fn set_next_watermark(&mut self, watermark: Timestamp) {
        assert!(
            watermark >= self.next_wm,
            "source watermark must be non-decreasing: {} < {}",
            watermark,
            self.next_wm
        );
        self.next_wm = watermark;
    }

    /// The watermark currently attached to emitted tuples.
    pub fn watermark(&self) -> Timestamp {
        self.next_wm
    }

    /// Index of this source replica.
    pub fn replica(&self) -> usize {
        self.replica
    }

    /// Total number of replicas of this source.
    pub fn parallelism(&self) -> usize {
        self.parallelism
    }

    fn send(&mut self, item: T, timestamp: Timestamp) {
        let id = self.next_id;
        self.next_id += 1;
        self.out.push(item, timestamp, self.next_wm, id);
    }
}

/// A source operator driven by a user generator.
///
/// The generator is invoked once per replica and produces the whole stream
/// of that replica through the [`SourceContext`]; when it returns, the
/// replica emits the final watermark and the end-of-stream markers.
pub struct Source<T, F> {
    gen: F,
    pub(crate) opts: CommonOpts<T>,
    /// `from_iter` sources cannot be replicated.
    pub(crate) single: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Data, F> Source<T, F>
where
    F: FnMut(&mut SourceContext<'_, T>) + Clone + Send + 'static,
{
    pub fn new(gen: F) -> Self {
        Source {
            gen,
            opts: CommonOpts::default(),
            single: false,
            _marker: PhantomData,
        }
    }

    /// Diagnostic label of the operator.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.opts.name = Some(name.into());
        self
    }

    /// Number of generator replicas. Each replica runs its own clone of the
    /// generator; use [`SourceContext::replica`] to shard the input.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        assert!(
            !self.single,
            "an iterator source cannot be replicated, use Source::new and shard by replica()"
        );
        self.opts.parallelism = parallelism;
        self
    }

    /// 0 emits one envelope per tuple, a positive value batches up to that
    /// many tuples per destination.
    pub fn with_output_batch_size(mut self, batch_size: usize) -> Self {
        self.opts.batch_size = batch_size;
        self
    }

    /// Per-replica teardown callback, invoked after end-of-stream.
    pub fn with_closing(mut self, closing: impl Fn() + Send + Sync + 'static) -> Self {
        self.opts.closing = Some(Arc::new(closing));
        self
    }

    pub(crate) fn into_parts(self) -> (F, CommonOpts<T>) {
        (self.gen, self.opts)
    }
}

impl<T: Data> Source<T, ()> {
    /// A single-replica source emitting the items of an iterator.
    pub fn from_iter<It>(
        iter: It,
    ) -> Source<T, impl FnMut(&mut SourceContext<'_, T>) + Clone + Send + 'static>
    where
        It: IntoIterator<Item = T> + Clone + Send + 'static,
    {
        let mut source = Source::new(move |ctx: &mut SourceContext<'_, T>| {
            for item in iter.clone() {
                ctx.emit(item);
            }
        });
        source.single = true;
        source
    }
}

/// Main loop of a source replica.
pub(crate) fn run_source<T: Data, F>(
    mut out: EmitterSet<T>,
    mut gen: F,
    policy: TimePolicy,
    replica: usize,
    parallelism: usize,
    closing: Option<Arc<dyn Fn() + Send + Sync>>,
    mut stats: StatsCollector,
) where
    F: FnMut(&mut SourceContext<'_, T>),
{
    {
        let mut ctx = SourceContext::new(&mut out, policy, replica, parallelism);
        gen(&mut ctx);
    }
    if let Some(closing) = closing {
        closing();
    }
    stats.tuples_out::<T>(out.sent_tuples(), 0);
    out.terminate();
    stats.finish();
}
