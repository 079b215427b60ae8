//! Operator builders that can be chained on a [`MultiPipe`](crate::MultiPipe).
//!
//! Every operator is described by a fluent builder (`Source`, `Map`,
//! `Filter`, `FlatMap`, the window operators and `Sink`). The builders carry
//! the operator options (`with_name`, `with_parallelism`, `with_key_by`,
//! `with_output_batch_size`, `with_closing`, and the window options) and are
//! turned into replicas when they are chained.

use std::hash::{Hash, Hasher};
use std::sync::Arc;

pub use map::{Filter, FlatMap, Map, Shipper};
pub use sink::{collect_sink, OutputHandle, Sink};
pub use source::{Source, SourceContext};
pub use window::{FfatAggregator, KeyedWindows, PanedWindows, ParallelWindows};

use crate::graph::MultiPipe;

mod map;
mod sink;
mod source;
pub mod window;

pub(crate) use sink::SinkStage;
pub(crate) use source::run_source;

/// Marker trait that all the types inside a stream should implement.
pub trait Data: Clone + Send + 'static {}
impl<T: Clone + Send + 'static> Data for T {}

/// Marker trait that all the keys should implement.
pub trait DataKey: Clone + Send + Hash + Eq + 'static {}
impl<T: Clone + Send + Hash + Eq + 'static> DataKey for T {}

/// Marker trait for the function that extracts the key out of a type.
pub trait KeyerFn<Key, Out>: Fn(&Out) -> Key + Clone + Send + 'static {}
impl<Key, Out, T: Fn(&Out) -> Key + Clone + Send + 'static> KeyerFn<Key, Out> for T {}

/// Hashing function for the keyby routing table. The seed is fixed so the
/// table is stable for a given topology.
pub fn key_hash<T: Hash>(item: &T) -> u64 {
    let mut hasher = wyhash::WyHash::with_seed(0x51d0c0_57a61e5eed);
    item.hash(&mut hasher);
    hasher.finish()
}

/// Hasher used for keyed state hashmaps. Deterministic, so the iteration
/// order only depends on the insertion sequence.
pub(crate) type GroupHasherBuilder = core::hash::BuildHasherDefault<wyhash::WyHash>;

/// An operator (or a fixed composition of operators) that can be appended to
/// a pipe with [`MultiPipe::chain`].
pub trait Chainable<In: Data> {
    type Out: Data;

    #[doc(hidden)]
    fn attach(self, pipe: MultiPipe<In>) -> MultiPipe<Self::Out>;
}

/// Options shared by every operator builder.
pub(crate) struct CommonOpts<I> {
    pub name: Option<String>,
    pub parallelism: usize,
    pub batch_size: usize,
    pub key_route: Option<Arc<dyn Fn(&I) -> u64 + Send + Sync>>,
    pub closing: Option<Arc<dyn Fn() + Send + Sync>>,
}

impl<I> Default for CommonOpts<I> {
    fn default() -> Self {
        CommonOpts {
            name: None,
            parallelism: 1,
            batch_size: 0,
            key_route: None,
            closing: None,
        }
    }
}

impl<I> CommonOpts<I> {
    pub fn key_by<K: DataKey, Fk: KeyerFn<K, I> + Sync>(&mut self, keyer: Fk)
    where
        I: 'static,
    {
        self.key_route = Some(Arc::new(move |item: &I| key_hash(&keyer(item))));
    }
}
