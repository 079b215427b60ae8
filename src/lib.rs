//! Sirocco is a runtime for parallel streaming dataflow graphs on
//! shared-memory machines.
//!
//! A [`PipeGraph`] owns a set of source-rooted pipes. Operators are added
//! with fluent builders and materialised as replicas, one worker thread
//! each, connected by bounded queues. Tuples carry event-time timestamps
//! and watermarks; the windowed operators fire on watermark progress, so
//! event-time semantics hold under any parallelism.
//!
//! ```
//! use sirocco::prelude::*;
//!
//! let graph = PipeGraph::new("sum-of-squares");
//! let (sink, output) = collect_sink();
//! graph
//!     .add_source(Source::from_iter(1..=100i64))
//!     .chain(Map::new(|x: i64| x * x).with_parallelism(4))
//!     .chain_sink(sink);
//! graph.run();
//! assert_eq!(output.get().into_iter().sum::<i64>(), 338_350);
//! ```
//!
//! The execution mode of a graph selects the input discipline of every
//! replica: best-effort FIFO ([`ExecutionMode::Default`]), a reproducible
//! timestamp-ordered merge ([`ExecutionMode::Deterministic`]), or the same
//! merge with a bounded slack ([`ExecutionMode::Probabilistic`]).

#[macro_use]
extern crate log;
#[macro_use]
extern crate derivative;

mod channel;
pub mod config;
mod emitter;
pub mod graph;
mod input;
mod message;
pub mod operator;
mod replica;
pub mod stats;

pub use config::{ExecutionMode, GraphConfig, TimePolicy};
pub use graph::{MultiPipe, PipeGraph, SplitPipe};
pub use message::Timestamp;
pub use replica::{replica_coord, Coord};
pub use stats::{GraphSummary, OperatorStats, ReplicaStats};

/// Most commonly used types, in one import.
pub mod prelude {
    pub use crate::operator::{
        collect_sink, key_hash, Chainable, Data, DataKey, FfatAggregator, Filter, FlatMap,
        KeyedWindows, Map, OutputHandle, PanedWindows, ParallelWindows, Shipper, Sink, Source,
        SourceContext,
    };
    pub use crate::{
        replica_coord, ExecutionMode, GraphConfig, MultiPipe, PipeGraph, SplitPipe, TimePolicy,
        Timestamp,
    };
}
