//! Replica workers: one OS thread per operator parallel instance.

use std::cell::RefCell;
use std::fmt::{Display, Formatter};

use crate::emitter::EmitterSet;
use crate::input::{Event, Input};
use crate::message::Timestamp;
use crate::operator::Data;
use crate::stats::StatsCollector;

/// Identity of a replica inside the graph.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct Coord {
    /// Index of the operator in graph order.
    pub op_id: usize,
    /// Index of this replica among the operator's replicas.
    pub replica_id: usize,
}

impl Display for Coord {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "op{}:r{}", self.op_id, self.replica_id)
    }
}

thread_local! {
    /// Coordinates of the replica the current worker thread is working on.
    ///
    /// Access this by calling `replica_coord()`.
    static COORD: RefCell<Option<Coord>> = const { RefCell::new(None) };
}

/// Get the coord of the replica the current thread is working on.
///
/// This will return `Some(coord)` only when called from a worker thread of a
/// replica, otherwise `None` is returned.
pub fn replica_coord() -> Option<Coord> {
    COORD.with(|x| *x.borrow())
}

pub(crate) fn set_replica_coord(coord: Coord) {
    COORD.with(|x| *x.borrow_mut() = Some(coord));
}

/// Call a function if this struct goes out of scope without calling
/// `defuse`, including during a panic stack-unwinding.
pub(crate) struct CatchPanic<F: FnOnce()> {
    primed: bool,
    handler: Option<F>,
}

impl<F: FnOnce()> CatchPanic<F> {
    pub fn new(handler: F) -> Self {
        Self {
            primed: true,
            handler: Some(handler),
        }
    }

    /// Avoid calling the function on drop.
    pub fn defuse(&mut self) {
        self.primed = false;
    }
}

impl<F: FnOnce()> Drop for CatchPanic<F> {
    fn drop(&mut self) {
        if self.primed {
            (self.handler.take().unwrap())();
        }
    }
}

/// Per-operator-kind behaviour driven by [`run_stage`]. One instance per
/// replica, owned by its worker thread.
pub(crate) trait StageLogic<I, O>: Send {
    /// A payload arrived. `frontier` is the minimum input watermark after
    /// the envelope was accounted for.
    fn on_tuple(
        &mut self,
        payload: I,
        timestamp: Timestamp,
        identifier: u64,
        frontier: Timestamp,
        out: &mut EmitterSet<O>,
    );

    /// The frontier advanced to `frontier` (through a punctuation, a tuple
    /// watermark, or a channel closing).
    fn on_frontier(&mut self, _frontier: Timestamp, _out: &mut EmitterSet<O>) {}

    /// Every input channel is closed and drained; emit whatever is left.
    fn on_close(&mut self, _out: &mut EmitterSet<O>) {}

    /// How far the watermark attached to the outputs lags behind the input
    /// frontier. Zero except for window operators with a lateness.
    fn watermark_shift(&self) -> Timestamp {
        0
    }

    fn ignored(&self) -> u64 {
        0
    }
}

/// Main loop of every non-source replica.
///
/// Punctuations received from upstream are never handed to the user logic:
/// they update the channel watermark and, when the frontier advances, are
/// propagated downstream shifted by the logic's lateness.
pub(crate) fn run_stage<I: Data, O: Data>(
    mut input: Input<I>,
    mut out: EmitterSet<O>,
    mut logic: Box<dyn StageLogic<I, O>>,
    mut stats: StatsCollector,
) {
    let mut frontier_seen: Timestamp = 0;
    loop {
        match input.next() {
            Event::Tuple {
                payload,
                timestamp,
                identifier,
            } => {
                let probe = stats.probe();
                stats.tuple_in::<I>();
                let frontier = input.frontier();
                logic.on_tuple(payload, timestamp, identifier, frontier, &mut out);
                if frontier > frontier_seen {
                    frontier_seen = frontier;
                    logic.on_frontier(frontier, &mut out);
                }
                stats.commit(probe);
            }
            Event::Progress => {
                let frontier = input.frontier();
                if frontier > frontier_seen {
                    frontier_seen = frontier;
                    logic.on_frontier(frontier, &mut out);
                    out.punctuate(frontier.saturating_sub(logic.watermark_shift()));
                }
            }
            Event::Closed => break,
        }
    }
    logic.on_close(&mut out);
    stats.tuples_out::<O>(out.sent_tuples(), logic.ignored());
    out.terminate();
    stats.finish();
}
