//! The emitters: the output side of a replica.
//!
//! An emitter is owned by exactly one replica and executes inline in its
//! thread. It decides the destination(s) of every envelope according to its
//! routing kind, optionally accumulates envelopes into per-destination
//! batches, and keeps quiet destinations alive by generating punctuations.

use std::mem;
use std::sync::Arc;

use coarsetime::Instant;

use crate::config;
use crate::message::{duration_usec, BatchPool, Item, Message, MessageSender, Timestamp, WM_MAX};

/// Routing kind of an emitter, fixed at graph-assembly time.
pub(crate) enum Routing<T> {
    /// Single destination, pass-through.
    Forward,
    /// Every envelope to every destination.
    Broadcast,
    /// `dest = hash(key(payload)) mod K`.
    KeyBy(Arc<dyn Fn(&T) -> u64 + Send + Sync>),
    /// Round-robin, one step per envelope.
    Reshuffle,
}

#[derive(Derivative)]
#[derivative(Debug)]
pub(crate) struct Emitter<T> {
    #[derivative(Debug = "ignore")]
    routing: Routing<T>,
    #[derivative(Debug = "ignore")]
    dests: Vec<MessageSender<T>>,
    /// Index of this emitter among the input channels of the destinations.
    channel: usize,
    /// 0 or 1 means per-tuple emission.
    batch_size: usize,
    #[derivative(Debug = "ignore")]
    buffers: Vec<Vec<Item<T>>>,
    /// Watermark of the last envelope sent to each destination.
    last_wm: Vec<Timestamp>,
    /// Deliveries per destination since the last punctuation check.
    delivered: Vec<u64>,
    /// Envelopes routed since the last punctuation check.
    seen: u64,
    #[derivative(Debug = "ignore")]
    last_check: Instant,
    /// Round-robin cursor, used by `Routing::Reshuffle`.
    rr_next: usize,
    #[derivative(Debug = "ignore")]
    pool: BatchPool<T>,
    sent_tuples: u64,
}

impl<T: Clone> Emitter<T> {
    /// `origin` is the index of the owning replica: it seeds the round-robin
    /// cursor so that reshuffling is stable across runs.
    pub fn new(
        routing: Routing<T>,
        dests: Vec<MessageSender<T>>,
        channel: usize,
        batch_size: usize,
        origin: usize,
        pool: BatchPool<T>,
    ) -> Self {
        let n = dests.len();
        assert!(n > 0, "emitter without destinations");
        if matches!(routing, Routing::Forward) {
            assert_eq!(n, 1, "forward emitter with more than one destination");
        }
        let buffers = (0..n).map(|_| pool.acquire(batch_size)).collect();
        Emitter {
            routing,
            dests,
            channel,
            batch_size,
            buffers,
            last_wm: vec![0; n],
            delivered: vec![0; n],
            seen: 0,
            last_check: Instant::now(),
            rr_next: origin % n,
            pool,
            sent_tuples: 0,
        }
    }

    /// Route one payload envelope.
    pub fn push(
        &mut self,
        payload: T,
        timestamp: Timestamp,
        watermark: Timestamp,
        identifier: u64,
    ) {
        self.sent_tuples += 1;
        match &self.routing {
            Routing::Forward => {
                self.deliver(
                    0,
                    Item::Tuple {
                        payload,
                        timestamp,
                        watermark,
                        identifier,
                    },
                );
            }
            Routing::Broadcast => {
                // one logical copy per destination, the last one by move
                for dest in 1..self.dests.len() {
                    self.deliver(
                        dest,
                        Item::Tuple {
                            payload: payload.clone(),
                            timestamp,
                            watermark,
                            identifier,
                        },
                    );
                }
                self.deliver(
                    0,
                    Item::Tuple {
                        payload,
                        timestamp,
                        watermark,
                        identifier,
                    },
                );
            }
            Routing::KeyBy(hasher) => {
                let dest = (hasher(&payload) % self.dests.len() as u64) as usize;
                self.deliver(
                    dest,
                    Item::Tuple {
                        payload,
                        timestamp,
                        watermark,
                        identifier,
                    },
                );
            }
            Routing::Reshuffle => {
                let dest = self.rr_next;
                self.rr_next = (self.rr_next + 1) % self.dests.len();
                self.deliver(
                    dest,
                    Item::Tuple {
                        payload,
                        timestamp,
                        watermark,
                        identifier,
                    },
                );
            }
        }
        self.maybe_generate_punctuations(watermark);
    }

    fn deliver(&mut self, dest: usize, item: Item<T>) {
        let wm = item.watermark();
        assert!(
            wm >= self.last_wm[dest],
            "watermark regression on output channel {}: {} < {}",
            dest,
            wm,
            self.last_wm[dest]
        );
        self.last_wm[dest] = wm;
        self.delivered[dest] += 1;
        if self.batch_size <= 1 {
            let mut buf = self.pool.acquire(1);
            buf.push(item);
            self.send(dest, buf);
        } else {
            self.buffers[dest].push(item);
            if self.buffers[dest].len() >= self.batch_size {
                self.flush_dest(dest);
            }
        }
    }

    fn flush_dest(&mut self, dest: usize) {
        if self.buffers[dest].is_empty() {
            return;
        }
        let next = self.pool.acquire(self.batch_size);
        let buf = mem::replace(&mut self.buffers[dest], next);
        self.send(dest, buf);
    }

    fn send(&self, dest: usize, items: Vec<Item<T>>) {
        let msg = Message {
            channel: self.channel,
            items,
        };
        if self.dests[dest].send(msg).is_err() {
            panic!("destination replica disconnected before end of stream");
        }
    }

    /// Keep quiet destinations alive: every `WF_DEFAULT_WM_AMOUNT` routed
    /// envelopes, if at least `WF_DEFAULT_WM_INTERVAL_USEC` passed since the
    /// last check, destinations that received nothing get a punctuation with
    /// the current upstream watermark.
    fn maybe_generate_punctuations(&mut self, watermark: Timestamp) {
        if matches!(self.routing, Routing::Forward) {
            return;
        }
        self.seen += 1;
        if self.seen < config::wm_amount() {
            return;
        }
        self.seen = 0;
        if duration_usec(self.last_check.elapsed()) < config::wm_interval_usec() {
            return;
        }
        self.last_check = Instant::now();
        for dest in 0..self.dests.len() {
            if self.delivered[dest] == 0 && self.last_wm[dest] < watermark {
                self.flush_dest(dest);
                self.send_punctuation(dest, watermark);
            }
            self.delivered[dest] = 0;
        }
    }

    fn send_punctuation(&mut self, dest: usize, watermark: Timestamp) {
        self.last_wm[dest] = watermark;
        let mut buf = self.pool.acquire(1);
        buf.push(Item::Punctuation { watermark });
        self.send(dest, buf);
    }

    /// Propagate a watermark advance to every destination that is behind it.
    pub fn punctuate(&mut self, watermark: Timestamp) {
        for dest in 0..self.dests.len() {
            if self.last_wm[dest] < watermark {
                self.flush_dest(dest);
                self.send_punctuation(dest, watermark);
            }
        }
    }

    pub fn flush(&mut self) {
        for dest in 0..self.dests.len() {
            self.flush_dest(dest);
        }
    }

    /// Flush, raise every destination to the final watermark and close all
    /// output channels.
    pub fn terminate(&mut self) {
        self.flush();
        self.punctuate(WM_MAX);
        for dest in 0..self.dests.len() {
            let mut buf = self.pool.acquire(1);
            buf.push(Item::Terminate);
            self.send(dest, buf);
        }
    }

    pub fn sent_tuples(&self) -> u64 {
        self.sent_tuples
    }
}

/// Fan-out emitter installed after a `split`: payloads go to the branch the
/// selector picks, control envelopes go to every branch.
pub(crate) struct SplitEmitter<T> {
    selector: Arc<dyn Fn(&T) -> usize + Send + Sync>,
    branches: Vec<Emitter<T>>,
    seen: u64,
    last_check: Instant,
}

impl<T: Clone> SplitEmitter<T> {
    pub fn new(selector: Arc<dyn Fn(&T) -> usize + Send + Sync>, branches: Vec<Emitter<T>>) -> Self {
        assert!(!branches.is_empty(), "split without branches");
        SplitEmitter {
            selector,
            branches,
            seen: 0,
            last_check: Instant::now(),
        }
    }

    pub fn push(
        &mut self,
        payload: T,
        timestamp: Timestamp,
        watermark: Timestamp,
        identifier: u64,
    ) {
        let branch = (self.selector)(&payload);
        assert!(
            branch < self.branches.len(),
            "split selector returned branch {} out of {}",
            branch,
            self.branches.len()
        );
        self.branches[branch].push(payload, timestamp, watermark, identifier);
        self.maybe_relay_progress(branch, watermark);
    }

    /// Branches that are not receiving payloads still need to observe the
    /// watermark; relay it with the same cadence an emitter uses for its
    /// quiet destinations.
    fn maybe_relay_progress(&mut self, active: usize, watermark: Timestamp) {
        self.seen += 1;
        if self.seen < config::wm_amount() {
            return;
        }
        self.seen = 0;
        if duration_usec(self.last_check.elapsed()) < config::wm_interval_usec() {
            return;
        }
        self.last_check = Instant::now();
        for (branch, emitter) in self.branches.iter_mut().enumerate() {
            if branch != active {
                emitter.punctuate(watermark);
            }
        }
    }

    pub fn punctuate(&mut self, watermark: Timestamp) {
        for emitter in &mut self.branches {
            emitter.punctuate(watermark);
        }
    }

    pub fn flush(&mut self) {
        for emitter in &mut self.branches {
            emitter.flush();
        }
    }

    pub fn terminate(&mut self) {
        for emitter in &mut self.branches {
            emitter.terminate();
        }
    }

    pub fn sent_tuples(&self) -> u64 {
        self.branches.iter().map(|e| e.sent_tuples()).sum()
    }
}

/// The output side handed to a replica: nothing for sinks, one emitter for
/// ordinary stages, a split fan-out after a `split`.
pub(crate) enum EmitterSet<T> {
    Null,
    Single(Emitter<T>),
    Split(SplitEmitter<T>),
}

impl<T: Clone> EmitterSet<T> {
    pub fn push(
        &mut self,
        payload: T,
        timestamp: Timestamp,
        watermark: Timestamp,
        identifier: u64,
    ) {
        match self {
            EmitterSet::Null => unreachable!("sink replicas do not emit"),
            EmitterSet::Single(e) => e.push(payload, timestamp, watermark, identifier),
            EmitterSet::Split(e) => e.push(payload, timestamp, watermark, identifier),
        }
    }

    pub fn punctuate(&mut self, watermark: Timestamp) {
        match self {
            EmitterSet::Null => {}
            EmitterSet::Single(e) => e.punctuate(watermark),
            EmitterSet::Split(e) => e.punctuate(watermark),
        }
    }

    pub fn terminate(&mut self) {
        match self {
            EmitterSet::Null => {}
            EmitterSet::Single(e) => e.terminate(),
            EmitterSet::Split(e) => e.terminate(),
        }
    }

    pub fn sent_tuples(&self) -> u64 {
        match self {
            EmitterSet::Null => 0,
            EmitterSet::Single(e) => e.sent_tuples(),
            EmitterSet::Split(e) => e.sent_tuples(),
        }
    }
}
