//! Incremental sliding-window aggregation over a flat aggregator tree.
//!
//! The tree keeps one leaf per pane and every internal node holds the
//! combination of its children, so evaluating a window is one range-combine
//! over its panes, `O(log n)`, and a (non-expired) late tuple only rebuilds
//! the path from its pane to the root.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::emitter::EmitterSet;
use crate::graph::{MultiPipe, RoutingSpec, StageSpec};
use crate::message::Timestamp;
use crate::operator::window::{window_options, Fired, WindowKind, WindowOpts, WindowSpec};
use crate::operator::{key_hash, Chainable, CommonOpts, Data, DataKey, GroupHasherBuilder, KeyerFn};
use crate::replica::StageLogic;

/// A complete binary tree over a circular buffer of pane aggregates.
///
/// Leaves are addressed by absolute pane id modulo the capacity; the live
/// span (max live pane - min live pane + 1) never exceeds the capacity, the
/// tree grows when it would.
pub(crate) struct FlatFat<A> {
    cap: usize,
    /// Internal nodes, heap layout: root at 1, children of `i` at `2i`,
    /// `2i + 1`. Index 0 unused.
    inner: Vec<Option<A>>,
    /// `(absolute pane id, aggregate)` per slot.
    leaves: Vec<Option<(u64, A)>>,
    live: usize,
    min_live: u64,
    max_live: u64,
}

impl<A: Clone> FlatFat<A> {
    pub fn new() -> Self {
        Self::with_capacity(8)
    }

    fn with_capacity(cap: usize) -> Self {
        assert!(cap.is_power_of_two() && cap >= 2);
        FlatFat {
            cap,
            inner: vec![None; cap],
            leaves: vec![None; cap],
            live: 0,
            min_live: 0,
            max_live: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    fn node_value(&self, node: usize) -> Option<&A> {
        if node >= self.cap {
            self.leaves[node - self.cap].as_ref().map(|(_, a)| a)
        } else {
            self.inner[node].as_ref()
        }
    }

    /// Recompute the path from leaf `slot` up to the root.
    fn refresh(&mut self, slot: usize, combine: &dyn Fn(&A, &A) -> A) {
        let mut node = (self.cap + slot) / 2;
        loop {
            let combined = match (self.node_value(2 * node), self.node_value(2 * node + 1)) {
                (Some(a), Some(b)) => Some(combine(a, b)),
                (Some(a), None) => Some(a.clone()),
                (None, Some(b)) => Some(b.clone()),
                (None, None) => None,
            };
            self.inner[node] = combined;
            if node == 1 {
                break;
            }
            node /= 2;
        }
    }

    /// Merge `value` into the leaf of `pane`, growing the tree if the live
    /// span would exceed the capacity.
    pub fn insert(&mut self, pane: u64, value: A, combine: &dyn Fn(&A, &A) -> A) {
        let (lo, hi) = if self.live == 0 {
            (pane, pane)
        } else {
            (self.min_live.min(pane), self.max_live.max(pane))
        };
        let span = hi - lo + 1;
        if span > self.cap as u64 {
            self.grow(span, combine);
        }
        let slot = (pane % self.cap as u64) as usize;
        match &mut self.leaves[slot] {
            Some((id, acc)) => {
                assert_eq!(*id, pane, "pane slot collision");
                *acc = combine(acc, &value);
            }
            slot_value @ None => {
                *slot_value = Some((pane, value));
                self.live += 1;
            }
        }
        if self.live == 1 {
            self.min_live = pane;
            self.max_live = pane;
        } else {
            self.min_live = self.min_live.min(pane);
            self.max_live = self.max_live.max(pane);
        }
        self.refresh(slot, combine);
    }

    fn grow(&mut self, span: u64, combine: &dyn Fn(&A, &A) -> A) {
        let mut cap = self.cap;
        while (cap as u64) < span {
            cap *= 2;
        }
        let mut grown = FlatFat::with_capacity(cap);
        for leaf in self.leaves.drain(..).flatten() {
            grown.insert(leaf.0, leaf.1, combine);
        }
        *self = grown;
    }

    /// Drop every pane below `bound`.
    pub fn evict_below(&mut self, bound: u64, combine: &dyn Fn(&A, &A) -> A) {
        while self.live > 0 && self.min_live < bound {
            let slot = (self.min_live % self.cap as u64) as usize;
            if matches!(self.leaves[slot], Some((id, _)) if id == self.min_live) {
                self.leaves[slot] = None;
                self.live -= 1;
                self.refresh(slot, combine);
            }
            if self.live == 0 {
                break;
            }
            // advance to the next live pane
            let mut next = self.min_live + 1;
            while next <= self.max_live {
                let slot = (next % self.cap as u64) as usize;
                if matches!(self.leaves[slot], Some((id, _)) if id == next) {
                    break;
                }
                next += 1;
            }
            self.min_live = next;
        }
    }

    /// Combine the live panes in `[from, to)`, preserving pane order.
    pub fn query(&self, from: u64, to: u64, combine: &dyn Fn(&A, &A) -> A) -> Option<A> {
        if from >= to || self.live == 0 {
            return None;
        }
        let span = to - from;
        assert!(span <= self.cap as u64, "window wider than the tree");
        let start = (from % self.cap as u64) as usize;
        let end = start as u64 + span;
        if end <= self.cap as u64 {
            self.query_phys(1, 0, self.cap, start, end as usize, combine)
        } else {
            // the range wraps around the circular buffer: combine the two
            // physical halves in logical order
            let head = self.query_phys(1, 0, self.cap, start, self.cap, combine);
            let tail = self.query_phys(1, 0, self.cap, 0, (end - self.cap as u64) as usize, combine);
            match (head, tail) {
                (Some(a), Some(b)) => Some(combine(&a, &b)),
                (a, b) => a.or(b),
            }
        }
    }

    fn query_phys(
        &self,
        node: usize,
        node_lo: usize,
        node_hi: usize,
        lo: usize,
        hi: usize,
        combine: &dyn Fn(&A, &A) -> A,
    ) -> Option<A> {
        if hi <= node_lo || node_hi <= lo {
            return None;
        }
        if lo <= node_lo && node_hi <= hi {
            return self.node_value(node).cloned();
        }
        let mid = (node_lo + node_hi) / 2;
        let left = self.query_phys(2 * node, node_lo, mid, lo, hi, combine);
        let right = self.query_phys(2 * node + 1, mid, node_hi, lo, hi, combine);
        match (left, right) {
            (Some(a), Some(b)) => Some(combine(&a, &b)),
            (a, b) => a.or(b),
        }
    }
}

struct FatState<A> {
    fat: FlatFat<A>,
    /// Next window id to fire.
    next_fire: u64,
    /// Count-based arrival counter of the key.
    arrivals: u64,
}

impl<A: Clone> Default for FatState<A> {
    fn default() -> Self {
        FatState {
            fat: FlatFat::new(),
            next_fire: 0,
            arrivals: 0,
        }
    }
}

pub(crate) struct FfatStage<I, K, A> {
    keyer: Box<dyn FnMut(&I) -> K + Send>,
    lift: Box<dyn FnMut(&I) -> A + Send>,
    combine: Arc<dyn Fn(&A, &A) -> A + Send + Sync>,
    spec: WindowSpec,
    /// Pane width, in tuples (CB) or microseconds (TB).
    pane: u64,
    /// Window length and slide expressed in panes.
    len_panes: u64,
    slide_panes: u64,
    keys: HashMap<K, FatState<A>, GroupHasherBuilder>,
    fired: Vec<Fired<K, A>>,
    ignored: u64,
    next_id: u64,
    closing: Option<Arc<dyn Fn() + Send + Sync>>,
    _marker: PhantomData<fn(&I)>,
}

impl<I, K: DataKey, A: Clone> FfatStage<I, K, A> {
    fn new(
        keyer: Box<dyn FnMut(&I) -> K + Send>,
        lift: Box<dyn FnMut(&I) -> A + Send>,
        combine: Arc<dyn Fn(&A, &A) -> A + Send + Sync>,
        spec: WindowSpec,
        closing: Option<Arc<dyn Fn() + Send + Sync>>,
    ) -> Self {
        let pane = spec.pane();
        FfatStage {
            keyer,
            lift,
            combine,
            spec,
            pane,
            len_panes: spec.len / pane,
            slide_panes: spec.slide / pane,
            keys: HashMap::default(),
            fired: Vec::new(),
            ignored: 0,
            next_id: 0,
            closing,
            _marker: PhantomData,
        }
    }

    /// Fire window `next_fire` of one key, advancing the eviction bound.
    fn fire_one(
        key: &K,
        st: &mut FatState<A>,
        combine: &dyn Fn(&A, &A) -> A,
        len_panes: u64,
        slide_panes: u64,
        timestamp: Timestamp,
        fired: &mut Vec<Fired<K, A>>,
    ) {
        let first_pane = st.next_fire * slide_panes;
        if let Some(acc) = st.fat.query(first_pane, first_pane + len_panes, combine) {
            fired.push(Fired {
                key: key.clone(),
                acc,
                timestamp,
            });
        }
        st.next_fire += 1;
        st.fat.evict_below(st.next_fire * slide_panes, combine);
    }

    fn drain<O: Data>(
        &mut self,
        frontier: Timestamp,
        out: &mut EmitterSet<O>,
        wrap: impl Fn(K, A) -> O,
    ) {
        let shift = self.spec.lateness;
        for fired in self.fired.drain(..) {
            let output = wrap(fired.key, fired.acc);
            let id = self.next_id;
            self.next_id += 1;
            out.push(output, fired.timestamp, frontier.saturating_sub(shift), id);
        }
    }
}

impl<I, K, A> StageLogic<I, (K, A)> for FfatStage<I, K, A>
where
    I: Data,
    K: DataKey,
    A: Data,
{
    fn on_tuple(
        &mut self,
        payload: I,
        timestamp: Timestamp,
        _identifier: u64,
        frontier: Timestamp,
        out: &mut EmitterSet<(K, A)>,
    ) {
        let key = (self.keyer)(&payload);
        let value = (self.lift)(&payload);
        let st = self.keys.entry(key.clone()).or_default();
        match self.spec.kind {
            WindowKind::CountBased => {
                st.arrivals += 1;
                let pane = (st.arrivals - 1) / self.pane;
                st.fat.insert(pane, value, &*self.combine);
                // exactly one window completes when the count hits its end
                if st.arrivals == st.next_fire * self.spec.slide + self.spec.len {
                    Self::fire_one(
                        &key,
                        st,
                        &*self.combine,
                        self.len_panes,
                        self.slide_panes,
                        timestamp,
                        &mut self.fired,
                    );
                }
            }
            WindowKind::TimeBased => {
                let pane = timestamp / self.pane;
                // dead when even its last window has fired
                if pane / self.slide_panes < st.next_fire {
                    self.ignored += 1;
                    return;
                }
                st.fat.insert(pane, value, &*self.combine);
            }
        }
        if !self.fired.is_empty() {
            self.drain(frontier, out, |k, a| (k, a));
        }
    }

    fn on_frontier(&mut self, frontier: Timestamp, out: &mut EmitterSet<(K, A)>) {
        if self.spec.kind != WindowKind::TimeBased {
            return;
        }
        let (len, slide, lateness) = (self.spec.len, self.spec.slide, self.spec.lateness);
        let start = self.fired.len();
        for (key, st) in self.keys.iter_mut() {
            loop {
                let end = st.next_fire.saturating_mul(slide).saturating_add(len);
                if end.saturating_add(lateness) > frontier {
                    break;
                }
                if st.fat.is_empty() {
                    // skip the run of windows nothing mapped into
                    st.next_fire = st.next_fire.max(self.spec.first_live_window(frontier));
                    break;
                }
                Self::fire_one(
                    key,
                    st,
                    &*self.combine,
                    self.len_panes,
                    self.slide_panes,
                    end - 1,
                    &mut self.fired,
                );
            }
        }
        self.fired[start..].sort_by_key(|f| f.timestamp);
        if !self.fired.is_empty() {
            self.drain(frontier, out, |k, a| (k, a));
        }
    }

    fn on_close(&mut self, _out: &mut EmitterSet<(K, A)>) {
        if let Some(closing) = &self.closing {
            closing();
        }
    }

    fn watermark_shift(&self) -> Timestamp {
        self.spec.lateness
    }

    fn ignored(&self) -> u64 {
        self.ignored
    }
}

/// Keyed sliding windows evaluated incrementally over a flat aggregator
/// tree.
///
/// `lift` turns one tuple into a partial aggregate, `combine` merges two
/// and must be associative. Emits `(key, aggregate)` per fired window.
pub struct FfatAggregator<I, K, A, Fk, Fl, Fc> {
    keyer: Fk,
    lift: Fl,
    combine: Fc,
    pub(crate) opts: CommonOpts<I>,
    pub(crate) win: WindowOpts,
    _marker: PhantomData<fn(&I) -> (K, A)>,
}

impl<I, K, A, Fk, Fl, Fc> FfatAggregator<I, K, A, Fk, Fl, Fc>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Fl: Fn(&I) -> A + Clone + Send + 'static,
    Fc: Fn(&A, &A) -> A + Clone + Send + Sync + 'static,
{
    pub fn new(keyer: Fk, lift: Fl, combine: Fc) -> Self {
        FfatAggregator {
            keyer,
            lift,
            combine,
            opts: CommonOpts::default(),
            win: WindowOpts::default(),
            _marker: PhantomData,
        }
    }

    window_options!();
}

impl<I, K, A, Fk, Fl, Fc> Chainable<I> for FfatAggregator<I, K, A, Fk, Fl, Fc>
where
    I: Data,
    K: DataKey,
    A: Data,
    Fk: KeyerFn<K, I> + Sync,
    Fl: Fn(&I) -> A + Clone + Send + 'static,
    Fc: Fn(&A, &A) -> A + Clone + Send + Sync + 'static,
{
    type Out = (K, A);

    fn attach(self, pipe: MultiPipe<I>) -> MultiPipe<(K, A)> {
        let FfatAggregator {
            keyer,
            lift,
            combine,
            opts,
            win,
            ..
        } = self;
        let spec = win.build("FfatAggregator");
        let route = {
            let keyer = keyer.clone();
            Arc::new(move |item: &I| key_hash(&keyer(item))) as Arc<dyn Fn(&I) -> u64 + Send + Sync>
        };
        let combine: Arc<dyn Fn(&A, &A) -> A + Send + Sync> = Arc::new(combine);
        let logics = (0..opts.parallelism.max(1))
            .map(|_| {
                let keyer = keyer.clone();
                let lift = lift.clone();
                Box::new(FfatStage::new(
                    Box::new(move |item: &I| keyer(item)),
                    Box::new(move |item: &I| lift(item)),
                    combine.clone(),
                    spec,
                    opts.closing.clone(),
                )) as Box<dyn StageLogic<I, (K, A)>>
            })
            .collect();
        pipe.chain_stage(StageSpec::new(
            "Ffat_Aggregator",
            opts.name,
            opts.parallelism,
            opts.batch_size,
            RoutingSpec::KeyBy(route),
            Some(WindowOpts::meta(&spec)),
            logics,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sum(a: &u64, b: &u64) -> u64 {
        a + b
    }

    #[test]
    fn tree_range_combines() {
        let mut fat: FlatFat<u64> = FlatFat::new();
        for pane in 0..6u64 {
            fat.insert(pane, pane + 1, &sum);
        }
        assert_eq!(fat.query(0, 4, &sum), Some(1 + 2 + 3 + 4));
        assert_eq!(fat.query(2, 6, &sum), Some(3 + 4 + 5 + 6));
        assert_eq!(fat.query(3, 3, &sum), None);
    }

    #[test]
    fn tree_updates_existing_panes() {
        let mut fat: FlatFat<u64> = FlatFat::new();
        fat.insert(0, 1, &sum);
        fat.insert(1, 10, &sum);
        fat.insert(0, 2, &sum);
        assert_eq!(fat.query(0, 2, &sum), Some(13));
    }

    #[test]
    fn tree_grows_and_wraps() {
        let mut fat: FlatFat<u64> = FlatFat::new();
        for pane in 0..100u64 {
            fat.insert(pane, 1, &sum);
            if pane >= 16 {
                fat.evict_below(pane - 16, &sum);
            }
        }
        assert_eq!(fat.query(90, 100, &sum), Some(10));
        assert_eq!(fat.query(84, 100, &sum), Some(16));
    }

    #[test]
    fn tree_eviction_drops_prefix() {
        let mut fat: FlatFat<u64> = FlatFat::new();
        for pane in 0..8u64 {
            fat.insert(pane, pane, &sum);
        }
        fat.evict_below(4, &sum);
        assert_eq!(fat.query(4, 8, &sum), Some(4 + 5 + 6 + 7));
        assert!(fat.query(4, 8, &sum).is_some());
        fat.evict_below(8, &sum);
        assert!(fat.is_empty());
    }

    #[test]
    fn order_sensitive_combine_is_preserved_across_wrap() {
        // string concatenation is associative but not commutative
        let concat = |a: &String, b: &String| format!("{}{}", a, b);
        let mut fat: FlatFat<String> = FlatFat::with_capacity(4);
        for pane in 0..4u64 {
            fat.insert(pane, pane.to_string(), &concat);
        }
        fat.evict_below(2, &concat);
        fat.insert(4, "4".into(), &concat);
        fat.insert(5, "5".into(), &concat);
        assert_eq!(fat.query(2, 6, &concat), Some("2345".to_string()));
    }
}
