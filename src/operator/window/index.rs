//! Per-key bookkeeping of open windows, shared by the keyed and parallel
//! window operators.
//!
//! Windows are created lazily when the first tuple maps into them, updated
//! in place, and destroyed as soon as they fire. With a stride greater than
//! one the index only materialises the windows owned by this replica
//! (`id % stride == offset`) and silently drops tuples belonging to nobody
//! here.

use std::collections::{HashMap, VecDeque};

use crate::message::Timestamp;
use crate::operator::window::{WindowKind, WindowSpec};
use crate::operator::{DataKey, GroupHasherBuilder};

/// A window result ready to be emitted. `timestamp` is the event time of
/// the result: the triggering tuple for count-based windows, the last
/// instant of the window for time-based ones.
pub(crate) struct Fired<K, A> {
    pub key: K,
    pub acc: A,
    pub timestamp: Timestamp,
}

struct OpenWin<A> {
    id: u64,
    filled: u64,
    acc: A,
}

struct KeyState<A> {
    arrivals: u64,
    open: VecDeque<OpenWin<A>>,
}

impl<A> Default for KeyState<A> {
    fn default() -> Self {
        KeyState {
            arrivals: 0,
            open: VecDeque::new(),
        }
    }
}

/// Smallest id `>= from` owned by `(stride, offset)`.
fn owned_from(from: u64, stride: u64, offset: u64) -> u64 {
    let r = from % stride;
    from + (offset + stride - r) % stride
}

/// Largest id `<= upto` owned by `(stride, offset)`, if any.
fn owned_upto(upto: u64, stride: u64, offset: u64) -> Option<u64> {
    let down = (upto % stride + stride - offset) % stride;
    upto.checked_sub(down)
}

pub(crate) struct WindowIndex<I, K, A> {
    spec: WindowSpec,
    stride: u64,
    offset: u64,
    init: A,
    fold: Box<dyn FnMut(&mut A, &I) + Send>,
    keys: HashMap<K, KeyState<A>, GroupHasherBuilder>,
    ignored: u64,
}

impl<I, K: DataKey, A: Clone> WindowIndex<I, K, A> {
    pub fn new(
        spec: WindowSpec,
        stride: u64,
        offset: u64,
        init: A,
        fold: Box<dyn FnMut(&mut A, &I) + Send>,
    ) -> Self {
        assert!(stride >= 1 && offset < stride);
        WindowIndex {
            spec,
            stride,
            offset,
            init,
            fold,
            keys: HashMap::default(),
            ignored: 0,
        }
    }

    pub fn lateness(&self) -> Timestamp {
        self.spec.lateness
    }

    pub fn ignored(&self) -> u64 {
        self.ignored
    }

    pub fn on_tuple(
        &mut self,
        key: K,
        item: &I,
        timestamp: Timestamp,
        frontier: Timestamp,
        fired: &mut Vec<Fired<K, A>>,
    ) {
        match self.spec.kind {
            WindowKind::CountBased => self.on_tuple_cb(key, item, timestamp, fired),
            WindowKind::TimeBased => self.on_tuple_tb(key, item, timestamp, frontier),
        }
    }

    fn on_tuple_cb(&mut self, key: K, item: &I, timestamp: Timestamp, fired: &mut Vec<Fired<K, A>>) {
        let (len, slide) = (self.spec.len, self.spec.slide);
        let (stride, offset) = (self.stride, self.offset);
        let st = self.keys.entry(key.clone()).or_default();
        st.arrivals += 1;
        let c = st.arrivals;
        // window `w` holds the arrivals in (w*slide, w*slide + len]
        let w_max = (c - 1) / slide;
        let w_min = if c <= len { 0 } else { (c - len).div_ceil(slide) };
        if w_min > w_max {
            return;
        }
        let lo = owned_from(w_min, stride, offset);
        let hi = match owned_upto(w_max, stride, offset) {
            Some(hi) if hi >= lo => hi,
            _ => return,
        };
        // arrivals are consecutive, so new windows only appear at the tail
        let mut next = st.open.back().map(|w| w.id + stride).unwrap_or(lo);
        next = next.max(lo);
        while next <= hi {
            st.open.push_back(OpenWin {
                id: next,
                filled: 0,
                acc: self.init.clone(),
            });
            next += stride;
        }
        for w in st.open.iter_mut() {
            if w.id >= lo && w.id <= hi {
                (self.fold)(&mut w.acc, item);
                w.filled += 1;
            }
        }
        while let Some(front) = st.open.front() {
            if front.filled < len {
                break;
            }
            let win = st.open.pop_front().unwrap();
            fired.push(Fired {
                key: key.clone(),
                acc: win.acc,
                timestamp,
            });
        }
    }

    fn on_tuple_tb(&mut self, key: K, item: &I, timestamp: Timestamp, frontier: Timestamp) {
        let (len, slide, lateness) = (self.spec.len, self.spec.slide, self.spec.lateness);
        let (stride, offset) = (self.stride, self.offset);
        // windows are [k*slide, k*slide + len)
        let k_max = timestamp / slide;
        let k_min = if timestamp < len {
            0
        } else {
            (timestamp - len) / slide + 1
        };
        let lo_raw = owned_from(k_min, stride, offset);
        let hi = match owned_upto(k_max, stride, offset) {
            Some(hi) if hi >= lo_raw => hi,
            _ => return, // owned by another replica
        };
        // a window whose firing point has passed cannot be revived
        if hi * slide + len + lateness <= frontier {
            self.ignored += 1;
            return;
        }
        let lo = lo_raw.max(owned_from(
            self.spec.first_live_window(frontier),
            stride,
            offset,
        ));
        if lo > hi {
            self.ignored += 1;
            return;
        }
        let st = self.keys.entry(key).or_default();
        let mut id = lo;
        while id <= hi {
            if let Err(pos) = st.open.binary_search_by(|w| w.id.cmp(&id)) {
                st.open.insert(
                    pos,
                    OpenWin {
                        id,
                        filled: 0,
                        acc: self.init.clone(),
                    },
                );
            }
            id += stride;
        }
        for w in st.open.iter_mut() {
            if w.id >= lo && w.id <= hi {
                (self.fold)(&mut w.acc, item);
                w.filled += 1;
            }
        }
    }

    /// Fire every time-based window whose firing point the frontier passed,
    /// in non-decreasing end-time order across keys.
    pub fn on_frontier(&mut self, frontier: Timestamp, fired: &mut Vec<Fired<K, A>>) {
        if self.spec.kind != WindowKind::TimeBased {
            return;
        }
        let (len, slide, lateness) = (self.spec.len, self.spec.slide, self.spec.lateness);
        let start = fired.len();
        for (key, st) in self.keys.iter_mut() {
            while let Some(front) = st.open.front() {
                let end = front.id * slide + len;
                if end.saturating_add(lateness) > frontier {
                    break;
                }
                let win = st.open.pop_front().unwrap();
                fired.push(Fired {
                    key: key.clone(),
                    acc: win.acc,
                    timestamp: end - 1,
                });
            }
        }
        fired[start..].sort_by_key(|f| f.timestamp);
        // no retention after firing; the frontier check prevents revivals
        self.keys.retain(|_, st| !st.open.is_empty());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::window::{WindowKind, WindowSpec};

    fn sum_index(spec: WindowSpec) -> WindowIndex<u64, u64, u64> {
        WindowIndex::new(spec, 1, 0, 0u64, Box::new(|acc, x: &u64| *acc += *x))
    }

    fn cb(len: u64, slide: u64) -> WindowSpec {
        WindowSpec {
            kind: WindowKind::CountBased,
            len,
            slide,
            lateness: 0,
            quantum: None,
        }
    }

    fn tb(len: u64, slide: u64, lateness: u64) -> WindowSpec {
        WindowSpec {
            kind: WindowKind::TimeBased,
            len,
            slide,
            lateness,
            quantum: None,
        }
    }

    #[test]
    fn count_based_sliding_sums() {
        let mut index = sum_index(cb(4, 2));
        let mut fired = Vec::new();
        for v in 1..=12u64 {
            index.on_tuple(0, &v, v, 0, &mut fired);
        }
        let sums: Vec<u64> = fired.iter().map(|f| f.acc).collect();
        assert_eq!(sums, vec![10, 18, 26, 34, 42]);
    }

    #[test]
    fn count_based_window_count_law() {
        // floor((n - w) / s) + 1 complete windows
        for (n, w, s) in [(100u64, 10u64, 3u64), (57, 8, 8), (12, 4, 2), (3, 4, 2)] {
            let mut index = sum_index(cb(w, s));
            let mut fired = Vec::new();
            for v in 0..n {
                index.on_tuple(7, &v, v, 0, &mut fired);
            }
            let expected = if n >= w { (n - w) / s + 1 } else { 0 };
            assert_eq!(fired.len() as u64, expected, "n={} w={} s={}", n, w, s);
        }
    }

    #[test]
    fn time_based_tumbling_counts() {
        let mut index: WindowIndex<u64, u64, u64> = WindowIndex::new(
            tb(1000, 1000, 0),
            1,
            0,
            0,
            Box::new(|acc, _x: &u64| *acc += 1),
        );
        let mut fired = Vec::new();
        for i in 0..100u64 {
            let ts = i * 100;
            index.on_tuple(0, &1, ts, ts, &mut fired);
        }
        index.on_frontier(Timestamp::MAX, &mut fired);
        assert_eq!(fired.len(), 10);
        assert!(fired.iter().all(|f| f.acc == 10));
        let ends: Vec<u64> = fired.iter().map(|f| f.timestamp + 1).collect();
        assert_eq!(ends, (1..=10).map(|k| k * 1000).collect::<Vec<_>>());
    }

    #[test]
    fn time_based_late_tuple_is_ignored() {
        let mut index: WindowIndex<u64, u64, u64> = WindowIndex::new(
            tb(1000, 1000, 500),
            1,
            0,
            0,
            Box::new(|acc, _x: &u64| *acc += 1),
        );
        let mut fired = Vec::new();
        for i in 0..100u64 {
            let ts = i * 100;
            index.on_tuple(0, &1, ts, ts, &mut fired);
            index.on_frontier(ts, &mut fired);
        }
        // frontier 9900: [0, 1000) fired long ago, a tuple at 350 is dead
        index.on_tuple(0, &1, 350, 9900, &mut fired);
        assert_eq!(index.ignored(), 1);
        index.on_frontier(Timestamp::MAX, &mut fired);
        assert_eq!(fired.len(), 10);
        assert!(fired.iter().all(|f| f.acc == 10));
    }

    #[test]
    fn parallel_ownership_partitions_windows() {
        let stride = 3u64;
        let mut indexes: Vec<WindowIndex<u64, u64, u64>> = (0..stride)
            .map(|offset| {
                WindowIndex::new(cb(4, 2), stride, offset, 0, Box::new(|acc, x: &u64| *acc += *x))
            })
            .collect();
        let mut fired = Vec::new();
        for v in 1..=40u64 {
            for index in indexes.iter_mut() {
                index.on_tuple(0, &v, v, 0, &mut fired);
            }
        }
        // same results as a single index over the same stream
        let mut all: Vec<u64> = fired.iter().map(|f| f.acc).collect();
        all.sort_unstable();
        let mut reference = Vec::new();
        let mut single = sum_index(cb(4, 2));
        for v in 1..=40u64 {
            single.on_tuple(0, &v, v, 0, &mut reference);
        }
        let mut expected: Vec<u64> = reference.iter().map(|f| f.acc).collect();
        expected.sort_unstable();
        assert_eq!(all, expected);
    }
}
