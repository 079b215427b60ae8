//! The input side of a replica: channel watermark tracking and the
//! execution-mode dependent consumption order.
//!
//! In [`ExecutionMode::Default`](crate::ExecutionMode) all upstream emitters
//! share one FIFO queue and envelopes are consumed in arrival order. In the
//! ordered modes each upstream has a dedicated queue and the replica merges
//! the heads in non-decreasing `(timestamp, channel)` order, either strictly
//! (`Deterministic`) or with a bounded timestamp slack (`Probabilistic`).

use std::collections::VecDeque;
use std::mem;
use std::time::Duration;

use crate::channel::RecvError;
use crate::message::{Item, MessageReceiver, Recycler, Timestamp, WM_MAX};

/// How long the probabilistic merge waits on a lagging channel before
/// re-evaluating the candidates.
const LAG_POLL: Duration = Duration::from_micros(200);

/// What a replica observes from its input side.
pub(crate) enum Event<T> {
    Tuple {
        payload: T,
        timestamp: Timestamp,
        identifier: u64,
    },
    /// The watermark of some channel moved; the frontier may have advanced.
    Progress,
    /// Every input channel delivered its end-of-stream marker.
    Closed,
}

/// Per-channel watermarks of a replica. The frontier is their minimum.
pub(crate) struct Frontier {
    wm: Vec<Timestamp>,
}

impl Frontier {
    fn new(channels: usize) -> Self {
        Frontier {
            wm: vec![0; channels],
        }
    }

    fn update(&mut self, channel: usize, watermark: Timestamp) {
        assert!(
            watermark >= self.wm[channel],
            "watermark regression on input channel {}: {} < {}",
            channel,
            watermark,
            self.wm[channel]
        );
        self.wm[channel] = watermark;
    }

    fn channel(&self, channel: usize) -> Timestamp {
        self.wm[channel]
    }

    fn min(&self) -> Timestamp {
        self.wm.iter().copied().min().unwrap_or(WM_MAX)
    }
}

pub(crate) struct FifoInput<T> {
    rx: MessageReceiver<T>,
    recyclers: Vec<Recycler<T>>,
    frontier: Frontier,
    open: usize,
    /// Current batch, reversed so that envelopes pop in arrival order.
    buf: Vec<Item<T>>,
    buf_channel: usize,
}

pub(crate) struct OrderedChannel<T> {
    rx: MessageReceiver<T>,
    recycler: Recycler<T>,
    buf: VecDeque<Item<T>>,
    open: bool,
}

pub(crate) struct OrderedInput<T> {
    channels: Vec<OrderedChannel<T>>,
    frontier: Frontier,
    /// `None` is the strict deterministic merge.
    slack: Option<u64>,
    open: usize,
}

pub(crate) enum Input<T> {
    Fifo(FifoInput<T>),
    Ordered(OrderedInput<T>),
}

impl<T> Input<T> {
    pub fn fifo(rx: MessageReceiver<T>, channels: usize, recyclers: Vec<Recycler<T>>) -> Self {
        assert_eq!(channels, recyclers.len());
        Input::Fifo(FifoInput {
            rx,
            recyclers,
            frontier: Frontier::new(channels),
            open: channels,
            buf: Vec::new(),
            buf_channel: 0,
        })
    }

    pub fn ordered(
        channels: Vec<(MessageReceiver<T>, Recycler<T>)>,
        slack: Option<u64>,
    ) -> Self {
        let open = channels.len();
        Input::Ordered(OrderedInput {
            frontier: Frontier::new(open),
            channels: channels
                .into_iter()
                .map(|(rx, recycler)| OrderedChannel {
                    rx,
                    recycler,
                    buf: VecDeque::new(),
                    open: true,
                })
                .collect(),
            slack,
            open,
        })
    }

    /// Minimum watermark across the input channels, after the last update.
    pub fn frontier(&self) -> Timestamp {
        match self {
            Input::Fifo(i) => i.frontier.min(),
            Input::Ordered(i) => i.frontier.min(),
        }
    }

    pub fn next(&mut self) -> Event<T> {
        match self {
            Input::Fifo(i) => i.next(),
            Input::Ordered(i) => i.next(),
        }
    }
}

impl<T> FifoInput<T> {
    fn next(&mut self) -> Event<T> {
        loop {
            if let Some(item) = self.buf.pop() {
                let channel = self.buf_channel;
                if self.buf.is_empty() {
                    self.recyclers[channel].give_back(mem::take(&mut self.buf));
                }
                match item {
                    Item::Tuple {
                        payload,
                        timestamp,
                        watermark,
                        identifier,
                    } => {
                        self.frontier.update(channel, watermark);
                        return Event::Tuple {
                            payload,
                            timestamp,
                            identifier,
                        };
                    }
                    Item::Punctuation { watermark } => {
                        self.frontier.update(channel, watermark);
                        return Event::Progress;
                    }
                    Item::Terminate => {
                        self.frontier.update(channel, WM_MAX);
                        self.open -= 1;
                        if self.open == 0 {
                            return Event::Closed;
                        }
                        return Event::Progress;
                    }
                }
            }
            match self.rx.recv() {
                Ok(mut msg) => {
                    msg.items.reverse();
                    self.buf = msg.items;
                    self.buf_channel = msg.channel;
                }
                Err(_) => panic!("input queue closed without end-of-stream marker"),
            }
        }
    }
}

impl<T> OrderedChannel<T> {
    /// Move a received batch into the in-order buffer, recycling its shell.
    fn absorb(&mut self, mut items: Vec<Item<T>>) {
        self.buf.extend(items.drain(..));
        self.recycler.give_back(items);
    }

    /// Drain everything already queued, without blocking.
    fn pump(&mut self) {
        while self.open {
            match self.rx.try_recv() {
                Ok(msg) => self.absorb(msg.items),
                Err(RecvError::Empty) => break,
                Err(_) => panic!("input channel closed without end-of-stream marker"),
            }
        }
    }
}

impl<T> OrderedInput<T> {
    fn next(&mut self) -> Event<T> {
        if self.open == 0 {
            return Event::Closed;
        }
        let idx = match self.slack {
            None => self.pick_deterministic(),
            Some(slack) => self.pick_probabilistic(slack),
        };
        self.take(idx)
    }

    /// Strict merge: every open channel must expose its head before the
    /// smallest `(key, channel)` candidate is released. Progress on quiet
    /// channels is guaranteed by the upstream punctuation generation.
    fn pick_deterministic(&mut self) -> usize {
        for idx in 0..self.channels.len() {
            while self.channels[idx].open && self.channels[idx].buf.is_empty() {
                match self.channels[idx].rx.recv() {
                    Ok(msg) => self.channels[idx].absorb(msg.items),
                    Err(_) => panic!("input channel closed without end-of-stream marker"),
                }
            }
        }
        self.candidate()
            .expect("no candidate with all channels filled")
    }

    /// Relaxed merge: a lagging channel is waited for only while its
    /// watermark is more than `slack` behind the candidate timestamp.
    fn pick_probabilistic(&mut self, slack: u64) -> usize {
        loop {
            for ch in &mut self.channels {
                ch.pump();
            }
            let candidate = self.candidate();
            match candidate {
                Some(idx) => {
                    let key = self.channels[idx].buf.front().unwrap().order_key();
                    let bound = key.saturating_sub(slack);
                    let lagging = (0..self.channels.len()).find(|&c| {
                        self.channels[c].open
                            && self.channels[c].buf.is_empty()
                            && self.frontier.channel(c) < bound
                    });
                    match lagging {
                        None => return idx,
                        Some(c) => self.wait_on(c),
                    }
                }
                None => {
                    // nothing buffered anywhere: wait on the first open one
                    let c = (0..self.channels.len())
                        .find(|&c| self.channels[c].open)
                        .expect("no open channel left");
                    self.wait_on(c);
                }
            }
        }
    }

    fn wait_on(&mut self, idx: usize) {
        match self.channels[idx].rx.recv_timeout(LAG_POLL) {
            Ok(msg) => self.channels[idx].absorb(msg.items),
            Err(RecvError::Timeout) => {}
            Err(_) => panic!("input channel closed without end-of-stream marker"),
        }
    }

    /// Channel holding the smallest `(order key, channel index)` head.
    fn candidate(&self) -> Option<usize> {
        self.channels
            .iter()
            .enumerate()
            .filter_map(|(idx, ch)| ch.buf.front().map(|item| (item.order_key(), idx)))
            .min()
            .map(|(_, idx)| idx)
    }

    fn take(&mut self, idx: usize) -> Event<T> {
        let item = self.channels[idx].buf.pop_front().unwrap();
        match item {
            Item::Tuple {
                payload,
                timestamp,
                watermark,
                identifier,
            } => {
                self.frontier.update(idx, watermark);
                Event::Tuple {
                    payload,
                    timestamp,
                    identifier,
                }
            }
            Item::Punctuation { watermark } => {
                self.frontier.update(idx, watermark);
                Event::Progress
            }
            Item::Terminate => {
                self.frontier.update(idx, WM_MAX);
                self.channels[idx].open = false;
                self.open -= 1;
                if self.open == 0 {
                    Event::Closed
                } else {
                    Event::Progress
                }
            }
        }
    }
}
