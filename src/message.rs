//! The message substrate: envelopes, batched messages and buffer recycling.

use crate::channel::{self, Receiver, Sender};

/// Event-time of a tuple or of a watermark, in microseconds.
pub type Timestamp = u64;

/// Watermark value carried by end-of-stream markers: no tuple will ever
/// follow them.
pub(crate) const WM_MAX: Timestamp = Timestamp::MAX;

/// Number of reusable batch buffers retained by each emitter.
pub(crate) const POOL_CAPACITY: usize = 64;

/// Microseconds in a coarse duration.
pub(crate) fn duration_usec(d: coarsetime::Duration) -> u64 {
    d.as_secs() * 1_000_000 + u64::from(d.subsec_nanos()) / 1_000
}

/// An envelope travelling on a channel between two replicas.
///
/// A stream on a single channel is a sequence of `Tuple`s and `Punctuation`s
/// closed by exactly one `Terminate`. The watermarks observed along the
/// sequence are non-decreasing.
#[derive(Clone, Debug)]
pub enum Item<T> {
    /// A payload with its event-time metadata.
    Tuple {
        payload: T,
        /// Event-time attached to the payload.
        timestamp: Timestamp,
        /// Lower bound on the timestamps of the tuples that will follow on
        /// this channel.
        watermark: Timestamp,
        /// Sequence number assigned by the emitting replica.
        identifier: u64,
    },
    /// A payload-less envelope that only advances the channel watermark.
    Punctuation { watermark: Timestamp },
    /// End-of-stream marker, closing the channel.
    Terminate,
}

impl<T> Item<T> {
    pub(crate) fn watermark(&self) -> Timestamp {
        match self {
            Item::Tuple { watermark, .. } => *watermark,
            Item::Punctuation { watermark } => *watermark,
            Item::Terminate => WM_MAX,
        }
    }

    /// Ordering key used by the ordered execution modes: tuples sort by
    /// their timestamp, control envelopes by the progress they carry.
    pub(crate) fn order_key(&self) -> Timestamp {
        match self {
            Item::Tuple { timestamp, .. } => *timestamp,
            Item::Punctuation { watermark } => *watermark,
            Item::Terminate => WM_MAX,
        }
    }
}

/// A batch of envelopes travelling together on one channel.
///
/// `channel` is the index of the input channel at the receiving replica;
/// every envelope in `items` retains its own `(timestamp, watermark)` pair.
#[derive(Debug)]
pub(crate) struct Message<T> {
    pub channel: usize,
    pub items: Vec<Item<T>>,
}

pub(crate) type MessageSender<T> = Sender<Message<T>>;
pub(crate) type MessageReceiver<T> = Receiver<Message<T>>;

/// Bounded MPMC pool of reusable batch buffers, owned by one emitter.
///
/// The receiving replicas push drained buffers back through a [`Recycler`]
/// handle; the emitter drains the pool before allocating fresh buffers. The
/// pool is torn down together with the emitter.
pub(crate) struct BatchPool<T> {
    slots: Receiver<Vec<Item<T>>>,
    handle: Sender<Vec<Item<T>>>,
}

impl<T> BatchPool<T> {
    pub fn new() -> Self {
        let (handle, slots) = channel::bounded(POOL_CAPACITY);
        BatchPool { slots, handle }
    }

    /// A buffer from the pool, or a fresh one when the pool is dry.
    pub fn acquire(&self, capacity: usize) -> Vec<Item<T>> {
        match self.slots.try_recv() {
            Ok(mut buf) => {
                buf.clear();
                buf
            }
            Err(_) => Vec::with_capacity(capacity.max(1)),
        }
    }

    pub fn recycler(&self) -> Recycler<T> {
        Recycler(self.handle.clone())
    }
}

/// Consumer-side handle returning drained buffers to an emitter's pool.
pub(crate) struct Recycler<T>(Sender<Vec<Item<T>>>);

impl<T> Recycler<T> {
    /// Hand a drained buffer back. Dropped silently when the pool is full
    /// or the emitter is already gone.
    pub fn give_back(&self, buf: Vec<Item<T>>) {
        if buf.capacity() > 0 {
            let _ = self.0.try_send(buf);
        }
    }
}

impl<T> Clone for Recycler<T> {
    fn clone(&self) -> Self {
        Recycler(self.0.clone())
    }
}
