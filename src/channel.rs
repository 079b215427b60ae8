//! Thin wrappers around the channel implementation used between replicas.
//!
//! Every edge of the dataflow graph is backed by a bounded channel: a full
//! queue blocks the producing replica and the backpressure cascades towards
//! the sources. The same primitive, used as an MPMC queue, backs the batch
//! recycling pools of the emitters.

use std::time::Duration;

use thiserror::Error;

/// Capacity, in messages, of the queue between two adjacent replicas.
pub(crate) const CHANNEL_CAPACITY: usize = 64;

pub(crate) struct Sender<T>(flume::Sender<T>);
pub(crate) struct Receiver<T>(flume::Receiver<T>);

pub(crate) fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = flume::bounded(capacity);
    (Sender(tx), Receiver(rx))
}

#[derive(Debug, Error)]
pub(crate) enum SendError {
    #[error("receiving replica disconnected")]
    Disconnected,
}

#[derive(Debug, Error)]
pub(crate) enum RecvError {
    #[error("all sending replicas disconnected")]
    Disconnected,
    #[error("no message within the timeout")]
    Timeout,
    #[error("channel empty")]
    Empty,
}

impl<T> Sender<T> {
    /// Blocking send, suspending the caller while the queue is full.
    pub fn send(&self, item: T) -> Result<(), SendError> {
        self.0.send(item).map_err(|_| SendError::Disconnected)
    }

    /// Non-blocking send, returning the item if the queue is full.
    pub fn try_send(&self, item: T) -> Result<(), T> {
        self.0.try_send(item).map_err(|e| match e {
            flume::TrySendError::Full(item) => item,
            flume::TrySendError::Disconnected(item) => item,
        })
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> Result<T, RecvError> {
        self.0.recv().map_err(|_| RecvError::Disconnected)
    }

    pub fn try_recv(&self) -> Result<T, RecvError> {
        self.0.try_recv().map_err(|e| match e {
            flume::TryRecvError::Empty => RecvError::Empty,
            flume::TryRecvError::Disconnected => RecvError::Disconnected,
        })
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.0.recv_timeout(timeout).map_err(|e| match e {
            flume::RecvTimeoutError::Timeout => RecvError::Timeout,
            flume::RecvTimeoutError::Disconnected => RecvError::Disconnected,
        })
    }
}
