//! Bounded stage queues.
//!
//! Pipeline stages communicate exclusively through these: bounded MPMC
//! channels with deadline-aware operations and a cancel signal that wakes
//! every waiter. Cancelled queues hand out nothing, but a finalizing
//! consumer may still drain residual items explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::buffer::Buffer;

/// Depth of the block queue between readers/receivers and senders/writer.
pub const BLOCK_QUEUE_DEPTH: usize = 100;

/// Depth of the side queue feeding the hashers.
pub const HASH_QUEUE_DEPTH: usize = 100;

/// One block moving through the pipeline: an owned payload buffer plus its
/// destination coordinates. The buffer is shared so a block can fan out to
/// both the writer and a hasher; the slab slot frees when the last holder
/// drops.
#[derive(Debug, Clone)]
pub struct BlockDescriptor {
    pub buf: Arc<Buffer>,
    pub file_id: u16,
    pub offset: u64,
    pub len: u64,
}

pub type BlockQueue = BoundedQueue<BlockDescriptor>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Ok,
    /// The queue stayed full past the deadline.
    TimedOut,
    /// No capacity right now (non-blocking put only).
    Full,
    /// The queue was closed or cancelled.
    Closed,
}

pub struct BoundedQueue<T> {
    tx: async_channel::Sender<T>,
    rx: async_channel::Receiver<T>,
    done: Arc<AtomicBool>,
}

impl<T> Clone for BoundedQueue<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            done: Arc::clone(&self.done),
        }
    }
}

impl<T> BoundedQueue<T> {
    pub fn bounded(limit: usize) -> Self {
        let (tx, rx) = async_channel::bounded(limit);
        Self {
            tx,
            rx,
            done: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Wait for capacity and enqueue.
    pub async fn put(&self, value: T) -> PutStatus {
        match self.tx.send(value).await {
            Ok(()) => PutStatus::Ok,
            Err(_) => PutStatus::Closed,
        }
    }

    /// Enqueue, giving up after `timeout` if the queue stays full.
    pub async fn put_deadline(&self, value: T, timeout: Duration) -> PutStatus {
        match tokio::time::timeout(timeout, self.tx.send(value)).await {
            Ok(Ok(())) => PutStatus::Ok,
            Ok(Err(_)) => PutStatus::Closed,
            Err(_) => PutStatus::TimedOut,
        }
    }

    pub fn try_put(&self, value: T) -> PutStatus {
        match self.tx.try_send(value) {
            Ok(()) => PutStatus::Ok,
            Err(async_channel::TrySendError::Full(_)) => PutStatus::Full,
            Err(async_channel::TrySendError::Closed(_)) => PutStatus::Closed,
        }
    }

    /// Wait for an element. `None` means the queue was cancelled, or closed
    /// and fully drained.
    pub async fn get(&self) -> Option<T> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }

        let value = self.rx.recv().await.ok()?;

        // cancelled while waiting: stay empty, drop the element
        if self.done.load(Ordering::Acquire) {
            return None;
        }

        Some(value)
    }

    /// Like [`get`](Self::get) with a timeout; `None` on timeout too.
    pub async fn get_deadline(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.get()).await.ok().flatten()
    }

    pub fn try_get(&self) -> Option<T> {
        if self.done.load(Ordering::Acquire) {
            return None;
        }

        let value = self.rx.try_recv().ok()?;

        if self.done.load(Ordering::Acquire) {
            return None;
        }

        Some(value)
    }

    /// Drain one residual item after cancellation. Only finalizing consumers
    /// use this; ordinary `get`s stay empty once cancelled.
    pub fn try_get_final(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Signal end-of-stream: producers stop, consumers drain what remains
    /// and then see `None`.
    pub fn close(&self) {
        self.tx.close();
    }

    /// Wake all waiters and make every future `get` return `None`.
    pub fn cancel(&self) {
        self.done.store(true, Ordering::Release);
        self.tx.close();
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}
