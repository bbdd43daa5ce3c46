//! # Input Queue
//!
//! The shared ingestion abstraction: a fixed set of bounded FIFO shards,
//! one consumer per shard. Elements are `Option<Box<MetaPacket>>`; `None`
//! is the reserved tick marker used to wake consumers for periodic
//! maintenance. Batch reads return at most the requested number of
//! elements and block only for the first one.

use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};

use crate::packet::MetaPacket;

/// One queue element; `None` is a tick.
pub type QueueItem = Option<Box<MetaPacket>>;

/// Producer half of the sharded queue. Cloneable; shared by upstream
/// dispatchers and the tick source.
#[derive(Clone)]
pub struct MultiQueue {
    senders: Vec<Sender<QueueItem>>,
}

/// Consumer half for one shard. Each worker owns exactly one.
pub struct QueueReader {
    receiver: Receiver<QueueItem>,
}

/// Creates a sharded queue with `queue_count` shards of `queue_size` slots.
pub fn multi_queue(queue_count: usize, queue_size: usize) -> (MultiQueue, Vec<QueueReader>) {
    let mut senders = Vec::with_capacity(queue_count);
    let mut readers = Vec::with_capacity(queue_count);
    for _ in 0..queue_count {
        let (tx, rx) = bounded(queue_size);
        senders.push(tx);
        readers.push(QueueReader { receiver: rx });
    }
    (MultiQueue { senders }, readers)
}

impl MultiQueue {
    pub fn queue_count(&self) -> usize {
        self.senders.len()
    }

    /// Enqueues a packet on the shard selected by `key`, blocking while the
    /// shard is full. Returns the packet if the shard's consumer is gone so
    /// the caller can release it.
    pub fn send(&self, key: usize, packet: Box<MetaPacket>) -> Result<(), Box<MetaPacket>> {
        let shard = key % self.senders.len();
        match self.senders[shard].send(Some(packet)) {
            Ok(()) => Ok(()),
            // Only packets are routed through send, so the rejected item is
            // always Some.
            Err(e) => match e.into_inner() {
                Some(packet) => Err(packet),
                None => Ok(()),
            },
        }
    }

    /// Delivers a tick to every shard. Best-effort: a full shard already has
    /// work to wake on, so its tick is dropped.
    pub fn tick_all(&self) {
        for shard in 0..self.senders.len() {
            self.tick(shard);
        }
    }

    /// Delivers a tick to one shard, best-effort.
    pub fn tick(&self, shard: usize) {
        match self.senders[shard % self.senders.len()].try_send(None) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

impl QueueReader {
    /// Reads up to `max` elements into `out`, blocking for the first.
    ///
    /// Returns the number read; 0 means every producer is gone, which
    /// consumers treat the same as an exit tick.
    pub fn gets(&self, out: &mut Vec<QueueItem>, max: usize) -> usize {
        out.clear();
        match self.receiver.recv() {
            Ok(item) => out.push(item),
            Err(_) => return 0,
        }
        while out.len() < max {
            match self.receiver.try_recv() {
                Ok(item) => out.push(item),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out.len()
    }
}
