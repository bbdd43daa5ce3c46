//! # Policy-Driven Pcap Capture
//!
//! A pool of per-shard workers that append policy-matched packet bytes to
//! capture files keyed by derived endpoint identity. Every worker owns its
//! writer registry and counters; the manager owns the worker threads and
//! the tick source that drives age-based rotation.

pub mod registry;
pub mod worker;
pub mod writer;

pub use registry::{WorkerCounter, WriterRegistry};
pub use worker::Worker;
pub use writer::{PcapFileWriter, WriterStats};

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::{CaptureConfig, QueueConfig};
use crate::packet::MetaPacketPool;
use crate::queue::{MultiQueue, QueueReader};

/// Owns the pcap workers of one capture plane: one worker per queue shard,
/// plus the tick thread that wakes them for rotation.
pub struct WorkerManager {
    queue: MultiQueue,
    tick_interval: Duration,
    exiting: Arc<AtomicBool>,

    pending: Vec<Worker>,
    handles: Vec<JoinHandle<()>>,
    counters: Vec<Arc<Mutex<WorkerCounter>>>,

    ticker: Option<JoinHandle<()>>,
    ticker_stop: Option<Sender<()>>,
}

impl WorkerManager {
    /// Builds one worker per reader. The configured file budget is divided
    /// evenly between workers.
    pub fn new(
        capture_config: &CaptureConfig,
        queue_config: &QueueConfig,
        queue: MultiQueue,
        readers: Vec<QueueReader>,
        pool: Arc<MetaPacketPool>,
    ) -> Self {
        let worker_count = readers.len().max(1);
        let files_per_worker = capture_config.max_concurrent_files / worker_count;
        let exiting = Arc::new(AtomicBool::new(false));

        let mut pending = Vec::with_capacity(readers.len());
        let mut counters = Vec::with_capacity(readers.len());
        for (index, reader) in readers.into_iter().enumerate() {
            let counter = Arc::new(Mutex::new(WorkerCounter::default()));
            let registry = WriterRegistry::new(
                capture_config,
                files_per_worker,
                index,
                Arc::clone(&counter),
            );
            counters.push(counter);
            pending.push(Worker::new(
                index,
                reader,
                registry,
                Arc::clone(&pool),
                Arc::clone(&exiting),
            ));
        }

        WorkerManager {
            queue,
            tick_interval: queue_config.tick_interval(),
            exiting,
            pending,
            handles: Vec::new(),
            counters,
            ticker: None,
            ticker_stop: None,
        }
    }

    /// Spawns the worker threads and the tick source.
    pub fn start(&mut self) -> Result<(), String> {
        for worker in self.pending.drain(..) {
            let index = self.handles.len();
            let handle = std::thread::Builder::new()
                .name(format!("pcap-worker-{}", index))
                .spawn(move || worker.process())
                .map_err(|e| format!("Failed to spawn pcap worker {}: {}", index, e))?;
            self.handles.push(handle);
        }

        let (stop_tx, stop_rx) = bounded::<()>(0);
        let queue = self.queue.clone();
        let interval = self.tick_interval;
        let ticker = std::thread::Builder::new()
            .name("pcap-ticker".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => queue.tick_all(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })
            .map_err(|e| format!("Failed to spawn pcap ticker: {}", e))?;
        self.ticker = Some(ticker);
        self.ticker_stop = Some(stop_tx);

        info!("Started {} pcap workers", self.handles.len());
        Ok(())
    }

    /// Swaps out every worker's counter block.
    pub fn counters(&self) -> Vec<WorkerCounter> {
        self.counters
            .iter()
            .map(|counter| std::mem::take(&mut *counter.lock()))
            .collect()
    }

    /// Requests exit and returns once every worker has finalized its open
    /// writers.
    pub fn close(&mut self) {
        self.exiting.store(true, Ordering::Relaxed);
        for handle in self.handles.drain(..) {
            // Ticks consumed before the flag was visible don't stop the
            // worker; keep nudging until it is done.
            while !handle.is_finished() {
                self.queue.tick_all();
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        self.ticker_stop.take();
        if let Some(ticker) = self.ticker.take() {
            let _ = ticker.join();
        }
        info!("Stopped pcap worker pool");
    }
}

impl WorkerCounter {
    /// Accumulates another counter block into this one.
    pub fn merge(&mut self, other: &WorkerCounter) {
        self.file_creations += other.file_creations;
        self.file_closes += other.file_closes;
        self.file_rejections += other.file_rejections;
        self.file_creation_failures += other.file_creation_failures;
        self.file_writing_failures += other.file_writing_failures;
        self.buffered_count += other.buffered_count;
        self.written_count += other.written_count;
        self.buffered_bytes += other.buffered_bytes;
        self.written_bytes += other.written_bytes;
    }
}
