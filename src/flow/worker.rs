//! Per-shard flow ingest worker.
//!
//! Drains one queue shard in batches, feeding UDP packets into the shared
//! generator. A tick (`None` element) drives timeout reaping; closed flows
//! go to the output channel for the downstream exporter. `exiting` is
//! observed only at tick boundaries so the in-flight batch always
//! completes.

use crossbeam_channel::Sender;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use super::generator::FlowGenerator;
use super::types::TaggedFlow;
use crate::packet::{timestamp_now, MetaPacketPool, ETH_TYPE_IPV6, IPPROTO_UDP};
use crate::queue::{MultiQueue, QueueItem, QueueReader};
use crate::QUEUE_BATCH_SIZE;

/// A running flow worker. Dropping the handle does not stop the thread;
/// call [`FlowWorker::close`].
pub struct FlowWorker {
    index: usize,
    queue: MultiQueue,
    exiting: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl FlowWorker {
    /// Spawns the worker thread for one queue shard. The queue handle is
    /// kept so `close` can deliver the tick the worker exits on.
    pub fn spawn(
        index: usize,
        generator: Arc<FlowGenerator>,
        queue: MultiQueue,
        reader: QueueReader,
        pool: Arc<MetaPacketPool>,
        output: Sender<TaggedFlow>,
    ) -> Result<FlowWorker, String> {
        let exiting = Arc::new(AtomicBool::new(false));
        let exiting_flag = Arc::clone(&exiting);
        let handle = std::thread::Builder::new()
            .name(format!("flow-worker-{}", index))
            .spawn(move || {
                run(index, generator, reader, pool, output, exiting_flag);
            })
            .map_err(|e| format!("Failed to spawn flow worker {}: {}", index, e))?;
        Ok(FlowWorker {
            index,
            queue,
            exiting,
            handle: Some(handle),
        })
    }

    /// Requests exit at the next tick and waits for the thread to finish.
    pub fn close(mut self) {
        self.exiting.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            // Ticks sent before the flag was set may be consumed without
            // observing it; keep nudging until the thread is done.
            while !handle.is_finished() {
                self.queue.tick(self.index);
                std::thread::sleep(Duration::from_millis(1));
            }
            let _ = handle.join();
        }
        info!("Stopped flow worker ({})", self.index);
    }
}

fn run(
    index: usize,
    generator: Arc<FlowGenerator>,
    reader: QueueReader,
    pool: Arc<MetaPacketPool>,
    output: Sender<TaggedFlow>,
    exiting: Arc<AtomicBool>,
) {
    let mut batch: Vec<QueueItem> = Vec::with_capacity(QUEUE_BATCH_SIZE);

    'working: loop {
        let n = reader.gets(&mut batch, QUEUE_BATCH_SIZE);
        if n == 0 {
            // Producers are gone; treat as an exit tick.
            break;
        }
        for item in batch.drain(..) {
            let Some(packet) = item else {
                if exiting.load(Ordering::Relaxed) {
                    break 'working;
                }
                let reaped = generator.reap_expired(timestamp_now());
                if !reaped.is_empty() {
                    debug!("flow worker {} reaped {} flows", index, reaped.len());
                }
                for flow in reaped {
                    if output.send(flow).is_err() {
                        debug!("flow worker {}: exporter is gone", index);
                        break;
                    }
                }
                continue;
            };

            if packet.proto == IPPROTO_UDP && packet.eth_type != ETH_TYPE_IPV6 {
                generator.process_udp_packet(&packet);
            }
            pool.release(packet);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::types::TimeoutConfig;
    use crate::packet::MetaPacket;
    use crate::queue::multi_queue;
    use crossbeam_channel::unbounded;
    use std::time::Duration;

    fn udp_packet(pool: &MetaPacketPool, ip_src: u32, ts: Duration) -> Box<MetaPacket> {
        let mut packet = pool.acquire();
        packet.proto = IPPROTO_UDP;
        packet.ip_src = ip_src;
        packet.ip_dst = ip_src + 1;
        packet.port_src = 1000;
        packet.port_dst = 53;
        packet.packet_len = 64;
        packet.timestamp = ts;
        packet
    }

    #[test]
    fn test_worker_tracks_and_releases() {
        let (queue, mut readers) = multi_queue(1, 64);
        let pool = Arc::new(MetaPacketPool::new());
        let generator =
            Arc::new(FlowGenerator::new(16, 100, TimeoutConfig::default()).unwrap());
        let (tx, _rx) = unbounded();

        let worker = FlowWorker::spawn(
            0,
            Arc::clone(&generator),
            queue.clone(),
            readers.remove(0),
            Arc::clone(&pool),
            tx,
        )
        .unwrap();

        let now = timestamp_now();
        queue.send(0, udp_packet(&pool, 1, now)).unwrap();
        queue.send(0, udp_packet(&pool, 2, now)).unwrap();
        queue.tick_all();
        worker.close();

        assert_eq!(generator.counter().curr_num_flows, 2);
        assert_eq!(pool.len(), 2, "both packets must be released");
    }

    #[test]
    fn test_tick_reaps_to_output() {
        let (queue, mut readers) = multi_queue(1, 64);
        let pool = Arc::new(MetaPacketPool::new());
        let generator =
            Arc::new(FlowGenerator::new(16, 100, TimeoutConfig::default()).unwrap());
        let (tx, rx) = unbounded();

        let worker = FlowWorker::spawn(
            0,
            Arc::clone(&generator),
            queue.clone(),
            readers.remove(0),
            Arc::clone(&pool),
            tx,
        )
        .unwrap();

        // Old enough that the opening timeout has long passed.
        let stale = timestamp_now() - Duration::from_secs(3600);
        queue.send(0, udp_packet(&pool, 9, stale)).unwrap();

        // Tick until the worker has reaped; a tick delivered after close
        // would be consumed as the exit signal instead.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while generator.counter().curr_num_flows != 0
            || generator.counter().total_num_flows == 0
        {
            assert!(std::time::Instant::now() < deadline, "reap timed out");
            queue.tick_all();
            std::thread::sleep(Duration::from_millis(5));
        }
        worker.close();

        let flow = rx.try_recv().expect("reaped flow on output");
        assert_eq!(flow.flow_key.ip_src, 9);
        assert_eq!(generator.counter().curr_num_flows, 0);
    }
}
