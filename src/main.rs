//! # Flowtap Entry Point
//!
//! Builds the input queues and both subsystems, then runs until interrupted.
//! Packet decoding and policy evaluation live upstream: producers feed the
//! returned queues in-process; this binary owns the worker lifecycles and
//! final counter reporting.

use clap::Parser;
use log::{error, info};
use std::sync::Arc;

use flowtap::capture::WorkerManager;
use flowtap::config::Config;
use flowtap::flow::{FlowGenerator, FlowWorker};
use flowtap::packet::MetaPacketPool;
use flowtap::queue::multi_queue;
use flowtap::WorkerCounter;

#[derive(Debug, Parser)]
#[command(name = "flowtap", about = "UDP flow tracking and policy-driven pcap capture")]
struct Args {
    /// Path to the JSON configuration file.
    #[arg(short, long, default_value = "flowtap.json")]
    config: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        info!("Config {} not found, using defaults", args.config.display());
        Config::default()
    };

    let pool = Arc::new(MetaPacketPool::new());

    // Flow side: one queue + worker set, reaped flows to the exporter seam.
    let (flow_queue, flow_readers) = multi_queue(config.queue.queue_count, config.queue.queue_size);
    let generator = Arc::new(FlowGenerator::new(
        config.flow.hash_map_size,
        config.flow.flow_limit_num,
        config.flow.timeout_config(),
    )?);
    let (flow_out_tx, flow_out_rx) = crossbeam_channel::unbounded();
    let mut flow_workers = Vec::new();
    for (index, reader) in flow_readers.into_iter().enumerate() {
        flow_workers.push(FlowWorker::spawn(
            index,
            Arc::clone(&generator),
            flow_queue.clone(),
            reader,
            Arc::clone(&pool),
            flow_out_tx.clone(),
        )?);
    }
    // Placeholder exporter: drain and count until a real consumer attaches.
    let exporter = std::thread::spawn(move || {
        let mut exported = 0u64;
        while flow_out_rx.recv().is_ok() {
            exported += 1;
        }
        info!("Flow exporter drained {} closed flows", exported);
    });

    // Capture side: its own queue and worker pool.
    let (capture_queue, capture_readers) =
        multi_queue(config.queue.queue_count, config.queue.queue_size);
    let mut manager = WorkerManager::new(
        &config.capture,
        &config.queue,
        capture_queue.clone(),
        capture_readers,
        Arc::clone(&pool),
    );
    manager.start()?;

    // Flow-side ticks share the capture tick cadence.
    let flow_ticker = {
        let queue = flow_queue.clone();
        let interval = config.queue.tick_interval();
        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let handle = std::thread::spawn(move || loop {
            match stop_rx.recv_timeout(interval) {
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => queue.tick_all(),
                _ => break,
            }
        });
        (stop_tx, handle)
    };

    info!(
        "Flowtap running: {} queue shards, capture root {}",
        config.queue.queue_count, config.capture.base_directory
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for interrupt: {}", e);
    }
    info!("Interrupt received, shutting down");

    manager.close();
    for worker in flow_workers {
        worker.close();
    }
    drop(flow_ticker.0);
    let _ = flow_ticker.1.join();
    drop(flow_out_tx);
    let _ = exporter.join();

    let mut total = WorkerCounter::default();
    for counter in manager.counters() {
        total.merge(&counter);
    }
    let flows = generator.counter();
    info!(
        "Final counters: {} files created, {} closed, {} rejected; {} flows tracked, {} live, {} flood-dropped",
        total.file_creations,
        total.file_closes,
        total.file_rejections,
        flows.total_num_flows,
        flows.curr_num_flows,
        flows.flood_drop_packets
    );
    Ok(())
}
