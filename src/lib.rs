//! # Flowtap Data Plane
//!
//! Per-packet telemetry engine with two subsystems on a shared stream of
//! parsed packet metadata:
//!
//! - **Flow tracking (UDP)**: aggregates packets into flow records keyed by
//!   a 5-tuple up to direction reversal, in a sharded, bucket-locked table
//!   with per-flow timeouts.
//! - **Pcap capture**: per-shard workers append policy-matched packet bytes
//!   to capture files keyed by (tap, ACL group, MAC, IP), with bounded
//!   concurrent file count, size, and duration, and rename-on-close
//!   promotion from `.pcap.temp` to `.pcap`.
//!
//! Both consume the same sharded input queue, where a `None` element is a
//! maintenance tick. Packet parsing, policy evaluation, and stats export
//! are upstream/downstream collaborators.

pub mod capture;
pub mod config;
pub mod flow;
pub mod packet;
pub mod queue;

pub use capture::{WorkerCounter, WorkerManager};
pub use config::Config;
pub use flow::{FlowCounter, FlowGenerator, FlowWorker};
pub use packet::{MetaPacket, MetaPacketPool, TapType};
pub use queue::{multi_queue, MultiQueue, QueueReader};

/// Elements read from a queue shard per pass.
pub const QUEUE_BATCH_SIZE: usize = 1024;
