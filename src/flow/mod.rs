//! # Flow Tracking (UDP path)
//!
//! Aggregates observed packets into flow records keyed by a 5-tuple,
//! matching either direction of a tuple to the same record. The table is a
//! fixed set of independently locked shards; per-shard workers drain the
//! input queue and service timeouts on maintenance ticks.

pub mod generator;
pub mod types;
pub mod worker;

pub use generator::{FlowCounter, FlowGenerator};
pub use types::{FlowExtra, FlowKey, FlowMetricsPeer, FlowState, TaggedFlow, TimeoutConfig};
pub use worker::FlowWorker;
