//! Sharded flow table and the per-packet UDP ingestion path.
//!
//! The table is a fixed number of independently locked buckets, sized once
//! at construction and never resized. A packet locks exactly one bucket for
//! the whole lookup-or-create operation; the global flow count is the only
//! cross-bucket state and is kept in an atomic so stats exporters can read
//! it without touching the buckets.

use log::info;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use super::types::{FlowExtra, FlowKey, FlowState, TaggedFlow, TimeoutConfig};
use crate::packet::MetaPacket;

/// One bucket of the flow table: insertion-ordered live flows.
#[derive(Default)]
struct FlowCache {
    flows: Vec<FlowExtra>,
}

impl FlowCache {
    /// First insertion-order flow matching the packet in either direction.
    fn key_match(&mut self, meta: &MetaPacket) -> Option<(&mut FlowExtra, bool)> {
        for flow in self.flows.iter_mut() {
            if let Some(reply) = flow.tagged_flow.flow_key.match_packet(meta) {
                return Some((flow, reply));
            }
        }
        None
    }
}

/// Snapshot of the generator's global counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowCounter {
    /// Live flows across all shards.
    pub curr_num_flows: u64,
    /// Flows ever created.
    pub total_num_flows: u64,
    /// Packets dropped from flow tracking because the limit was reached.
    pub flood_drop_packets: u64,
}

#[derive(Default)]
struct FlowStats {
    curr_num_flows: AtomicU64,
    total_num_flows: AtomicU64,
    flood_drop_packets: AtomicU64,
}

/// The UDP flow generator.
pub struct FlowGenerator {
    caches: Vec<Mutex<FlowCache>>,
    shard_mask: u64,
    flow_limit_num: u64,
    timeout_config: TimeoutConfig,
    stats: FlowStats,
}

impl FlowGenerator {
    /// Creates a generator with `hash_map_size` shards (a power of two) and
    /// a global cap of `flow_limit_num` live flows.
    pub fn new(
        hash_map_size: usize,
        flow_limit_num: u64,
        timeout_config: TimeoutConfig,
    ) -> Result<Self, String> {
        if hash_map_size == 0 || !hash_map_size.is_power_of_two() {
            return Err(format!(
                "hash_map_size must be a power of two, got {}",
                hash_map_size
            ));
        }
        let mut caches = Vec::with_capacity(hash_map_size);
        for _ in 0..hash_map_size {
            caches.push(Mutex::new(FlowCache::default()));
        }
        info!(
            "Flow generator ready: {} shards, limit {} flows",
            hash_map_size, flow_limit_num
        );
        Ok(FlowGenerator {
            caches,
            shard_mask: (hash_map_size - 1) as u64,
            flow_limit_num,
            timeout_config,
            stats: FlowStats::default(),
        })
    }

    /// Ingests one UDP packet: merges it into its flow, or creates the flow.
    ///
    /// The only soft failure is the global flow limit; the packet is then
    /// counted in `flood_drop_packets` and dropped from tracking.
    pub fn process_udp_packet(&self, meta: &MetaPacket) {
        let hash = quintuple_hash(meta);
        let mut cache = self.caches[(hash & self.shard_mask) as usize].lock();

        if let Some((flow, reply)) = cache.key_match(meta) {
            flow.merge_packet(meta, reply);
            if reply {
                flow.set_timeout(self.timeout_config.established_rst);
            }
            return;
        }

        if self.stats.curr_num_flows.load(Ordering::Relaxed) >= self.flow_limit_num {
            self.stats.flood_drop_packets.fetch_add(1, Ordering::Relaxed);
            return;
        }
        cache
            .flows
            .push(FlowExtra::from_first_packet(meta, self.timeout_config.opening));
        self.stats.total_num_flows.fetch_add(1, Ordering::Relaxed);
        self.stats.curr_num_flows.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes every flow whose reap deadline has passed and returns the
    /// closed records, oldest-insertion first within each shard.
    pub fn reap_expired(&self, now: Duration) -> Vec<TaggedFlow> {
        let mut reaped = Vec::new();
        for cache in &self.caches {
            let mut cache = cache.lock();
            let mut i = 0;
            while i < cache.flows.len() {
                if cache.flows[i].reap_time <= now {
                    let mut flow = cache.flows.remove(i);
                    flow.flow_state = FlowState::Closed;
                    self.stats.curr_num_flows.fetch_sub(1, Ordering::Relaxed);
                    reaped.push(flow.tagged_flow);
                } else {
                    i += 1;
                }
            }
        }
        reaped
    }

    /// Current counter values.
    pub fn counter(&self) -> FlowCounter {
        FlowCounter {
            curr_num_flows: self.stats.curr_num_flows.load(Ordering::Relaxed),
            total_num_flows: self.stats.total_num_flows.load(Ordering::Relaxed),
            flood_drop_packets: self.stats.flood_drop_packets.load(Ordering::Relaxed),
        }
    }

    /// Sum of live flows over all shards. O(shards); test and debug aid.
    pub fn live_flow_count(&self) -> usize {
        self.caches.iter().map(|c| c.lock().flows.len()).sum()
    }

    /// Looks up a flow by example packet and returns a copy of its record.
    pub fn peek_flow(&self, meta: &MetaPacket) -> Option<(TaggedFlow, Duration)> {
        let hash = quintuple_hash(meta);
        let mut cache = self.caches[(hash & self.shard_mask) as usize].lock();
        cache
            .key_match(meta)
            .map(|(flow, _)| (flow.tagged_flow.clone(), flow.timeout))
    }
}

/// Direction-invariant hash over (proto, ip_src, ip_dst, port_src,
/// port_dst): the endpoints are ordered before mixing so a reversed packet
/// lands in the same shard.
pub fn quintuple_hash(meta: &MetaPacket) -> u64 {
    let src = ((meta.ip_src as u64) << 16) | meta.port_src as u64;
    let dst = ((meta.ip_dst as u64) << 16) | meta.port_dst as u64;
    let (lo, hi) = if src <= dst { (src, dst) } else { (dst, src) };
    mix64(lo ^ mix64(hi ^ ((meta.proto as u64) << 48)))
}

fn mix64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51_afd7_ed55_8ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ce_b9fe_1a85_ec53);
    x ^ (x >> 33)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::IPPROTO_UDP;

    fn udp_packet(
        ip_src: u32,
        ip_dst: u32,
        port_src: u16,
        port_dst: u16,
        ts: u64,
        len: u32,
    ) -> MetaPacket {
        MetaPacket {
            proto: IPPROTO_UDP,
            ip_src,
            ip_dst,
            port_src,
            port_dst,
            packet_len: len,
            timestamp: Duration::from_secs(ts),
            ..Default::default()
        }
    }

    fn generator(limit: u64) -> FlowGenerator {
        FlowGenerator::new(16, limit, TimeoutConfig::default()).unwrap()
    }

    #[test]
    fn test_hash_is_direction_invariant() {
        let forward = udp_packet(1, 2, 1000, 53, 0, 0);
        let reversed = udp_packet(2, 1, 53, 1000, 0, 0);
        assert_eq!(quintuple_hash(&forward), quintuple_hash(&reversed));

        let other = udp_packet(1, 2, 1001, 53, 0, 0);
        assert_ne!(quintuple_hash(&forward), quintuple_hash(&other));
    }

    #[test]
    fn test_new_flow_fields() {
        let gen = generator(100);
        let packet = udp_packet(10, 20, 1000, 53, 7, 100);
        gen.process_udp_packet(&packet);

        let counter = gen.counter();
        assert_eq!(counter.curr_num_flows, 1);
        assert_eq!(counter.total_num_flows, 1);

        let (flow, timeout) = gen.peek_flow(&packet).unwrap();
        assert_eq!(flow.peer_src.arr_time_0, Duration::from_secs(7));
        assert_eq!(flow.peer_src.packet_count, 1);
        assert_eq!(flow.peer_src.byte_count, 100);
        assert_eq!(flow.peer_dst.packet_count, 0);
        assert_eq!(timeout, TimeoutConfig::default().opening);
    }

    #[test]
    fn test_reply_updates_dst_peer_and_timeout() {
        let gen = generator(100);
        gen.process_udp_packet(&udp_packet(10, 20, 1000, 53, 7, 100));
        gen.process_udp_packet(&udp_packet(20, 10, 53, 1000, 8, 200));

        let counter = gen.counter();
        assert_eq!(counter.curr_num_flows, 1, "reply must not create a flow");

        let probe = udp_packet(10, 20, 1000, 53, 0, 0);
        let (flow, timeout) = gen.peek_flow(&probe).unwrap();
        assert_eq!(flow.peer_dst.packet_count, 1);
        assert_eq!(flow.peer_dst.byte_count, 200);
        assert_eq!(flow.peer_src.packet_count, 1);
        assert_eq!(timeout, TimeoutConfig::default().established_rst);
    }

    #[test]
    fn test_same_direction_packets_merge() {
        let gen = generator(100);
        gen.process_udp_packet(&udp_packet(10, 20, 1000, 53, 7, 100));
        gen.process_udp_packet(&udp_packet(10, 20, 1000, 53, 8, 50));

        let probe = udp_packet(10, 20, 1000, 53, 0, 0);
        let (flow, _) = gen.peek_flow(&probe).unwrap();
        assert_eq!(flow.peer_src.packet_count, 2);
        assert_eq!(flow.peer_src.total_byte_count, 150);
        assert_eq!(gen.counter().curr_num_flows, 1);
    }

    #[test]
    fn test_flood_drop_at_limit() {
        let gen = generator(2);
        gen.process_udp_packet(&udp_packet(1, 2, 10, 20, 0, 1));
        gen.process_udp_packet(&udp_packet(3, 4, 10, 20, 0, 1));
        gen.process_udp_packet(&udp_packet(5, 6, 10, 20, 0, 1));

        let counter = gen.counter();
        assert_eq!(counter.curr_num_flows, 2);
        assert_eq!(counter.total_num_flows, 2);
        assert_eq!(counter.flood_drop_packets, 1);
    }

    #[test]
    fn test_limit_drop_keeps_existing_flows_updatable() {
        let gen = generator(1);
        gen.process_udp_packet(&udp_packet(1, 2, 10, 20, 0, 1));
        gen.process_udp_packet(&udp_packet(3, 4, 10, 20, 0, 1)); // dropped
        gen.process_udp_packet(&udp_packet(1, 2, 10, 20, 1, 1)); // merges

        let probe = udp_packet(1, 2, 10, 20, 0, 0);
        let (flow, _) = gen.peek_flow(&probe).unwrap();
        assert_eq!(flow.peer_src.packet_count, 2);
        assert_eq!(gen.counter().flood_drop_packets, 1);
    }

    #[test]
    fn test_reap_expired_decrements_live_count() {
        let gen = generator(100);
        gen.process_udp_packet(&udp_packet(1, 2, 10, 20, 100, 1));
        gen.process_udp_packet(&udp_packet(3, 4, 10, 20, 200, 1));

        // Only the first flow is past its deadline at t=150.
        let reaped = gen.reap_expired(Duration::from_secs(150));
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].flow_key.ip_src, 1);

        let counter = gen.counter();
        assert_eq!(counter.curr_num_flows, 1);
        assert_eq!(counter.curr_num_flows as usize, gen.live_flow_count());
        assert_eq!(counter.total_num_flows, 2);
    }

    #[test]
    fn test_live_count_matches_counter_across_shards() {
        let gen = generator(1000);
        for i in 0..100u32 {
            gen.process_udp_packet(&udp_packet(i, i + 1, 10, 20, 0, 1));
        }
        assert_eq!(gen.counter().curr_num_flows as usize, gen.live_flow_count());
    }
}
