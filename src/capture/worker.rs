//! Per-shard pcap worker.
//!
//! Consumes packets in batches from its queue shard, derives the tap type
//! and emit set from each packet's ingress port and endpoint annotations,
//! and routes the packet to one capture file per matching policy action and
//! emit-set member. Ticks drive age-based rotation and are the only place
//! the exit flag is observed.

use log::{info, warn};
use std::net::Ipv6Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::registry::WriterRegistry;
use crate::packet::{
    timestamp_now, MetaPacket, MetaPacketPool, TapType, ACTION_PACKET_CAPTURING, BROADCAST_IP,
    BROADCAST_MAC, ETH_TYPE_IPV6,
};
use crate::queue::{QueueItem, QueueReader};
use crate::QUEUE_BATCH_SIZE;

fn is_isp(in_port: u32) -> bool {
    (0x10000..0x20000).contains(&in_port)
}

fn is_tor(in_port: u32) -> bool {
    (0x30000..0x40000).contains(&in_port)
}

/// The (ip, mac) pairs of one packet that capture rules apply to.
#[derive(Debug, Default)]
pub(crate) struct EmitSet {
    pub v4: Vec<(u32, u64)>,
    pub v6: Vec<(Ipv6Addr, u64)>,
}

impl EmitSet {
    fn clear(&mut self) {
        self.v4.clear();
        self.v6.clear();
    }
}

/// Derives the tap type and fills the emit set for one packet.
///
/// Returns None for ingress ports outside the ISP and ToR ranges; such
/// packets are not captured. ISP IPv6 keeps only multicast addresses while
/// ToR IPv6 excludes them.
pub(crate) fn derive_emit_set(packet: &MetaPacket, emit: &mut EmitSet) -> Option<TapType> {
    emit.clear();
    let endpoints = packet.endpoint_data.as_ref()?;

    if is_isp(packet.in_port) {
        let tap_type = TapType((packet.in_port - 0x10000) as u16);
        if packet.eth_type != ETH_TYPE_IPV6 {
            if endpoints.src_info.l3_epc_id != 0
                && packet.ip_src != BROADCAST_IP
                && packet.mac_src != BROADCAST_MAC
            {
                emit.v4.push((packet.ip_src, packet.mac_src));
            }
            if endpoints.dst_info.l3_epc_id != 0
                && packet.ip_dst != BROADCAST_IP
                && packet.mac_dst != BROADCAST_MAC
            {
                emit.v4.push((packet.ip_dst, packet.mac_dst));
            }
        } else {
            if endpoints.src_info.l3_epc_id != 0
                && packet.ip6_src.is_multicast()
                && packet.mac_src != BROADCAST_MAC
            {
                emit.v6.push((packet.ip6_src, packet.mac_src));
            }
            if endpoints.dst_info.l3_epc_id != 0
                && packet.ip6_dst.is_multicast()
                && packet.mac_dst != BROADCAST_MAC
            {
                emit.v6.push((packet.ip6_dst, packet.mac_dst));
            }
        }
        Some(tap_type)
    } else if is_tor(packet.in_port) {
        if packet.eth_type != ETH_TYPE_IPV6 {
            if (packet.l2_end_0 || endpoints.src_info.l2_end)
                && packet.ip_src != BROADCAST_IP
                && packet.mac_src != BROADCAST_MAC
            {
                emit.v4.push((packet.ip_src, packet.mac_src));
            }
            if (packet.l2_end_1 || endpoints.dst_info.l2_end)
                && packet.ip_dst != BROADCAST_IP
                && packet.mac_dst != BROADCAST_MAC
            {
                emit.v4.push((packet.ip_dst, packet.mac_dst));
            }
        } else {
            if (packet.l2_end_0 || endpoints.src_info.l2_end)
                && !packet.ip6_src.is_multicast()
                && packet.mac_src != BROADCAST_MAC
            {
                emit.v6.push((packet.ip6_src, packet.mac_src));
            }
            if (packet.l2_end_1 || endpoints.dst_info.l2_end)
                && !packet.ip6_dst.is_multicast()
                && packet.mac_dst != BROADCAST_MAC
            {
                emit.v6.push((packet.ip6_dst, packet.mac_dst));
            }
        }
        Some(TapType::TOR)
    } else {
        None
    }
}

/// One pcap worker, pinned to a queue shard.
pub struct Worker {
    index: usize,
    reader: QueueReader,
    registry: WriterRegistry,
    pool: Arc<MetaPacketPool>,
    exiting: Arc<AtomicBool>,
}

impl Worker {
    pub fn new(
        index: usize,
        reader: QueueReader,
        registry: WriterRegistry,
        pool: Arc<MetaPacketPool>,
        exiting: Arc<AtomicBool>,
    ) -> Self {
        Worker {
            index,
            reader,
            registry,
            pool,
            exiting,
        }
    }

    /// The worker main loop. Runs until an exit tick (or a disconnected
    /// queue), then finalizes every open writer.
    pub fn process(mut self) {
        let mut batch: Vec<QueueItem> = Vec::with_capacity(QUEUE_BATCH_SIZE);
        let mut emit = EmitSet::default();

        'working: loop {
            let n = self.reader.gets(&mut batch, QUEUE_BATCH_SIZE);
            if n == 0 {
                break;
            }
            for item in batch.drain(..) {
                let Some(packet) = item else {
                    if self.exiting.load(Ordering::Relaxed) {
                        break 'working;
                    }
                    self.registry.rotate_aged(timestamp_now());
                    continue;
                };
                self.handle_packet(packet, &mut emit);
            }
        }

        self.registry.close_all();
        info!("Stopped pcap worker ({})", self.index);
    }

    fn handle_packet(&mut self, packet: Box<MetaPacket>, emit: &mut EmitSet) {
        if packet.policy_data.is_none() || packet.endpoint_data.is_none() {
            // Upstream always annotates before enqueueing.
            warn!(
                "drop invalid packet with nil PolicyData or EndpointData {:?}",
                packet
            );
            self.pool.release(packet);
            return;
        }

        let Some(tap_type) = derive_emit_set(&packet, emit) else {
            self.pool.release(packet);
            return;
        };

        if let Some(policy) = packet.policy_data.as_ref() {
            for action in &policy.acl_actions {
                if action.acl_gid == 0 {
                    continue;
                }
                if action.action_flags & ACTION_PACKET_CAPTURING == 0 {
                    continue;
                }
                if packet.eth_type != ETH_TYPE_IPV6 {
                    for &(ip, mac) in &emit.v4 {
                        self.registry
                            .write_packet(&packet, tap_type, ip, mac, action.acl_gid);
                    }
                } else {
                    for &(ip, mac) in &emit.v6 {
                        self.registry
                            .write_packet_ipv6(&packet, tap_type, ip, mac, action.acl_gid);
                    }
                }
            }
        }

        self.pool.release(packet);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::EndpointData;
    use std::time::Duration;

    fn annotated_packet(in_port: u32) -> MetaPacket {
        let mut endpoints = EndpointData::default();
        endpoints.src_info.l3_epc_id = 10;
        endpoints.dst_info.l3_epc_id = 20;
        MetaPacket {
            in_port,
            timestamp: Duration::from_secs(1),
            ip_src: 0x0a000001,
            ip_dst: 0x0a000002,
            mac_src: 0x000000000001,
            mac_dst: 0x000000000002,
            endpoint_data: Some(endpoints),
            ..Default::default()
        }
    }

    #[test]
    fn test_isp_emits_annotated_peers() {
        let packet = annotated_packet(0x10005);
        let mut emit = EmitSet::default();
        let tap = derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(tap, TapType(5));
        assert_eq!(emit.v4.len(), 2);
        assert_eq!(emit.v4[0], (0x0a000001, 0x000000000001));
        assert_eq!(emit.v4[1], (0x0a000002, 0x000000000002));
    }

    #[test]
    fn test_isp_skips_unknown_epc_and_broadcast() {
        let mut packet = annotated_packet(0x10000);
        if let Some(ep) = packet.endpoint_data.as_mut() {
            ep.src_info.l3_epc_id = 0;
        }
        packet.ip_dst = BROADCAST_IP;

        let mut emit = EmitSet::default();
        let tap = derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(tap, TapType(0));
        assert!(emit.v4.is_empty());
    }

    #[test]
    fn test_tor_requires_l2_end() {
        let mut packet = annotated_packet(0x30001);
        let mut emit = EmitSet::default();

        // No L2 terminus anywhere: nothing emitted.
        let tap = derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(tap, TapType::TOR);
        assert!(emit.v4.is_empty());

        // Packet-level flag on the source side is enough.
        packet.l2_end_0 = true;
        derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(emit.v4.len(), 1);
        assert_eq!(emit.v4[0].0, 0x0a000001);

        // Endpoint-level flag on the destination side also counts.
        if let Some(ep) = packet.endpoint_data.as_mut() {
            ep.dst_info.l2_end = true;
        }
        derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(emit.v4.len(), 2);
    }

    #[test]
    fn test_ipv6_multicast_inversion() {
        let multicast: Ipv6Addr = "ff02::1".parse().unwrap();
        let unicast: Ipv6Addr = "2001:db8::1".parse().unwrap();

        // ISP: only the multicast side survives.
        let mut packet = annotated_packet(0x10000);
        packet.eth_type = ETH_TYPE_IPV6;
        packet.ip6_src = multicast;
        packet.ip6_dst = unicast;
        let mut emit = EmitSet::default();
        derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(emit.v6.len(), 1);
        assert_eq!(emit.v6[0].0, multicast);

        // ToR with the same addresses: only the unicast side survives.
        packet.in_port = 0x30000;
        packet.l2_end_0 = true;
        packet.l2_end_1 = true;
        derive_emit_set(&packet, &mut emit).unwrap();
        assert_eq!(emit.v6.len(), 1);
        assert_eq!(emit.v6[0].0, unicast);
    }

    #[test]
    fn test_unknown_in_port_is_dropped() {
        let packet = annotated_packet(0x20000);
        let mut emit = EmitSet::default();
        assert!(derive_emit_set(&packet, &mut emit).is_none());
    }
}
