//! Flow record model: the 5-tuple key, the per-direction metric peers, and
//! the tracking state wrapped around them.

use std::time::Duration;

use crate::packet::{EndpointData, MetaPacket};

/// Flow lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    Raw,
    Established,
    Closed,
}

/// UDP flow timeouts.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Applied to newly created flows, so one-shot scans reap quickly.
    pub opening: Duration,
    /// Applied once a reply direction has been observed.
    pub established_rst: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        TimeoutConfig {
            opening: Duration::from_secs(5),
            established_rst: Duration::from_secs(30),
        }
    }
}

/// The 5-tuple a flow is keyed by, stored in the orientation of its first
/// packet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowKey {
    pub proto: u8,
    pub ip_src: u32,
    pub ip_dst: u32,
    pub port_src: u16,
    pub port_dst: u16,
}

impl FlowKey {
    pub fn from_packet(meta: &MetaPacket) -> Self {
        FlowKey {
            proto: meta.proto,
            ip_src: meta.ip_src,
            ip_dst: meta.ip_dst,
            port_src: meta.port_src,
            port_dst: meta.port_dst,
        }
    }

    /// Matches a packet against this key in both orientations.
    ///
    /// Returns `Some(reply)` where `reply` is true iff the packet's source
    /// side is the flow's destination side. The forward orientation wins
    /// when both match (e.g. a flow between identical endpoints).
    pub fn match_packet(&self, meta: &MetaPacket) -> Option<bool> {
        if self.proto != meta.proto {
            return None;
        }
        if self.ip_src == meta.ip_src
            && self.ip_dst == meta.ip_dst
            && self.port_src == meta.port_src
            && self.port_dst == meta.port_dst
        {
            return Some(false);
        }
        if self.ip_src == meta.ip_dst
            && self.ip_dst == meta.ip_src
            && self.port_src == meta.port_dst
            && self.port_dst == meta.port_src
        {
            return Some(true);
        }
        None
    }
}

/// Per-direction flow statistics and endpoint tag.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowMetricsPeer {
    /// First-seen timestamp for this direction.
    pub arr_time_0: Duration,
    /// Most-recent timestamp for this direction.
    pub arr_time_last: Duration,
    pub total_packet_count: u64,
    pub packet_count: u64,
    pub total_byte_count: u64,
    pub byte_count: u64,

    pub l3_epc_id: i32,
    pub is_l2_end: bool,
}

impl FlowMetricsPeer {
    fn merge_packet(&mut self, meta: &MetaPacket) {
        if self.total_packet_count == 0 {
            self.arr_time_0 = meta.timestamp;
        }
        self.arr_time_last = meta.timestamp;
        self.packet_count += 1;
        self.total_packet_count += 1;
        self.byte_count += meta.packet_len as u64;
        self.total_byte_count += meta.packet_len as u64;
    }
}

/// A flow record with its directional peers.
#[derive(Debug, Clone, Default)]
pub struct TaggedFlow {
    pub flow_key: FlowKey,
    pub peer_src: FlowMetricsPeer,
    pub peer_dst: FlowMetricsPeer,
    /// Timestamp of the first packet of the flow.
    pub start_time: Duration,
}

/// A live flow: the record plus tracking state.
#[derive(Debug, Clone)]
pub struct FlowExtra {
    pub tagged_flow: TaggedFlow,
    pub flow_state: FlowState,
    /// Current inactivity timeout.
    pub timeout: Duration,
    /// Instant at which the flow becomes eligible for reaping; maintained
    /// as `arr_time_last + timeout` on every update.
    pub reap_time: Duration,
}

impl FlowExtra {
    /// Builds a new flow from its first packet, tagged forward.
    pub fn from_first_packet(meta: &MetaPacket, timeout: Duration) -> Self {
        let mut tagged_flow = TaggedFlow {
            flow_key: FlowKey::from_packet(meta),
            start_time: meta.timestamp,
            ..Default::default()
        };
        tagged_flow.peer_src.merge_packet(meta);
        install_endpoint_tags(&mut tagged_flow, meta.endpoint_data.as_ref(), false);

        FlowExtra {
            tagged_flow,
            flow_state: FlowState::Established,
            timeout,
            reap_time: meta.timestamp + timeout,
        }
    }

    /// Merges a packet into the peer selected by `reply`.
    pub fn merge_packet(&mut self, meta: &MetaPacket, reply: bool) {
        let peer = if reply {
            &mut self.tagged_flow.peer_dst
        } else {
            &mut self.tagged_flow.peer_src
        };
        peer.merge_packet(meta);
        self.reap_time = meta.timestamp + self.timeout;
    }

    /// Replaces the inactivity timeout and refreshes the reap deadline.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
        let last = self
            .tagged_flow
            .peer_src
            .arr_time_last
            .max(self.tagged_flow.peer_dst.arr_time_last);
        self.reap_time = last + timeout;
    }
}

/// Copies the packet's endpoint annotations onto the flow peers. `reverse`
/// maps the packet's source info onto the flow's destination peer.
fn install_endpoint_tags(flow: &mut TaggedFlow, endpoints: Option<&EndpointData>, reverse: bool) {
    let Some(endpoints) = endpoints else {
        return;
    };
    let (src, dst) = if reverse {
        (endpoints.dst_info, endpoints.src_info)
    } else {
        (endpoints.src_info, endpoints.dst_info)
    };
    flow.peer_src.l3_epc_id = src.l3_epc_id;
    flow.peer_src.is_l2_end = src.l2_end;
    flow.peer_dst.l3_epc_id = dst.l3_epc_id;
    flow.peer_dst.is_l2_end = dst.l2_end;
}
