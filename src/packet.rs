//! # Packet Model
//!
//! The parsed-packet record consumed by both subsystems, together with the
//! upstream annotations they read (endpoint data, policy actions), the
//! packet pool the workers release into, and the tap-type classification
//! derived from the ingress port.
//!
//! Packets are produced and annotated upstream; this crate only reads them
//! and releases them back to their pool exactly once per packet.

use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use std::net::Ipv6Addr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// EtherType of IPv6 payloads.
pub const ETH_TYPE_IPV6: u16 = 0x86DD;

/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// Policy action flag: capture matching packets to pcap files.
pub const ACTION_PACKET_CAPTURING: u32 = 1 << 6;

/// All-ones broadcast MAC, stored in the low 48 bits.
pub const BROADCAST_MAC: u64 = u64::MAX >> 16;

/// 255.255.255.255 as a host-order integer.
pub const BROADCAST_IP: u32 = u32::MAX;

/// Filename timestamp layout: fixed width, UTC, lexically sortable.
const TIME_FORMAT: &str = "%y%m%d%H%M%S";

// ================================================================================================
// TAP TYPE
// ================================================================================================

/// Packet ingress classification carried into capture-file identities.
///
/// ISP taps are numbered by the ingress port (`in_port - 0x10000`); ToR
/// traffic all maps to the single `TOR` value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TapType(pub u16);

impl TapType {
    pub const TOR: TapType = TapType(3);
}

impl std::fmt::Display for TapType {
    /// Formats the filename label: `tor` or `isp<N>`.
    ///
    /// Values outside 0..=30 cannot be produced by the in_port ranges the
    /// workers accept; reaching one here is a programming error.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if *self == Self::TOR {
            write!(f, "tor")
        } else if self.0 <= 30 {
            write!(f, "isp{}", self.0)
        } else {
            panic!("unsupported tap type {}", self.0);
        }
    }
}

// ================================================================================================
// UPSTREAM ANNOTATIONS
// ================================================================================================

/// Endpoint annotation for one side of a packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointInfo {
    /// Logical L3 segment ID; zero means unknown/external.
    pub l3_epc_id: i32,
    /// Whether this host is the L2 terminus.
    pub l2_end: bool,
}

/// Endpoint annotations for both sides of a packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct EndpointData {
    pub src_info: EndpointInfo,
    pub dst_info: EndpointInfo,
}

/// One access-control action attached to a packet by the policy evaluator.
#[derive(Debug, Clone, Copy)]
pub struct AclAction {
    /// ACL group identifier; actions with a zero GID are ignored.
    pub acl_gid: u16,
    /// Action-flag bitmask; see [`ACTION_PACKET_CAPTURING`].
    pub action_flags: u32,
}

/// Policy annotation: the evaluated actions, consumed opaquely.
#[derive(Debug, Clone, Default)]
pub struct PolicyData {
    pub acl_actions: Vec<AclAction>,
}

// ================================================================================================
// META PACKET
// ================================================================================================

/// Parsed packet metadata handed in from the decoding stage.
///
/// Addresses are kept in both widths: `ip_src`/`ip_dst` are host-order IPv4
/// integers, `ip6_src`/`ip6_dst` carry the full IPv6 addresses. Which pair
/// is meaningful follows `eth_type`.
#[derive(Debug, Clone)]
pub struct MetaPacket {
    /// Nanosecond-resolution timestamp, as a duration since the Unix epoch.
    pub timestamp: Duration,

    pub mac_src: u64,
    pub mac_dst: u64,

    pub eth_type: u16,
    pub ip_src: u32,
    pub ip_dst: u32,
    pub ip6_src: Ipv6Addr,
    pub ip6_dst: Ipv6Addr,

    pub proto: u8,
    pub port_src: u16,
    pub port_dst: u16,

    /// On-wire byte length of the packet.
    pub packet_len: u32,

    /// Ingress port code; encodes the tap classification.
    pub in_port: u32,

    /// L2 terminus flags observed on the packet itself (src / dst side).
    pub l2_end_0: bool,
    pub l2_end_1: bool,

    pub endpoint_data: Option<EndpointData>,
    pub policy_data: Option<PolicyData>,

    /// Captured bytes, starting at the Ethernet header. May be shorter than
    /// `packet_len` if the capture was truncated.
    pub raw: Vec<u8>,
}

impl Default for MetaPacket {
    fn default() -> Self {
        MetaPacket {
            timestamp: Duration::ZERO,
            mac_src: 0,
            mac_dst: 0,
            eth_type: 0,
            ip_src: 0,
            ip_dst: 0,
            ip6_src: Ipv6Addr::UNSPECIFIED,
            ip6_dst: Ipv6Addr::UNSPECIFIED,
            proto: 0,
            port_src: 0,
            port_dst: 0,
            packet_len: 0,
            in_port: 0,
            l2_end_0: false,
            l2_end_1: false,
            endpoint_data: None,
            policy_data: None,
            raw: Vec::new(),
        }
    }
}

// ================================================================================================
// PACKET POOL
// ================================================================================================

/// Free list the decoding stage allocates from and the workers release into.
///
/// Releasing clears the annotations and captured bytes but keeps the raw
/// buffer's capacity, so steady-state processing does not reallocate.
#[derive(Debug, Default)]
pub struct MetaPacketPool {
    free: Mutex<Vec<Box<MetaPacket>>>,
}

impl MetaPacketPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes a cleared packet from the pool, allocating if it is empty.
    pub fn acquire(&self) -> Box<MetaPacket> {
        self.free
            .lock()
            .pop()
            .unwrap_or_else(|| Box::new(MetaPacket::default()))
    }

    /// Returns a packet to the pool. Must be called exactly once per packet
    /// on every processing path.
    pub fn release(&self, mut packet: Box<MetaPacket>) {
        let raw = std::mem::take(&mut packet.raw);
        *packet = MetaPacket::default();
        packet.raw = raw;
        packet.raw.clear();
        self.free.lock().push(packet);
    }

    pub fn len(&self) -> usize {
        self.free.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.free.lock().is_empty()
    }
}

// ================================================================================================
// TIME HELPERS
// ================================================================================================

/// Wall-clock now as a duration since the Unix epoch, the same scale packet
/// timestamps use.
pub fn timestamp_now() -> Duration {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
}

/// Formats a packet timestamp with the fixed filename layout.
pub fn format_timestamp(ts: Duration) -> String {
    Utc.timestamp_opt(ts.as_secs() as i64, ts.subsec_nanos())
        .single()
        .map(|dt| dt.format(TIME_FORMAT).to_string())
        .unwrap_or_else(|| "000000000000".to_string())
}
