//! Per-worker capture-file registry.
//!
//! Maps derived file identities to open writers and owns their whole
//! lifecycle: creation on first matching packet, rotation on size or age,
//! and the temp-name → final-name rename at close. IPv4 identities fit the
//! 64-bit key and index a plain map; IPv6 identities are folded into the
//! key, so the map holds ordered buckets disambiguated by full address
//! equality; membership is never decided by hash alone.

use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::writer::{PcapFileWriter, WriterStats};
use crate::config::CaptureConfig;
use crate::packet::{format_timestamp, MetaPacket, TapType};

/// 64-bit file-identity key: `(address << 32) | (acl_gid << 16) | tap`.
pub type WriterKey = u64;

/// Key for an IPv4 identity; unique per (ip, acl_gid, tap) triple.
pub fn writer_key(ip: u32, acl_gid: u16, tap_type: TapType) -> WriterKey {
    ((ip as u64) << 32) | ((acl_gid as u64) << 16) | tap_type.0 as u64
}

/// Key for an IPv6 identity. The address is XOR-folded to 32 bits, so two
/// distinct addresses may share a key; callers must verify full equality.
pub fn writer_key_ipv6(ip: &Ipv6Addr, acl_gid: u16, tap_type: TapType) -> WriterKey {
    let octets = ip.octets();
    let mut fold = 0u32;
    for chunk in octets.chunks_exact(4) {
        fold ^= u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    ((fold as u64) << 32) | ((acl_gid as u64) << 16) | tap_type.0 as u64
}

/// Per-worker counters; the stats reader swaps the whole block.
#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerCounter {
    pub file_creations: u64,
    pub file_closes: u64,
    pub file_rejections: u64,
    pub file_creation_failures: u64,
    pub file_writing_failures: u64,
    pub buffered_count: u64,
    pub written_count: u64,
    pub buffered_bytes: u64,
    pub written_bytes: u64,
}

/// An open capture file: the buffered writer plus the identity and
/// lifecycle metadata its filenames are derived from.
pub struct WrappedWriter {
    writer: PcapFileWriter,

    tap_type: TapType,
    acl_gid: u16,
    ip: IpAddr,
    mac: u64,
    tid: usize,

    temp_filename: PathBuf,
    first_packet_time: Duration,
    last_packet_time: Duration,
}

impl WrappedWriter {
    fn final_path(&self, base: &PathBuf) -> PathBuf {
        base.join(self.acl_gid.to_string()).join(format!(
            "{}_{}_{}_{}_{}.{}.pcap",
            self.tap_type,
            mac_to_string(self.mac),
            ip_label(&self.ip),
            format_timestamp(self.first_packet_time),
            format_timestamp(self.last_packet_time),
            self.tid
        ))
    }
}

fn temp_file_name(
    tap_type: TapType,
    mac: u64,
    ip: &IpAddr,
    first_packet_time: Duration,
    tid: usize,
) -> String {
    format!(
        "{}_{}_{}_{}_.{}.pcap.temp",
        tap_type,
        mac_to_string(mac),
        ip_label(ip),
        format_timestamp(first_packet_time),
        tid
    )
}

fn ip_label(ip: &IpAddr) -> String {
    match ip {
        IpAddr::V4(ip) => ipv4_to_string(u32::from(*ip)),
        IpAddr::V6(ip) => ip.to_string(),
    }
}

/// 12 lowercase hex chars, no separators.
fn mac_to_string(mac: u64) -> String {
    format!("{:012x}", mac)
}

/// Zero-padded decimal octets, e.g. `010000000001` for 10.0.0.1.
fn ipv4_to_string(ip: u32) -> String {
    format!(
        "{:03}{:03}{:03}{:03}",
        (ip >> 24) as u8,
        (ip >> 16) as u8,
        (ip >> 8) as u8,
        ip as u8
    )
}

/// The registry: open writers of one worker, both address families.
pub struct WriterRegistry {
    base_directory: PathBuf,
    max_concurrent_files: usize,
    max_file_size: u64,
    max_file_period: Duration,
    writer_buffer_size: usize,
    tcpip_checksum: bool,
    tid: usize,

    writers: HashMap<WriterKey, WrappedWriter>,
    writers_ipv6: HashMap<WriterKey, Vec<WrappedWriter>>,

    counter: Arc<Mutex<WorkerCounter>>,
}

impl WriterRegistry {
    pub fn new(
        config: &CaptureConfig,
        max_concurrent_files: usize,
        tid: usize,
        counter: Arc<Mutex<WorkerCounter>>,
    ) -> Self {
        WriterRegistry {
            base_directory: PathBuf::from(&config.base_directory),
            max_concurrent_files,
            max_file_size: config.max_file_size(),
            max_file_period: config.max_file_period(),
            writer_buffer_size: config.writer_buffer_size(),
            tcpip_checksum: config.tcpip_checksum,
            tid,
            writers: HashMap::new(),
            writers_ipv6: HashMap::new(),
            counter,
        }
    }

    /// Open writers across both families.
    pub fn open_writer_count(&self) -> usize {
        self.writers.len() + self.writers_ipv6.values().map(Vec::len).sum::<usize>()
    }

    /// Routes one packet to its IPv4-identified capture file, rotating the
    /// file first if the size or age cap is hit.
    pub fn write_packet(
        &mut self,
        packet: &MetaPacket,
        tap_type: TapType,
        ip: u32,
        mac: u64,
        acl_gid: u16,
    ) {
        let key = writer_key(ip, acl_gid, tap_type);
        let close = self
            .writers
            .get(&key)
            .is_some_and(|writer| self.should_close(writer, packet.timestamp));
        if close {
            if let Some(writer) = self.writers.remove(&key) {
                self.finish_writer(writer);
            }
        }
        if !self.writers.contains_key(&key) {
            let Some(writer) = self.generate_wrapped_writer(
                IpAddr::V4(Ipv4Addr::from(ip)),
                mac,
                tap_type,
                acl_gid,
                packet.timestamp,
            ) else {
                return;
            };
            self.writers.insert(key, writer);
        }
        if let Some(writer) = self.writers.get_mut(&key) {
            append_packet(writer, packet, &self.counter);
        }
    }

    /// IPv6 variant: the key is a fold, so the bucket is scanned for the
    /// exact address before any lifecycle decision.
    pub fn write_packet_ipv6(
        &mut self,
        packet: &MetaPacket,
        tap_type: TapType,
        ip: Ipv6Addr,
        mac: u64,
        acl_gid: u16,
    ) {
        let key = writer_key_ipv6(&ip, acl_gid, tap_type);
        let max_file_size = self.max_file_size;
        let max_file_period = self.max_file_period;

        let mut position = None;
        if let Some(bucket) = self.writers_ipv6.get_mut(&key) {
            if let Some(i) = bucket.iter().position(|w| w.ip == IpAddr::V6(ip)) {
                if should_close_file(&bucket[i], packet.timestamp, max_file_size, max_file_period)
                {
                    let writer = bucket.remove(i);
                    self.finish_writer(writer);
                } else {
                    position = Some(i);
                }
            }
        }

        let position = match position {
            Some(i) => i,
            None => {
                let Some(writer) = self.generate_wrapped_writer(
                    IpAddr::V6(ip),
                    mac,
                    tap_type,
                    acl_gid,
                    packet.timestamp,
                ) else {
                    return;
                };
                let bucket = self.writers_ipv6.entry(key).or_default();
                bucket.push(writer);
                bucket.len() - 1
            }
        };

        if let Some(writer) = self
            .writers_ipv6
            .get_mut(&key)
            .and_then(|bucket| bucket.get_mut(position))
        {
            append_packet(writer, packet, &self.counter);
        }
    }

    /// Tick-driven rotation: finalizes every writer older than the period,
    /// judged against wall-clock `now`.
    pub fn rotate_aged(&mut self, now: Duration) {
        let period = self.max_file_period;
        let aged: Vec<WriterKey> = self
            .writers
            .iter()
            .filter(|(_, w)| file_age(w, now) > period)
            .map(|(key, _)| *key)
            .collect();
        for key in aged {
            if let Some(writer) = self.writers.remove(&key) {
                self.finish_writer(writer);
            }
        }

        let counter = Arc::clone(&self.counter);
        let base = self.base_directory.clone();
        for bucket in self.writers_ipv6.values_mut() {
            let mut i = 0;
            while i < bucket.len() {
                if file_age(&bucket[i], now) > period {
                    let writer = bucket.remove(i);
                    finish_writer_inner(writer, &base, &counter);
                } else {
                    i += 1;
                }
            }
        }
        self.writers_ipv6.retain(|_, bucket| !bucket.is_empty());
    }

    /// Finalizes every open writer; called once at shutdown.
    pub fn close_all(&mut self) {
        for (_, writer) in self.writers.drain().collect::<Vec<_>>() {
            self.finish_writer(writer);
        }
        let buckets: Vec<WrappedWriter> = self
            .writers_ipv6
            .drain()
            .flat_map(|(_, bucket)| bucket)
            .collect();
        for writer in buckets {
            self.finish_writer(writer);
        }
    }

    fn should_close(&self, writer: &WrappedWriter, packet_time: Duration) -> bool {
        should_close_file(writer, packet_time, self.max_file_size, self.max_file_period)
    }

    /// Closes the file, drains its counters, and promotes the temp file to
    /// its final name.
    fn finish_writer(&mut self, writer: WrappedWriter) {
        finish_writer_inner(writer, &self.base_directory, &self.counter);
    }

    /// Opens a new capture file under `<base>/<acl_gid>/`, enforcing the
    /// concurrent-file cap. Returns None (counted) on rejection or failure.
    ///
    /// The cap is judged against the IPv4 map alone, for creations of both
    /// families; IPv6 writers never count toward it.
    fn generate_wrapped_writer(
        &mut self,
        ip: IpAddr,
        mac: u64,
        tap_type: TapType,
        acl_gid: u16,
        timestamp: Duration,
    ) -> Option<WrappedWriter> {
        if self.writers.len() >= self.max_concurrent_files {
            debug!(
                "Max concurrent file ({} files) exceeded",
                self.max_concurrent_files
            );
            self.counter.lock().file_rejections += 1;
            return None;
        }

        let directory = self.base_directory.join(acl_gid.to_string());
        if !directory.exists() {
            if let Err(e) = std::fs::create_dir_all(&directory) {
                debug!("Failed to create {}: {}", directory.display(), e);
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = std::fs::set_permissions(
                    &directory,
                    std::fs::Permissions::from_mode(0o777),
                );
            }
        }

        let temp_filename =
            directory.join(temp_file_name(tap_type, mac, &ip, timestamp, self.tid));
        debug!("Begin to write packets to {}", temp_filename.display());
        let writer = match PcapFileWriter::new(
            &temp_filename,
            self.writer_buffer_size,
            self.tcpip_checksum,
        ) {
            Ok(writer) => writer,
            Err(e) => {
                debug!(
                    "Failed to create writer for {}: {}",
                    temp_filename.display(),
                    e
                );
                self.counter.lock().file_creation_failures += 1;
                return None;
            }
        };
        self.counter.lock().file_creations += 1;
        Some(WrappedWriter {
            writer,
            tap_type,
            acl_gid,
            ip,
            mac,
            tid: self.tid,
            temp_filename,
            first_packet_time: timestamp,
            last_packet_time: timestamp,
        })
    }
}

/// Size cap counts both flushed and pending bytes; the age cap compares
/// against the packet clock (write path) or wall clock (tick path).
fn should_close_file(
    writer: &WrappedWriter,
    packet_time: Duration,
    max_file_size: u64,
    max_file_period: Duration,
) -> bool {
    if writer.writer.file_size() + writer.writer.buffer_size() >= max_file_size {
        return true;
    }
    file_age(writer, packet_time) > max_file_period
}

fn file_age(writer: &WrappedWriter, now: Duration) -> Duration {
    now.checked_sub(writer.first_packet_time)
        .unwrap_or(Duration::ZERO)
}

fn append_packet(
    writer: &mut WrappedWriter,
    packet: &MetaPacket,
    counter: &Arc<Mutex<WorkerCounter>>,
) {
    if let Err(e) = writer
        .writer
        .write(packet.timestamp, packet.packet_len, &packet.raw)
    {
        debug!(
            "Failed to write packet to {}: {}",
            writer.temp_filename.display(),
            e
        );
        counter.lock().file_writing_failures += 1;
        return;
    }
    drain_writer_stats(counter, writer.writer.get_and_reset_stats());
    writer.last_packet_time = packet.timestamp;
}

fn finish_writer_inner(
    writer: WrappedWriter,
    base_directory: &PathBuf,
    counter: &Arc<Mutex<WorkerCounter>>,
) {
    let new_filename = writer.final_path(base_directory);
    let temp_filename = writer.temp_filename.clone();
    debug!(
        "Finish writing {}, renaming to {}",
        temp_filename.display(),
        new_filename.display()
    );
    match writer.writer.close() {
        Ok(stats) => drain_writer_stats(counter, stats),
        Err(e) => debug!("Failed to close {}: {}", temp_filename.display(), e),
    }
    if let Err(e) = std::fs::rename(&temp_filename, &new_filename) {
        // Non-fatal: the temp file is left for operators to reconcile.
        warn!(
            "Failed to rename {} to {}: {}",
            temp_filename.display(),
            new_filename.display(),
            e
        );
    }
    counter.lock().file_closes += 1;
}

fn drain_writer_stats(counter: &Arc<Mutex<WorkerCounter>>, stats: WriterStats) {
    let mut counter = counter.lock();
    counter.buffered_count += stats.buffered_count;
    counter.buffered_bytes += stats.buffered_bytes;
    counter.written_count += stats.written_count;
    counter.written_bytes += stats.written_bytes;
}
