//! Buffered pcap writer.
//!
//! Wraps the pcap-file encoder over an in-memory block: records accumulate
//! in the block and are written to disk in one `write_all` when the block
//! reaches the configured size. The split keeps two numbers observable at
//! any time (bytes on disk and bytes still pending), which the rotation
//! policy sums against the file size cap.

use parking_lot::Mutex;
use pcap_file::pcap::{PcapHeader, PcapPacket, PcapWriter};
use pcap_file::{DataLink, Endianness, TsResolution};
use std::borrow::Cow;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Per-record header bytes preceding the captured data.
const RECORD_HEADER_LEN: u64 = 16;

/// Buffered/written packet and byte counters since the last drain.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterStats {
    pub buffered_count: u64,
    pub buffered_bytes: u64,
    pub written_count: u64,
    pub written_bytes: u64,
}

struct Block {
    file: File,
    buf: Vec<u8>,
    file_bytes: u64,
}

/// Shared append-only handle the pcap encoder writes through. Flushing to
/// disk is driven explicitly by [`PcapFileWriter`], never by the encoder.
#[derive(Clone)]
struct BlockHandle(Arc<Mutex<Block>>);

impl BlockHandle {
    fn new(file: File, capacity: usize) -> Self {
        BlockHandle(Arc::new(Mutex::new(Block {
            file,
            buf: Vec::with_capacity(capacity),
            file_bytes: 0,
        })))
    }

    fn buffered_len(&self) -> usize {
        self.0.lock().buf.len()
    }

    fn file_bytes(&self) -> u64 {
        self.0.lock().file_bytes
    }

    /// Writes the whole block to the file; returns the bytes flushed.
    fn flush_to_file(&self) -> io::Result<u64> {
        let mut block = self.0.lock();
        if block.buf.is_empty() {
            return Ok(0);
        }
        let pending = std::mem::take(&mut block.buf);
        block.file.write_all(&pending)?;
        block.file_bytes += pending.len() as u64;
        let flushed = pending.len() as u64;
        // Keep the allocation for the next block.
        block.buf = {
            let mut buf = pending;
            buf.clear();
            buf
        };
        Ok(flushed)
    }
}

impl Write for BlockHandle {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.0.lock().buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A pcap file being written: encoder, block buffer, and counters.
pub struct PcapFileWriter {
    pcap: PcapWriter<BlockHandle>,
    block: BlockHandle,
    block_size: usize,
    tcpip_checksum: bool,
    /// Packets currently sitting in the block.
    pending_packets: u64,
    stats: WriterStats,
}

impl PcapFileWriter {
    /// Opens `path` and writes the pcap global header into the block.
    ///
    /// `buffer_size` is the block size in bytes; `tcpip_checksum` selects
    /// whether captured checksum fields are preserved or zeroed.
    pub fn new<P: AsRef<Path>>(
        path: P,
        buffer_size: usize,
        tcpip_checksum: bool,
    ) -> io::Result<Self> {
        let file = File::create(path.as_ref())?;
        let block = BlockHandle::new(file, buffer_size + 4096);
        let pcap = PcapWriter::with_header(block.clone(), nanosecond_header())
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
        Ok(PcapFileWriter {
            pcap,
            block,
            block_size: buffer_size,
            tcpip_checksum,
            pending_packets: 0,
            stats: WriterStats::default(),
        })
    }

    /// Appends one record. `orig_len` is the on-wire length; `data` the
    /// captured bytes starting at the Ethernet header.
    pub fn write(&mut self, timestamp: Duration, orig_len: u32, data: &[u8]) -> io::Result<()> {
        let data: Cow<'_, [u8]> = if self.tcpip_checksum {
            Cow::Borrowed(data)
        } else {
            let mut copy = data.to_vec();
            zero_checksums(&mut copy);
            Cow::Owned(copy)
        };

        let record = PcapPacket::new(timestamp, orig_len, &data);
        self.pcap
            .write_packet(&record)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;

        self.pending_packets += 1;
        self.stats.buffered_count += 1;
        self.stats.buffered_bytes += RECORD_HEADER_LEN + data.len() as u64;

        if self.block.buffered_len() >= self.block_size {
            self.flush_block()?;
        }
        Ok(())
    }

    /// Bytes already on disk.
    pub fn file_size(&self) -> u64 {
        self.block.file_bytes()
    }

    /// Bytes pending in the block.
    pub fn buffer_size(&self) -> u64 {
        self.block.buffered_len() as u64
    }

    /// Drains the counters accumulated since the previous call.
    pub fn get_and_reset_stats(&mut self) -> WriterStats {
        std::mem::take(&mut self.stats)
    }

    /// Flushes the remaining block and closes the file.
    pub fn close(mut self) -> io::Result<WriterStats> {
        self.flush_block()?;
        Ok(std::mem::take(&mut self.stats))
    }

    fn flush_block(&mut self) -> io::Result<()> {
        let flushed = self.block.flush_to_file()?;
        if flushed > 0 {
            self.stats.written_bytes += flushed;
            self.stats.written_count += self.pending_packets;
            self.pending_packets = 0;
        }
        Ok(())
    }
}

fn nanosecond_header() -> PcapHeader {
    PcapHeader {
        version_major: 2,
        version_minor: 4,
        ts_correction: 0,
        ts_accuracy: 0,
        snaplen: 65535,
        datalink: DataLink::ETHERNET,
        ts_resolution: TsResolution::NanoSecond,
        endianness: Endianness::native(),
    }
}

/// Zeroes the IPv4 header checksum and the TCP/UDP checksum fields of an
/// Ethernet frame in place. Truncated frames are left untouched past the
/// captured length.
fn zero_checksums(data: &mut [u8]) {
    if data.len() < 14 {
        return;
    }
    let eth_type = u16::from_be_bytes([data[12], data[13]]);
    match eth_type {
        // IPv4: header checksum plus L4.
        0x0800 => {
            if data.len() < 14 + 20 {
                return;
            }
            let ihl = ((data[14] & 0x0f) as usize) * 4;
            if ihl < 20 || data.len() < 14 + ihl {
                return;
            }
            data[24] = 0;
            data[25] = 0;
            let proto = data[23];
            zero_l4_checksum(data, proto, 14 + ihl);
        }
        // IPv6: fixed header only; extension headers keep their checksums.
        0x86DD => {
            if data.len() < 14 + 40 {
                return;
            }
            let proto = data[20];
            zero_l4_checksum(data, proto, 14 + 40);
        }
        _ => {}
    }
}

fn zero_l4_checksum(data: &mut [u8], proto: u8, l4_offset: usize) {
    match proto {
        17 if data.len() >= l4_offset + 8 => {
            data[l4_offset + 6] = 0;
            data[l4_offset + 7] = 0;
        }
        6 if data.len() >= l4_offset + 18 => {
            data[l4_offset + 16] = 0;
            data[l4_offset + 17] = 0;
        }
        _ => {}
    }
}
