//! Packet sources
//!
//! Feeds decoded TCP segments to the pipeline. The primary source
//! replays PCAP files; an in-memory source backs the tests. Frames
//! that do not decode down to a TCP segment are counted and skipped
//! rather than aborting the run.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::Context;
use pcap::{Capture, Linktype, Offline};
use tracing::{debug, trace};

use crate::core::packet::{TcpFlags, TcpOption, TcpPacket};

/// A stream of decoded TCP segments.
pub trait PacketSource: Send {
    /// Next segment, or `None` once the source is exhausted.
    fn next_packet(&mut self) -> anyhow::Result<Option<TcpPacket>>;

    /// Frames skipped because they could not be decoded down to TCP.
    fn malformed(&self) -> u64 {
        0
    }

    /// Release the underlying handle, if any.
    fn close(&mut self) {}
}

/// Replays a capture file, decoding each frame down to its TCP segment.
pub struct PcapFileSource {
    path: PathBuf,
    capture: Option<Capture<Offline>>,
    link_type: Linktype,
    malformed: u64,
}

impl PcapFileSource {
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let capture = Capture::from_file(&path)
            .with_context(|| format!("opening capture file {}", path.display()))?;
        let link_type = capture.get_datalink();
        debug!(file = %path.display(), link_type = ?link_type, "opened capture file");
        Ok(Self {
            path,
            capture: Some(capture),
            link_type,
            malformed: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Decode one captured frame according to the file link type.
    fn decode(&self, ts_sec: u64, ts_usec: u64, data: &[u8]) -> Option<TcpPacket> {
        let sliced = match self.link_type {
            Linktype::ETHERNET => etherparse::SlicedPacket::from_ethernet(data).ok()?,
            Linktype::RAW | Linktype::IPV4 | Linktype::IPV6 => {
                etherparse::SlicedPacket::from_ip(data).ok()?
            }
            // BSD loopback encapsulation: a 4-byte family header, then IP
            Linktype::NULL | Linktype::LOOP => {
                if data.len() <= 4 {
                    return None;
                }
                etherparse::SlicedPacket::from_ip(&data[4..]).ok()?
            }
            _ => return None,
        };

        let (src_ip, dst_ip): (IpAddr, IpAddr) = match &sliced.net {
            Some(etherparse::NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                (header.source_addr().into(), header.destination_addr().into())
            }
            Some(etherparse::NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                (header.source_addr().into(), header.destination_addr().into())
            }
            _ => return None,
        };

        let tcp = match &sliced.transport {
            Some(etherparse::TransportSlice::Tcp(tcp)) => tcp,
            _ => return None,
        };

        let mut bits = 0u8;
        if tcp.fin() {
            bits |= 0x01;
        }
        if tcp.syn() {
            bits |= 0x02;
        }
        if tcp.rst() {
            bits |= 0x04;
        }
        if tcp.psh() {
            bits |= 0x08;
        }
        if tcp.ack() {
            bits |= 0x10;
        }
        if tcp.urg() {
            bits |= 0x20;
        }

        Some(TcpPacket {
            ts_sec,
            ts_usec,
            src_ip,
            src_port: tcp.source_port(),
            dst_ip,
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number() as u64,
            ack: tcp.acknowledgment_number() as u64,
            window: tcp.window_size() as u64,
            flags: TcpFlags::from_u8(bits),
            options: decode_options(tcp.options()),
            payload: tcp.payload().to_vec(),
        })
    }
}

impl PacketSource for PcapFileSource {
    fn next_packet(&mut self) -> anyhow::Result<Option<TcpPacket>> {
        loop {
            // capture the frame into owned parts so the handle borrow
            // ends before decoding
            let frame = match self.capture.as_mut() {
                Some(capture) => match capture.next_packet() {
                    Ok(frame) => Ok((
                        frame.header.ts.tv_sec as u64,
                        frame.header.ts.tv_usec as u64,
                        frame.data.to_vec(),
                    )),
                    Err(e) => Err(e),
                },
                None => return Ok(None),
            };
            let (ts_sec, ts_usec, data) = match frame {
                Ok(parts) => parts,
                Err(pcap::Error::NoMorePackets) => return Ok(None),
                Err(e) => {
                    return Err(e).with_context(|| {
                        format!("reading capture file {}", self.path.display())
                    })
                }
            };
            match self.decode(ts_sec, ts_usec, &data) {
                Some(packet) => return Ok(Some(packet)),
                None => {
                    trace!(file = %self.path.display(), "skipping non-TCP frame");
                    self.malformed += 1;
                }
            }
        }
    }

    fn malformed(&self) -> u64 {
        self.malformed
    }

    fn close(&mut self) {
        self.capture = None;
    }
}

/// Walk the raw TCP option bytes and record each option kind.
fn decode_options(raw: &[u8]) -> Vec<TcpOption> {
    let mut options = Vec::new();
    let mut i = 0;
    while i < raw.len() {
        let kind = raw[i];
        options.push(TcpOption::new(kind));
        match kind {
            // end of option list
            0 => break,
            // no-operation, single byte
            1 => i += 1,
            _ => {
                let Some(&len) = raw.get(i + 1) else { break };
                if len < 2 {
                    break;
                }
                i += len as usize;
            }
        }
    }
    options
}

/// In-memory source used by tests and signature checks.
pub struct MemorySource {
    packets: std::collections::VecDeque<TcpPacket>,
}

impl MemorySource {
    pub fn new(packets: impl IntoIterator<Item = TcpPacket>) -> Self {
        Self {
            packets: packets.into_iter().collect(),
        }
    }
}

impl PacketSource for MemorySource {
    fn next_packet(&mut self) -> anyhow::Result<Option<TcpPacket>> {
        Ok(self.packets.pop_front())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_source_drains_in_order() {
        let mut source = MemorySource::new(vec![
            TcpPacket {
                ts_sec: 1,
                ts_usec: 0,
                src_ip: "10.0.0.1".parse().unwrap(),
                src_port: 40000,
                dst_ip: "10.0.0.2".parse().unwrap(),
                dst_port: 25,
                seq: 100,
                ack: 0,
                window: 65535,
                flags: TcpFlags::from_u8(0x02),
                options: Vec::new(),
                payload: Vec::new(),
            },
        ]);
        assert!(source.next_packet().unwrap().is_some());
        assert!(source.next_packet().unwrap().is_none());
        assert_eq!(source.malformed(), 0);
    }

    fn pcap_bytes(frames: &[&[u8]]) -> Vec<u8> {
        // classic pcap, little-endian, ethernet link type
        let mut out = Vec::new();
        out.extend_from_slice(&0xa1b2_c3d4u32.to_le_bytes());
        out.extend_from_slice(&2u16.to_le_bytes());
        out.extend_from_slice(&4u16.to_le_bytes());
        out.extend_from_slice(&0i32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&65535u32.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        for data in frames {
            out.extend_from_slice(&100u32.to_le_bytes());
            out.extend_from_slice(&250u32.to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(&(data.len() as u32).to_le_bytes());
            out.extend_from_slice(data);
        }
        out
    }

    fn syn_frame() -> Vec<u8> {
        let builder = etherparse::PacketBuilder::ethernet2(
            [2, 0, 0, 0, 0, 1],
            [2, 0, 0, 0, 0, 2],
        )
        .ipv4([192, 168, 1, 10], [10, 0, 0, 25], 64)
        .tcp(45000, 25, 1000, 65535)
        .syn();
        let mut frame = Vec::with_capacity(builder.size(0));
        builder.write(&mut frame, &[]).unwrap();
        frame
    }

    #[test]
    fn pcap_file_source_skips_garbage_and_decodes_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.pcap");
        let frame = syn_frame();
        let garbage = [0u8, 1, 2];
        std::fs::write(&path, pcap_bytes(&[&garbage, &frame])).unwrap();

        let mut source = PcapFileSource::open(&path).unwrap();
        let packet = source.next_packet().unwrap().expect("tcp frame");
        assert_eq!(packet.src_ip, "192.168.1.10".parse::<IpAddr>().unwrap());
        assert_eq!(packet.src_port, 45000);
        assert_eq!(packet.dst_port, 25);
        assert_eq!(packet.seq, 1000);
        assert!(packet.flags.syn);
        assert_eq!(packet.ts_sec, 100);
        assert_eq!(packet.ts_usec, 250);

        assert!(source.next_packet().unwrap().is_none());
        assert_eq!(source.malformed(), 1);
    }

    #[test]
    fn option_walk_handles_nop_and_length() {
        // MSS (kind 2, len 4), NOP, NOP, SACK-permitted (kind 4, len 2)
        let raw = [2u8, 4, 0x05, 0xb4, 1, 1, 4, 2];
        let kinds: Vec<u8> = decode_options(&raw).iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![2, 1, 1, 4]);
    }

    #[test]
    fn option_walk_stops_on_end_of_list() {
        let raw = [1u8, 0, 2, 4, 0x05, 0xb4];
        let kinds: Vec<u8> = decode_options(&raw).iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![1, 0]);
    }

    #[test]
    fn option_walk_rejects_truncated_option() {
        let raw = [2u8];
        let kinds: Vec<u8> = decode_options(&raw).iter().map(|o| o.kind).collect();
        assert_eq!(kinds, vec![2]);
    }
}
