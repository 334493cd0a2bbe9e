//! Decoded TCP segment representation
//!
//! Carries exactly what the reassembler needs: sequence/ack numbers,
//! flags, window, payload bytes and the capture timestamp.

use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// TCP flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    pub fn from_u8(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }

    pub fn to_u8(&self) -> u8 {
        let mut flags = 0u8;
        if self.fin { flags |= 0x01; }
        if self.syn { flags |= 0x02; }
        if self.rst { flags |= 0x04; }
        if self.psh { flags |= 0x08; }
        if self.ack { flags |= 0x10; }
        if self.urg { flags |= 0x20; }
        flags
    }

    pub fn is_syn(&self) -> bool {
        self.syn && !self.ack
    }

    pub fn is_syn_ack(&self) -> bool {
        self.syn && self.ack
    }
}

impl std::fmt::Display for TcpFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = String::new();
        if self.syn { s.push('S'); }
        if self.ack { s.push('A'); }
        if self.fin { s.push('F'); }
        if self.rst { s.push('R'); }
        if self.psh { s.push('P'); }
        if self.urg { s.push('U'); }
        if s.is_empty() { s.push('.'); }
        write!(f, "{}", s)
    }
}

/// A TCP option decoded from the header.
///
/// Only the kind is interpreted; option payloads are not needed for
/// session reconstruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TcpOption {
    pub kind: u8,
}

impl TcpOption {
    pub fn new(kind: u8) -> Self {
        Self { kind }
    }

    /// Human-readable name for the well-known option kinds.
    pub fn name(&self) -> &'static str {
        match self.kind {
            0x02 => "Maximum Segment Size",
            0x03 => "Window Scale",
            0x04 => "SACK Permitted",
            0x05 => "SACK",
            0x08 => "Timestamps",
            0x1e => "Multipath TCP",
            0xfe => "Experimental",
            _ => "Unknown",
        }
    }
}

impl std::fmt::Display for TcpOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// A decoded TCP segment with its capture timestamp.
#[derive(Debug, Clone)]
pub struct TcpPacket {
    /// Capture timestamp, seconds part
    pub ts_sec: u64,
    /// Capture timestamp, microseconds part
    pub ts_usec: u64,

    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,

    pub seq: u64,
    pub ack: u64,
    pub window: u64,
    pub flags: TcpFlags,
    pub options: Vec<TcpOption>,
    pub payload: Vec<u8>,
}

impl TcpPacket {
    /// Source endpoint as an address/port pair.
    pub fn src(&self) -> (IpAddr, u16) {
        (self.src_ip, self.src_port)
    }

    /// Destination endpoint as an address/port pair.
    pub fn dst(&self) -> (IpAddr, u16) {
        (self.dst_ip, self.dst_port)
    }

    /// Next sequence number this sender will use: flags consuming
    /// sequence space advance it by one past `seq`.
    pub fn next_seq(&self) -> u64 {
        if self.flags.syn || self.flags.fin || self.flags.rst {
            self.seq + 1
        } else {
            self.seq
        }
    }

    /// Payload as text for the protocol layer (lossy UTF-8).
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).to_string()
    }
}
