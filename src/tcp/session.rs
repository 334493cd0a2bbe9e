//! Single TCP session reassembly
//!
//! A session is identified by its 4-tuple and rebuilt packet by packet.
//! Each direction keeps its own sequence-space bookkeeping; segments
//! arriving out of order are parked in a hold buffer and re-admitted
//! once the gap closes.

use std::net::IpAddr;

use crate::core::packet::{TcpOption, TcpPacket};

/// Per-direction reassembly state.
#[derive(Debug, Clone)]
pub struct EndpointState {
    pub addr: IpAddr,
    pub port: u16,
    /// This endpoint sent a SYN
    pub has_syn: bool,
    /// This endpoint acknowledged the peer's SYN
    pub has_ack_syn: bool,
    /// This endpoint sent a FIN
    pub has_fin: bool,
    /// This endpoint acknowledged the peer's FIN
    pub has_ack_fin: bool,
    /// This endpoint sent a RST
    pub has_rst: bool,
    pub syn_seq: i64,
    /// Highest FIN sequence number seen from this endpoint
    pub fin_seq: i64,
    pub last_byte_sent: i64,
    pub last_byte_acked: i64,
    /// Payload length of the last in-order segment from this endpoint
    pub last_payload_len: usize,
    /// Receive window advertised by this endpoint
    pub window: i64,
    /// First sequence number exhibited by this endpoint
    pub start_seq: i64,
    pub packet_count: usize,
    /// TCP options announced on this endpoint's SYN
    pub options: Vec<TcpOption>,
    /// Out-of-order segments from this endpoint, ordered by descending
    /// sequence number
    hold: Vec<TcpPacket>,
}

impl EndpointState {
    fn new(addr: IpAddr, port: u16) -> Self {
        Self {
            addr,
            port,
            has_syn: false,
            has_ack_syn: false,
            has_fin: false,
            has_ack_fin: false,
            has_rst: false,
            syn_seq: 0,
            fin_seq: 0,
            last_byte_sent: 0,
            last_byte_acked: 0,
            last_payload_len: 0,
            window: 0,
            start_seq: 0,
            packet_count: 0,
            options: Vec::new(),
            hold: Vec::new(),
        }
    }

    fn record_options(&mut self, options: &[TcpOption]) {
        for opt in options {
            if !self.options.contains(opt) {
                self.options.push(*opt);
            }
        }
    }

    /// Number of segments currently parked in the hold buffer.
    pub fn held(&self) -> usize {
        self.hold.len()
    }
}

impl std::fmt::Display for EndpointState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.addr, self.port)
    }
}

/// A reassembled TCP session.
///
/// The default value is the empty session, used as the end-of-source
/// marker between the builder and its consumer.
#[derive(Debug, Clone, Default)]
pub struct TcpSession {
    packets: Vec<TcpPacket>,
    endpoints: Option<(EndpointState, EndpointState)>,
    last_cap_sec: i64,
    last_cap_msec: i64,
    duration_ms: i64,
    has_syn: bool,
    has_fin: bool,
    has_rst: bool,
    start_time_ms: i64,
}

impl TcpSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// A valid first packet for a new session carries a SYN.
    pub fn is_valid_first_packet(packet: &TcpPacket) -> bool {
        packet.flags.syn
    }

    /// Add a segment to the session.
    ///
    /// Returns false when the segment is rejected: outside the peer's
    /// receive window, below the acknowledged edge, or a duplicate of
    /// the previous data segment. Out-of-order segments are accepted
    /// and parked until the gap closes.
    pub fn add_packet(&mut self, packet: TcpPacket) -> bool {
        if self.packets.is_empty() {
            self.endpoints = Some((
                EndpointState::new(packet.src_ip, packet.src_port),
                EndpointState::new(packet.dst_ip, packet.dst_port),
            ));
            self.last_cap_sec = packet.ts_sec as i64;
            self.last_cap_msec = (packet.ts_usec / 1000) as i64;
            self.start_time_ms = (packet.ts_sec * 1000 + packet.ts_usec / 1000) as i64;
        }
        let Some((src, dst)) = self.endpoints.as_mut() else {
            return false;
        };
        let from_src = packet.src_ip == src.addr && packet.src_port == src.port;
        let (a, b) = if from_src { (src, dst) } else { (dst, src) };

        let seq = packet.seq as i64;
        // process a segment from <a> if and only if it falls inside
        // <b>'s receive window
        if a.last_byte_acked != 0 && seq - a.last_byte_acked > b.window {
            return false;
        }
        // below the acknowledged edge: lost or stale segment
        if seq < a.last_byte_acked {
            return false;
        }
        // duplicate of the previous data segment
        if seq == a.last_byte_sent && a.last_payload_len > 0 {
            return false;
        }
        // out of order: park until the gap closes
        if a.last_byte_sent != 0 && seq != a.last_byte_sent + a.last_payload_len as i64 {
            let pos = a
                .hold
                .iter()
                .position(|held| seq > held.seq as i64)
                .unwrap_or(a.hold.len());
            a.hold.insert(pos, packet);
            return true;
        }

        if packet.flags.syn {
            a.has_syn = true;
            a.syn_seq = seq;
            if a.last_byte_acked == 0 {
                // first segment from this endpoint: save its initial
                // sequence number and announced TCP options
                a.start_seq = a.syn_seq;
                a.record_options(&packet.options);
            }
        } else if packet.flags.fin {
            a.has_fin = true;
            a.fin_seq = a.fin_seq.max(seq);
        } else if packet.flags.rst {
            a.has_rst = true;
        }
        if packet.flags.ack {
            let ack = packet.ack as i64;
            b.last_byte_acked = b.last_byte_acked.max(ack);
            if b.has_syn && !a.has_ack_syn {
                a.has_ack_syn = ack == b.syn_seq + 1;
            } else if b.has_fin && !a.has_ack_fin {
                a.has_ack_fin = ack == b.fin_seq + 1;
            }
        }
        a.last_byte_sent = if packet.flags.syn || packet.flags.fin || packet.flags.rst {
            seq + 1
        } else {
            seq
        };
        a.last_payload_len = packet.payload.len();
        a.window = packet.window as i64;
        a.packet_count += 1;

        // a freshly admitted segment may close the gap in front of the
        // hold buffer; re-admit the continuation if so
        let next = if a
            .hold
            .first()
            .is_some_and(|held| seq + packet.payload.len() as i64 == held.seq as i64)
        {
            Some(a.hold.remove(0))
        } else {
            None
        };

        self.refresh_state();
        self.duration_ms = self.duration_until(packet.ts_sec as i64, packet.ts_usec as i64);
        self.packets.push(packet);

        if let Some(held) = next {
            self.add_packet(held);
        }
        true
    }

    fn refresh_state(&mut self) {
        if let Some((src, dst)) = self.endpoints.as_ref() {
            self.has_syn = src.has_ack_syn && dst.has_ack_syn;
            self.has_fin = src.has_ack_fin && dst.has_ack_fin;
            self.has_rst = src.has_rst || dst.has_rst;
        }
    }

    /// Session duration refreshed against the given capture timestamp,
    /// in milliseconds. Handles second/millisecond rollover between
    /// captures.
    pub fn duration_until(&mut self, t_sec: i64, t_usec: i64) -> i64 {
        let mut duration = self.duration_ms;
        let t_msec = t_usec / 1000;
        if t_sec > self.last_cap_sec {
            duration += (t_sec - self.last_cap_sec) * 1000;
            self.last_cap_sec = t_sec;
            if t_msec < self.last_cap_msec {
                duration -= self.last_cap_msec - t_msec;
                self.last_cap_msec = t_msec;
            }
        }
        if t_msec > self.last_cap_msec {
            duration += t_msec - self.last_cap_msec;
            self.last_cap_msec = t_msec;
        }
        duration
    }

    /// Session duration as of the last admitted segment, in milliseconds.
    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Session start time in milliseconds since the epoch.
    pub fn start_time_ms(&self) -> i64 {
        self.start_time_ms
    }

    /// Both endpoints acknowledged the other's SYN.
    pub fn has_syn(&self) -> bool {
        self.has_syn
    }

    /// Both endpoints acknowledged the other's FIN.
    pub fn has_fin(&self) -> bool {
        self.has_fin
    }

    /// Either endpoint sent a RST.
    pub fn has_rst(&self) -> bool {
        self.has_rst
    }

    /// The session has neither closed nor been reset.
    pub fn is_open(&self) -> bool {
        !(self.has_fin || self.has_rst)
    }

    /// Initiator endpoint (sender of the first packet).
    pub fn client(&self) -> Option<&EndpointState> {
        self.endpoints.as_ref().map(|(src, _)| src)
    }

    /// Responder endpoint.
    pub fn server(&self) -> Option<&EndpointState> {
        self.endpoints.as_ref().map(|(_, dst)| dst)
    }

    /// Admitted segments, in admission order.
    pub fn packets(&self) -> &[TcpPacket] {
        &self.packets
    }

    /// Payload-bearing segments, in admission order.
    pub fn payloads(&self) -> impl Iterator<Item = &TcpPacket> {
        self.packets.iter().filter(|p| !p.payload.is_empty())
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    /// An empty session carries no packets; the builder sends one as
    /// the end-of-source marker.
    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }
}

impl std::fmt::Display for TcpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.endpoints.as_ref() {
            Some((src, dst)) => write!(
                f,
                "{} --> {} [{} packets, {} msec{}{}{}]",
                src,
                dst,
                self.packets.len(),
                self.duration_ms,
                if self.has_syn { ", syn" } else { "" },
                if self.has_fin { ", fin" } else { "" },
                if self.has_rst { ", rst" } else { "" },
            ),
            None => write!(f, "<empty session>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::packet::TcpFlags;

    const CLIENT: &str = "192.168.1.10";
    const SERVER: &str = "10.0.0.25";

    fn packet(
        from_client: bool,
        seq: u64,
        ack: u64,
        flags: TcpFlags,
        payload: &[u8],
    ) -> TcpPacket {
        let (src, dst) = if from_client {
            ((CLIENT, 45000), (SERVER, 25))
        } else {
            ((SERVER, 25), (CLIENT, 45000))
        };
        TcpPacket {
            ts_sec: 100,
            ts_usec: 0,
            src_ip: src.0.parse().unwrap(),
            src_port: src.1,
            dst_ip: dst.0.parse().unwrap(),
            dst_port: dst.1,
            seq,
            ack,
            window: 65535,
            flags,
            options: vec![],
            payload: payload.to_vec(),
        }
    }

    fn syn() -> TcpFlags {
        TcpFlags { syn: true, ..Default::default() }
    }

    fn syn_ack() -> TcpFlags {
        TcpFlags { syn: true, ack: true, ..Default::default() }
    }

    fn ack() -> TcpFlags {
        TcpFlags { ack: true, ..Default::default() }
    }

    fn handshake(session: &mut TcpSession) {
        assert!(session.add_packet(packet(true, 1000, 0, syn(), b"")));
        assert!(session.add_packet(packet(false, 2000, 1001, syn_ack(), b"")));
        assert!(session.add_packet(packet(true, 1001, 2001, ack(), b"")));
    }

    #[test]
    fn test_handshake_establishes_session() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        // the server has not acked anything beyond the SYN yet
        assert!(session.client().unwrap().has_ack_syn);
        assert!(session.is_open());
        assert_eq!(session.len(), 3);
    }

    #[test]
    fn test_full_handshake_sets_syn_flag() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        // server acks client data; both sides have now acked the SYNs
        assert!(session.add_packet(packet(true, 1001, 2001, ack(), b"EHLO a\r\n")));
        assert!(session.add_packet(packet(false, 2001, 1009, ack(), b"250 ok\r\n")));
        assert!(session.has_syn());
    }

    #[test]
    fn test_out_of_order_segments_reassembled() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        assert!(session.add_packet(packet(true, 1001, 2001, ack(), b"a")));
        // segment "c" arrives before "b"
        assert!(session.add_packet(packet(true, 1003, 2001, ack(), b"c")));
        assert!(session.add_packet(packet(true, 1002, 2001, ack(), b"b")));
        let data: Vec<u8> = session
            .payloads()
            .flat_map(|p| p.payload.clone())
            .collect();
        assert_eq!(data, b"abc");
        assert_eq!(session.payloads().count(), 3);
        assert_eq!(session.client().unwrap().held(), 0);
    }

    #[test]
    fn test_duplicate_segment_rejected() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        assert!(session.add_packet(packet(true, 1001, 2001, ack(), b"hello")));
        assert!(!session.add_packet(packet(true, 1001, 2001, ack(), b"hello")));
    }

    #[test]
    fn test_stale_segment_rejected() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        assert!(session.add_packet(packet(false, 2001, 1001, ack(), b"220 mx\r\n")));
        // client acked up to 2009; a replay below that edge is dropped
        assert!(session.add_packet(packet(true, 1001, 2009, ack(), b"EHLO a\r\n")));
        assert!(!session.add_packet(packet(false, 2001, 1009, ack(), b"220 mx\r\n")));
    }

    #[test]
    fn test_segment_outside_window_rejected() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        assert!(session.add_packet(packet(false, 2001, 1001, ack(), b"220 mx\r\n")));
        // client acked: admission is now gated on the server window
        assert!(!session.add_packet(packet(true, 2_000_000, 2009, ack(), b"x")));
    }

    #[test]
    fn test_rst_closes_session() {
        let mut session = TcpSession::new();
        handshake(&mut session);
        assert!(session.is_open());
        let rst = TcpFlags { rst: true, ..Default::default() };
        assert!(session.add_packet(packet(false, 2001, 0, rst, b"")));
        assert!(!session.is_open());
        assert!(session.has_rst());
    }

    #[test]
    fn test_empty_session_is_sentinel() {
        let session = TcpSession::new();
        assert!(session.is_empty());
        assert!(session.client().is_none());
    }

    #[test]
    fn test_duration_rollover() {
        let mut session = TcpSession::new();
        let mut p = packet(true, 1000, 0, syn(), b"");
        p.ts_sec = 100;
        p.ts_usec = 900_000;
        assert!(session.add_packet(p));
        let mut p = packet(false, 2000, 1001, syn_ack(), b"");
        p.ts_sec = 101;
        p.ts_usec = 100_000;
        assert!(session.add_packet(p));
        // 100.900 -> 101.100 is 200 msec
        assert_eq!(session.duration_ms(), 200);
    }
}
