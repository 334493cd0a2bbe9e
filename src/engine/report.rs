//! End-of-run accounting
//!
//! Counters accumulated across the capture, reassembly and matching
//! stages, collected into a single report once every source has been
//! drained.

use serde::Serialize;

/// Segments and frames dropped before reaching a session, broken down
/// by the reason they were rejected.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DiscardCounters {
    pub total: u64,
    /// SYN packets that could not open or join a session
    pub syn: u64,
    /// FIN packets outside any session window
    pub fin: u64,
    /// RST packets outside any session window
    pub rst: u64,
    /// Plain data or ACK packets with no session to join
    pub other: u64,
    /// Segments already present in their session
    pub retransmitted: u64,
    /// Half-open sessions evicted from the bounded pending table
    pub evicted_pending: u64,
    /// Frames the capture stage could not decode down to TCP
    pub malformed: u64,
}

impl DiscardCounters {
    pub fn absorb(&mut self, other: &DiscardCounters) {
        self.total += other.total;
        self.syn += other.syn;
        self.fin += other.fin;
        self.rst += other.rst;
        self.other += other.other;
        self.retransmitted += other.retransmitted;
        self.evicted_pending += other.evicted_pending;
        self.malformed += other.malformed;
    }
}

/// Totals for a complete run, printed and optionally written alongside
/// the matched sessions.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct RunReport {
    /// Segments admitted into a TCP session
    pub tcp_packets: u64,
    /// TCP sessions reassembled
    pub tcp_sessions: u64,
    /// Non-empty payloads parsed as SMTP traffic
    pub smtp_packets: u64,
    /// TCP sessions that yielded an SMTP dialogue
    pub smtp_sessions: u64,
    /// Dialogues matched by at least one signature
    pub matched_sessions: u64,
    pub discarded: DiscardCounters,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absorb_sums_every_counter() {
        let mut a = DiscardCounters {
            total: 3,
            syn: 1,
            other: 2,
            ..Default::default()
        };
        let b = DiscardCounters {
            total: 5,
            retransmitted: 4,
            malformed: 1,
            ..Default::default()
        };
        a.absorb(&b);
        assert_eq!(a.total, 8);
        assert_eq!(a.syn, 1);
        assert_eq!(a.other, 2);
        assert_eq!(a.retransmitted, 4);
        assert_eq!(a.malformed, 1);
    }
}
