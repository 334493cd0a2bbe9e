//! TCP session table
//!
//! Routes captured segments to their sessions and decides when a
//! session is finished. Sessions start in a pending table until their
//! three-way handshake completes; the pending table is bounded and
//! evicts in FIFO order. Established sessions are swept on every
//! processed packet and emitted once closed, reset or idle past an
//! adaptive maximum duration learned from normally-closed sessions.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use tracing::{debug, trace};

use crate::config::TcpConfig;
use crate::core::key::ConnectionKey;
use crate::core::packet::TcpPacket;
use crate::engine::report::DiscardCounters;

use super::session::TcpSession;

/// Builder counters reported at end of run.
#[derive(Debug, Clone, Default)]
pub struct BuilderStats {
    /// Packets admitted into a session
    pub tcp_packets: u64,
    /// Sessions emitted to the consumer
    pub tcp_sessions: u64,
    pub discarded: DiscardCounters,
    /// Sessions initiated per source address
    pub sessions_per_source: HashMap<IpAddr, u64>,
}

impl BuilderStats {
    /// Merge the counters of another builder, used when each capture
    /// file gets its own session table.
    pub fn absorb(&mut self, other: &BuilderStats) {
        self.tcp_packets += other.tcp_packets;
        self.tcp_sessions += other.tcp_sessions;
        self.discarded.absorb(&other.discarded);
        for (addr, count) in &other.sessions_per_source {
            *self.sessions_per_source.entry(*addr).or_insert(0) += count;
        }
    }
}

/// Rebuilds TCP sessions from a stream of decoded segments.
pub struct SessionBuilder {
    config: TcpConfig,
    /// Established sessions (handshake complete)
    working: HashMap<ConnectionKey, TcpSession>,
    /// Sessions still waiting for their handshake, FIFO-bounded
    pending: HashMap<ConnectionKey, TcpSession>,
    pending_order: VecDeque<ConnectionKey>,
    /// EWMA of the duration of normally-closed sessions
    mean_duration: f64,
    /// EWMA of the mean absolute deviation of that duration
    dev_duration: f64,
    /// Current session duration cutoff, in milliseconds
    max_duration: f64,
    stats: BuilderStats,
}

impl SessionBuilder {
    pub fn new(config: TcpConfig) -> Self {
        let max_duration = config.initial_max_duration_ms as f64;
        Self {
            config,
            working: HashMap::with_capacity(1000),
            pending: HashMap::new(),
            pending_order: VecDeque::new(),
            mean_duration: 0.0,
            dev_duration: 0.0,
            max_duration,
            stats: BuilderStats::default(),
        }
    }

    /// Route one segment and sweep the established-session table.
    /// Returns the sessions finished by this step, in emission order.
    pub fn add_packet(&mut self, packet: TcpPacket) -> Vec<TcpSession> {
        let key = ConnectionKey::from_packet(&packet);
        let ts = (packet.ts_sec as i64, packet.ts_usec as i64);

        if let Some(session) = self.working.get_mut(&key) {
            if !session.add_packet(packet) {
                trace!(%key, "rejected segment on established session");
                self.stats.discarded.retransmitted += 1;
                self.stats.discarded.total += 1;
            }
        } else if let Some(session) = self.pending.get_mut(&key) {
            if !session.add_packet(packet) {
                trace!(%key, "rejected segment on pending session");
                self.stats.discarded.retransmitted += 1;
                self.stats.discarded.total += 1;
            }
            // handshake complete: promote to the established table
            if session.has_syn() {
                if let Some(session) = self.pending.remove(&key) {
                    self.pending_order.retain(|k| k != &key);
                    self.working.insert(key, session);
                }
            }
        } else if TcpSession::is_valid_first_packet(&packet) {
            if self.pending_order.len() == self.config.max_pending {
                if let Some(evicted) = self.pending_order.pop_front() {
                    debug!(key = %evicted, "evicting oldest pending session");
                    self.pending.remove(&evicted);
                    self.stats.discarded.evicted_pending += 1;
                }
            }
            let source = packet.src_ip;
            let mut session = TcpSession::new();
            session.add_packet(packet);
            self.pending.insert(key, session);
            self.pending_order.push_back(key);
            *self.stats.sessions_per_source.entry(source).or_insert(0) += 1;
        } else {
            // no session wants it and it cannot start one
            self.stats.discarded.total += 1;
            if packet.flags.syn {
                self.stats.discarded.syn += 1;
            } else if packet.flags.fin {
                self.stats.discarded.fin += 1;
            } else if packet.flags.rst {
                self.stats.discarded.rst += 1;
            } else {
                self.stats.discarded.other += 1;
            }
        }

        let emitted = self.sweep(ts.0, ts.1);
        self.stats.tcp_packets += 1;
        emitted
    }

    /// Emit every established session that has closed, been reset or
    /// outlived the adaptive cutoff as of the given capture timestamp.
    fn sweep(&mut self, t_sec: i64, t_usec: i64) -> Vec<TcpSession> {
        let mut expired = Vec::new();
        for (key, session) in self.working.iter_mut() {
            let duration = session.duration_until(t_sec, t_usec);
            if !session.is_open() || duration as f64 > self.max_duration {
                expired.push(*key);
            }
        }
        let mut emitted = Vec::with_capacity(expired.len());
        for key in expired {
            if let Some(session) = self.working.remove(&key) {
                debug!(session = %session, "session finished");
                self.stats.tcp_sessions += 1;
                if !session.is_open() {
                    self.learn_duration(session.duration_ms() as f64);
                }
                emitted.push(session);
            }
        }
        emitted
    }

    /// Fold a normally-closed session duration into the EWMA estimators
    /// and recompute the cutoff.
    fn learn_duration(&mut self, duration: f64) {
        let alpha = self.config.alpha;
        let beta = self.config.beta;
        self.mean_duration = (1.0 - alpha) * self.mean_duration + alpha * duration;
        self.dev_duration =
            (1.0 - beta) * self.dev_duration + beta * (duration - self.mean_duration).abs();
        self.max_duration = self.mean_duration + self.config.dev_multiplier * self.dev_duration;
        self.max_duration = self.max_duration.max(self.config.min_duration_ms as f64);
    }

    /// Flush every established session at end of input.
    pub fn finish(&mut self) -> Vec<TcpSession> {
        let mut remaining: Vec<TcpSession> = self.working.drain().map(|(_, s)| s).collect();
        remaining.sort_by_key(|s| s.start_time_ms());
        self.stats.tcp_sessions += remaining.len() as u64;
        self.pending.clear();
        self.pending_order.clear();
        remaining
    }

    pub fn stats(&self) -> &BuilderStats {
        &self.stats
    }

    /// Current adaptive duration cutoff, in milliseconds.
    pub fn max_duration_ms(&self) -> f64 {
        self.max_duration
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn working_len(&self) -> usize {
        self.working.len()
    }
}
