//! Matching sessions against the signature set

use std::collections::BTreeMap;
use std::net::IpAddr;

use serde::Serialize;
use tracing::debug;

use crate::smtp::SmtpSession;

use super::model::Signature;

/// A session together with the names of every signature it matched.
#[derive(Debug, Clone, Serialize)]
pub struct MatchingSession {
    pub session: SmtpSession,
    pub signatures: Vec<String>,
}

/// Matching activity of one client address, aggregated over a run.
#[derive(Debug, Clone, Serialize)]
pub struct MatchedClient {
    pub client: IpAddr,
    pub sessions: u64,
    /// Signature name to number of sessions it matched.
    pub matches: BTreeMap<String, u64>,
}

/// Holds the compiled signature set and matches sessions against it.
#[derive(Debug, Default)]
pub struct SignatureMatcher {
    signatures: Vec<Signature>,
}

impl SignatureMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_signatures(signatures: Vec<Signature>) -> Self {
        let mut matcher = Self::new();
        for sig in signatures {
            matcher.add_signature(sig);
        }
        matcher
    }

    /// Add a signature at runtime. Empty signatures are ignored.
    pub fn add_signature(&mut self, signature: Signature) {
        if !signature.is_empty() {
            debug!(name = signature.name(), "signature added to matcher");
            self.signatures.push(signature);
        }
    }

    pub fn signatures(&self) -> &[Signature] {
        &self.signatures
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }

    /// The session plus every signature it matches, None when nothing
    /// matches.
    pub fn matching_session(&self, session: &SmtpSession) -> Option<MatchingSession> {
        let matched: Vec<String> = self
            .signatures
            .iter()
            .filter(|sig| sig.matches(session))
            .map(|sig| sig.name().to_string())
            .collect();
        if matched.is_empty() {
            return None;
        }
        Some(MatchingSession { session: session.clone(), signatures: matched })
    }

    /// Group matching sessions by client address with per-signature
    /// counts.
    pub fn matched_clients<'a, I>(&self, sessions: I) -> Vec<MatchedClient>
    where
        I: IntoIterator<Item = &'a SmtpSession>,
    {
        let mut by_client: BTreeMap<IpAddr, MatchedClient> = BTreeMap::new();
        for session in sessions {
            let Some(matching) = self.matching_session(session) else {
                continue;
            };
            let (addr, _) = session.client();
            let entry = by_client.entry(addr).or_insert_with(|| MatchedClient {
                client: addr,
                sessions: 0,
                matches: BTreeMap::new(),
            });
            entry.sessions += 1;
            for name in matching.signatures {
                *entry.matches.entry(name).or_insert(0) += 1;
            }
        }
        by_client.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::{SmtpCommand, SmtpCommandKind};

    fn session(client: &str, helo: &str) -> SmtpSession {
        let mut s = SmtpSession::new(
            (client.parse().unwrap(), 45000),
            ("10.0.0.25".parse().unwrap(), 25),
            (true, true, false),
            0,
        );
        s.add_command(SmtpCommand::new(SmtpCommandKind::Helo, helo)).unwrap();
        s
    }

    fn named_sig(name: &str, pattern: &str) -> Signature {
        let mut sig = Signature::new(name);
        sig.add_statement(pattern, vec![], false, false).unwrap();
        sig
    }

    #[test]
    fn test_matching_session_collects_all_names() {
        let matcher = SignatureMatcher::from_signatures(vec![
            named_sig("helo-any", "HELO"),
            named_sig("helo-bot", "HELO bot"),
            named_sig("quit", "QUIT"),
        ]);
        let m = matcher.matching_session(&session("192.168.1.10", "HELO bot\r\n")).unwrap();
        assert_eq!(m.signatures, vec!["helo-any", "helo-bot"]);
        assert!(matcher.matching_session(&session("192.168.1.10", "NOOP\r\n")).is_none());
    }

    #[test]
    fn test_empty_signature_not_added() {
        let mut matcher = SignatureMatcher::new();
        matcher.add_signature(Signature::new("empty"));
        assert!(matcher.is_empty());
    }

    #[test]
    fn test_matched_clients_grouped_by_address() {
        let matcher = SignatureMatcher::from_signatures(vec![named_sig("helo-bot", "HELO bot")]);
        let sessions = vec![
            session("192.168.1.10", "HELO bot\r\n"),
            session("192.168.1.10", "HELO bot\r\n"),
            session("192.168.1.99", "HELO bot\r\n"),
            session("192.168.1.50", "HELO other\r\n"),
        ];
        let clients = matcher.matched_clients(sessions.iter());
        assert_eq!(clients.len(), 2);
        let first = clients.iter().find(|c| c.client == "192.168.1.10".parse::<IpAddr>().unwrap()).unwrap();
        assert_eq!(first.sessions, 2);
        assert_eq!(first.matches["helo-bot"], 2);
    }
}
