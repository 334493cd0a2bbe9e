//! Signature model and block-backtracking matcher

use std::collections::HashMap;

use regex::{Regex, RegexBuilder};

use crate::smtp::SmtpSession;

use super::compiler::SignatureError;

/// TCP handshake event a signature can require.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpEvent {
    Open,
    Close,
    Reset,
}

/// Binds a capture group of a statement pattern to a variable slot.
/// Every group bound to the same slot must capture identical text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    pub group: usize,
    pub slot: usize,
}

/// One pattern of a signature.
#[derive(Debug, Clone)]
pub struct SignatureStatement {
    pattern: Regex,
    raw: String,
    links: Vec<Link>,
    /// Must match the session statement right after the previous one.
    grouped: bool,
    /// Must belong to the same mail transaction as the previous one.
    same_transaction: bool,
}

impl SignatureStatement {
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_grouped(&self) -> bool {
        self.grouped
    }

    pub fn same_transaction(&self) -> bool {
        self.same_transaction
    }

    pub fn links(&self) -> &[Link] {
        &self.links
    }
}

/// A compiled bot signature.
#[derive(Debug, Clone, Default)]
pub struct Signature {
    name: String,
    statements: Vec<SignatureStatement>,
    check_tcp_flags: bool,
    has_syn: bool,
    has_fin: bool,
    has_rst: bool,
    strict_order: bool,
}

impl Signature {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into(), ..Default::default() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn statements(&self) -> &[SignatureStatement] {
        &self.statements
    }

    pub fn strict_order(&self) -> bool {
        self.strict_order
    }

    /// Whether this signature constrains the TCP handshake flags.
    pub fn checks_tcp_flags(&self) -> bool {
        self.check_tcp_flags
    }

    pub fn requires_syn(&self) -> bool {
        self.has_syn
    }

    pub fn requires_fin(&self) -> bool {
        self.has_fin
    }

    pub fn requires_rst(&self) -> bool {
        self.has_rst
    }

    pub fn set_strict_order(&mut self, strict: bool) {
        self.strict_order = strict;
    }

    /// Require the given TCP handshake event. `Close` implies a
    /// correct open as well.
    pub fn require_tcp(&mut self, event: TcpEvent) {
        self.check_tcp_flags = true;
        match event {
            TcpEvent::Open => self.has_syn = true,
            TcpEvent::Close => {
                self.has_syn = true;
                self.has_fin = true;
            }
            TcpEvent::Reset => self.has_rst = true,
        }
    }

    /// Compile and append a statement pattern. Patterns match across
    /// line boundaries.
    pub fn add_statement(
        &mut self,
        pattern: &str,
        links: Vec<Link>,
        grouped: bool,
        same_transaction: bool,
    ) -> Result<(), SignatureError> {
        let compiled = RegexBuilder::new(pattern)
            .dot_matches_new_line(true)
            .build()
            .map_err(|e| SignatureError::Invalid {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        self.statements.push(SignatureStatement {
            pattern: compiled,
            raw: pattern.to_string(),
            links,
            grouped,
            same_transaction,
        });
        Ok(())
    }

    /// Match the signature against a rebuilt SMTP session.
    ///
    /// Statements are placed onto the session's client statements with
    /// forward-only cursors. A block is a maximal run of statements
    /// where each follower is grouped or transaction-bound; when a
    /// block fails partway it is retried with its anchor advanced by
    /// one. Variable slots must capture the same text everywhere; a
    /// conflicting capture fails the whole signature.
    pub fn matches(&self, session: &SmtpSession) -> bool {
        if session.is_empty() {
            return false;
        }
        if self.check_tcp_flags
            && !(session.tcp_has_syn() == self.has_syn
                && session.tcp_has_fin() == self.has_fin
                && session.tcp_has_rst() == self.has_rst)
        {
            return false;
        }
        let msgs = session.commands();
        if msgs.is_empty() {
            return false;
        }
        let total = self.statements.len();
        let msg_count = msgs.len() as i64;
        let mut bindings: HashMap<usize, String> = HashMap::new();
        let mut eof = false;
        let mut k = 0usize;
        let mut l = 0usize;
        let mut m: i64 = -1;
        let mut n: i64 = -1;
        while k < total && !eof {
            // extend the block over grouped/transaction-bound followers
            let bs = k;
            let mut be = k;
            while be < total - 1
                && (self.statements[be + 1].grouped || self.statements[be + 1].same_transaction)
            {
                be += 1;
            }
            while l <= be && !eof {
                let stmt = &self.statements[l];
                let mut i = n + 1;
                let j = if stmt.grouped { i + 1 } else { msg_count };
                let mut matched = false;
                if j <= msg_count {
                    while i < j && !matched {
                        let idx = i as usize;
                        if stmt.same_transaction {
                            let prev = idx
                                .checked_sub(1)
                                .and_then(|p| session.transaction_of_command(p));
                            let cur = session.transaction_of_command(idx);
                            if !transactions_match(prev, cur) {
                                break;
                            }
                        }
                        if let Some(caps) = stmt.pattern.captures(msgs[idx].text()) {
                            if stmt.links.is_empty() {
                                matched = true;
                            } else {
                                for link in &stmt.links {
                                    let Some(group) = caps.get(link.group) else {
                                        continue;
                                    };
                                    let value = group.as_str();
                                    match bindings.get(&link.slot) {
                                        Some(bound) if bound != value => return false,
                                        Some(_) => {}
                                        None => {
                                            bindings.insert(link.slot, value.to_string());
                                        }
                                    }
                                    matched = true;
                                }
                            }
                        }
                        i += 1;
                    }
                }
                if matched {
                    // placed, move to the next statement
                    n = i - 1;
                    l += 1;
                } else if bs < be {
                    // block failed partway, retry it one position later
                    l = k;
                    m += 1;
                    n = m;
                } else {
                    return false;
                }
                eof = n >= msg_count - 1;
            }
            m = n;
            k = l;
        }
        k == total
    }
}

/// Statements not associated with any transaction are compatible with
/// every transaction.
fn transactions_match(a: Option<usize>, b: Option<usize>) -> bool {
    match (a, b) {
        (Some(x), Some(y)) => x == y,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::smtp::command::{SmtpCommand, SmtpCommandKind};
    use crate::smtp::SmtpResponse;

    fn session(lines: &[(SmtpCommandKind, &str)]) -> SmtpSession {
        let mut s = SmtpSession::new(
            ("192.168.1.10".parse().unwrap(), 45000),
            ("10.0.0.25".parse().unwrap(), 25),
            (true, true, false),
            0,
        );
        for (kind, raw) in lines {
            s.add_command(SmtpCommand::new(*kind, *raw)).unwrap();
        }
        s
    }

    fn sig(patterns: &[(&str, bool)]) -> Signature {
        let mut sig = Signature::new("test");
        for (pattern, grouped) in patterns {
            sig.add_statement(pattern, vec![], *grouped, false).unwrap();
        }
        sig
    }

    const HELO: (SmtpCommandKind, &str) = (SmtpCommandKind::Helo, "HELO bot\r\n");
    const MAIL: (SmtpCommandKind, &str) = (SmtpCommandKind::Mail, "MAIL FROM:<a@b>\r\n");
    const QUIT: (SmtpCommandKind, &str) = (SmtpCommandKind::Quit, "QUIT\r\n");

    #[test]
    fn test_ordered_statements_match() {
        let s = session(&[HELO, MAIL, QUIT]);
        assert!(sig(&[("(?i)helo", false), ("(?i)quit", false)]).matches(&s));
    }

    #[test]
    fn test_out_of_order_statements_do_not_match() {
        let s = session(&[HELO, MAIL, QUIT]);
        assert!(!sig(&[("(?i)quit", false), ("(?i)helo", false)]).matches(&s));
    }

    #[test]
    fn test_grouped_statement_requires_adjacency() {
        // HELO, QUIT, MAIL: MAIL does not directly follow HELO
        let s = session(&[HELO, QUIT, MAIL]);
        assert!(!sig(&[("(?i)helo", false), ("(?i)mail", true)]).matches(&s));
        let s = session(&[HELO, MAIL, QUIT]);
        assert!(sig(&[("(?i)helo", false), ("(?i)mail", true)]).matches(&s));
    }

    #[test]
    fn test_block_retries_after_partial_match() {
        // first HELO is not followed by MAIL, the second one is
        let s = session(&[HELO, QUIT, HELO, MAIL]);
        assert!(sig(&[("(?i)helo", false), ("(?i)mail", true)]).matches(&s));
    }

    #[test]
    fn test_tcp_preconditions_exact() {
        let s = session(&[HELO]); // syn + fin, no rst
        let mut open_only = sig(&[("(?i)helo", false)]);
        open_only.require_tcp(TcpEvent::Open);
        // the session also closed, flags are not an exact match
        assert!(!open_only.matches(&s));
        let mut closed = sig(&[("(?i)helo", false)]);
        closed.require_tcp(TcpEvent::Close);
        assert!(closed.matches(&s));
        let mut reset = sig(&[("(?i)helo", false)]);
        reset.require_tcp(TcpEvent::Reset);
        assert!(!reset.matches(&s));
    }

    #[test]
    fn test_variable_link_requires_equal_captures() {
        let mut s = session(&[]);
        s.add_command(SmtpCommand::new(SmtpCommandKind::Helo, "HELO 10.0.0.1\r\n")).unwrap();
        s.add_command(SmtpCommand::new(
            SmtpCommandKind::Mail,
            "MAIL FROM:<x@10.0.0.1>\r\n",
        ))
        .unwrap();
        let mut sig = Signature::new("linked");
        let ip = r"(\d+\.\d+\.\d+\.\d+)";
        sig.add_statement(&format!("HELO {ip}"), vec![Link { group: 1, slot: 0 }], false, false)
            .unwrap();
        sig.add_statement(&format!("MAIL FROM:<x@{ip}>"), vec![Link { group: 1, slot: 0 }], false, false)
            .unwrap();
        assert!(sig.matches(&s));

        let mut other = session(&[]);
        other
            .add_command(SmtpCommand::new(SmtpCommandKind::Helo, "HELO 10.0.0.1\r\n"))
            .unwrap();
        other
            .add_command(SmtpCommand::new(
                SmtpCommandKind::Mail,
                "MAIL FROM:<x@10.9.9.9>\r\n",
            ))
            .unwrap();
        assert!(!sig.matches(&other));
    }

    #[test]
    fn test_same_transaction_constraint() {
        let mut s = session(&[]);
        s.add_command(SmtpCommand::new(SmtpCommandKind::Mail, "MAIL FROM:<a@b>\r\n")).unwrap();
        s.add_command(SmtpCommand::new(SmtpCommandKind::Rcpt, "RCPT TO:<c@d>\r\n")).unwrap();
        s.add_command(SmtpCommand::new(SmtpCommandKind::Rset, "RSET\r\n")).unwrap();
        s.add_response(SmtpResponse::new(250, "ok"));
        // MAIL..RSET forms one transaction covering all three commands
        let mut sig = Signature::new("trans");
        sig.add_statement("MAIL", vec![], false, false).unwrap();
        sig.add_statement("RCPT", vec![], false, true).unwrap();
        assert!(sig.matches(&s));
    }

    #[test]
    fn test_empty_session_never_matches() {
        let s = session(&[]);
        assert!(!sig(&[(".*", false)]).matches(&s));
    }

    #[test]
    fn test_invalid_pattern_rejected() {
        let mut sig = Signature::new("bad");
        assert!(sig.add_statement("(", vec![], false, false).is_err());
    }
}
