//! SMTP dialogue parser
//!
//! Walks the payload-bearing packets of a rebuilt TCP session in
//! order and classifies each one as a server response, a client
//! command or message content. Message content accumulates under a
//! DATA command until the termination sequence (CRLF "." CRLF)
//! arrives, at which point the header fields, body and termination
//! sequence are located and attached to the message.

use regex::{Captures, Regex, RegexBuilder};
use serde::Serialize;
use tracing::debug;

use crate::tcp::TcpSession;

use super::command::{SmtpCommand, SmtpCommandKind, SmtpResponse};
use super::message::{ImfFieldKind, ImfMessage};
use super::session::{SmtpError, SmtpSession};

/// Server response: code, separator run, text.
const RES_PATTERN: &str = r"^(\d{3})(\t| |-)+(.*)\r\n$";

/// Client command line. The capture group layout is what
/// [`command_kind`] indexes into.
const CMD_PATTERN: &str = r"^(?:\t| )*(((helo|ehlo)|(help)|(vrfy)|(expn)|(noop)|(((mail(?:\t| )+from)|(rcpt(?:\t| )+to))(?:\t| )*:))((?:\t| )*.*)|(quit)|(rset)|(data)(?:.*)|(starttls)|(auth(?:\t| )*login))(?:\t| )*\r\n$";

/// Everything up to the first empty (or ".") line is the header.
const HEADER_PATTERN: &str = r"(.*?\r\n)((\r\n)|(\.\r\n))";

/// One header field name followed by a colon. The capture group
/// layout is what [`field_kind`] indexes into.
const HEADER_FIELD_PATTERN: &str = r"[^\r\n]*(((return-path)|(received)|(resent-date)|(resent-from)|(resent-sender)|(resent-to)|(resent-cc)|(resent-bcc)|(resent-message-id)|(date)|(from)|(sender)|(reply-to)|(to)|(cc)|(bcc)|(message-id)|(in-reply-to)|(references)|(subject)|(comments)|(keywords)|(mime-version)|(content-type)|(content-transfer-encoding)|(content-id)|(content-description)|(x-[^\r\n:]+))\s*:)+?";

/// End-of-message marker: CRLF "." CRLF, tolerating repeated CRLF.
const TERM_SEQ_PATTERN: &str = r"(\r\n\.(\r\n)+)";

/// Command regex groups 3..=17, in the order they appear; groups that
/// only exist for grouping carry no kind.
const CMD_KINDS: [(usize, SmtpCommandKind); 12] = [
    (3, SmtpCommandKind::Helo),
    (4, SmtpCommandKind::Help),
    (5, SmtpCommandKind::Vrfy),
    (6, SmtpCommandKind::Expn),
    (7, SmtpCommandKind::Noop),
    (10, SmtpCommandKind::Mail),
    (11, SmtpCommandKind::Rcpt),
    (13, SmtpCommandKind::Quit),
    (14, SmtpCommandKind::Rset),
    (15, SmtpCommandKind::Data),
    (16, SmtpCommandKind::Extension),
    (17, SmtpCommandKind::Extension),
];

/// Header field regex groups 3..=30, one per recognized field name.
const FIELD_KINDS: [ImfFieldKind; 28] = [
    ImfFieldKind::ReturnPath,
    ImfFieldKind::Received,
    ImfFieldKind::ResentDate,
    ImfFieldKind::ResentFrom,
    ImfFieldKind::ResentSender,
    ImfFieldKind::ResentTo,
    ImfFieldKind::ResentCc,
    ImfFieldKind::ResentBcc,
    ImfFieldKind::ResentMessageId,
    ImfFieldKind::Date,
    ImfFieldKind::From,
    ImfFieldKind::Sender,
    ImfFieldKind::ReplyTo,
    ImfFieldKind::To,
    ImfFieldKind::Cc,
    ImfFieldKind::Bcc,
    ImfFieldKind::MessageId,
    ImfFieldKind::InReplyTo,
    ImfFieldKind::References,
    ImfFieldKind::Subject,
    ImfFieldKind::Comments,
    ImfFieldKind::Keywords,
    ImfFieldKind::MimeVersion,
    ImfFieldKind::ContentType,
    ImfFieldKind::ContentTransferEncoding,
    ImfFieldKind::ContentId,
    ImfFieldKind::ContentDescription,
    ImfFieldKind::XField,
];

fn command_kind(caps: &Captures) -> Option<SmtpCommandKind> {
    CMD_KINDS
        .iter()
        .find(|(group, _)| caps.get(*group).is_some())
        .map(|(_, kind)| *kind)
}

fn field_kind(caps: &Captures) -> Option<ImfFieldKind> {
    (0..FIELD_KINDS.len())
        .find(|i| caps.get(i + 3).is_some())
        .map(|i| FIELD_KINDS[i])
}

/// Running totals over everything a parser instance has seen.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct ParserStats {
    pub smtp_packets: u64,
    pub smtp_sessions: u64,
    pub tcp_packets: u64,
    pub tcp_sessions: u64,
}

pub struct SmtpParser {
    /// When false, each payload fragment of a message becomes its own
    /// message object instead of one reassembled message.
    reassemble: bool,
    res_re: Regex,
    cmd_re: Regex,
    header_re: Regex,
    header_field_re: Regex,
    term_seq_re: Regex,
    stats: ParserStats,
}

impl SmtpParser {
    pub fn new(reassemble: bool) -> Self {
        Self {
            reassemble,
            res_re: RegexBuilder::new(RES_PATTERN)
                .dot_matches_new_line(true)
                .build()
                .unwrap(),
            cmd_re: RegexBuilder::new(CMD_PATTERN)
                .case_insensitive(true)
                .build()
                .unwrap(),
            header_re: RegexBuilder::new(HEADER_PATTERN)
                .dot_matches_new_line(true)
                .build()
                .unwrap(),
            header_field_re: RegexBuilder::new(HEADER_FIELD_PATTERN)
                .case_insensitive(true)
                .dot_matches_new_line(true)
                .build()
                .unwrap(),
            term_seq_re: Regex::new(TERM_SEQ_PATTERN).unwrap(),
            stats: ParserStats::default(),
        }
    }

    pub fn stats(&self) -> ParserStats {
        self.stats
    }

    /// Extract the SMTP conversation carried by the session. Returns
    /// `None` when no statement at all could be recognized.
    pub fn parse(&mut self, tcp: &TcpSession) -> Result<Option<SmtpSession>, SmtpError> {
        let mut session = SmtpSession::from_tcp(tcp)?;
        let mut last_cmd: Option<SmtpCommandKind> = None;
        // accumulated message text across fragments
        let mut accumulated: Option<String> = None;
        // the reassembled message under construction
        let mut message: Option<ImfMessage> = None;
        // command-list indices of this message's fragments
        let mut msg_indices: Vec<usize> = Vec::new();
        // offset in the accumulated text where each fragment begins
        let mut fragments: Vec<usize> = Vec::new();

        for packet in tcp.payloads() {
            let text = packet.payload_str();
            let mut is_response = false;
            let mut is_command = false;

            if let Some(caps) = self.res_re.captures(&text) {
                let code: u16 = caps[1].parse().unwrap_or(0);
                session.add_response(SmtpResponse::new(code, &caps[3]));
                is_response = true;
            }
            if !is_response {
                if let Some(caps) = self.cmd_re.captures(&text) {
                    if let Some(kind) = command_kind(&caps) {
                        session.add_command(SmtpCommand::new(kind, text.as_str()))?;
                        last_cmd = Some(kind);
                        is_command = true;
                    }
                }
            }

            if !is_response && !is_command && last_cmd == Some(SmtpCommandKind::Data) {
                let acc = accumulated.get_or_insert_with(String::new);
                let frag_start = acc.len();
                fragments.push(frag_start);
                if message.is_none() {
                    message = Some(ImfMessage::new(frag_start));
                }
                if !self.reassemble {
                    if let Some(mut frag) = message.take() {
                        frag.set_text(text.as_str());
                        session.add_message(frag)?;
                        msg_indices.push(session.commands().len() - 1);
                    }
                }
                acc.push_str(&text);

                let term_len = self
                    .term_seq_re
                    .captures(&text)
                    .and_then(|c| c.get(1).map(|g| g.as_str().len()));
                if let Some(term_len) = term_len {
                    let message_str = std::mem::take(acc);
                    if self.reassemble {
                        if let Some(mut msg) = message.take() {
                            msg.set_text(message_str.as_str());
                            session.add_message(msg)?;
                            msg_indices.push(session.commands().len() - 1);
                        }
                    }
                    let term_seq_start = message_str.len() - term_len;
                    self.extract_statements(
                        &mut session,
                        &msg_indices,
                        &fragments,
                        &message_str,
                        term_seq_start,
                    );
                    accumulated = None;
                    message = None;
                    msg_indices.clear();
                    fragments.clear();
                }
            } else {
                accumulated = None;
                message = None;
                msg_indices.clear();
                fragments.clear();
            }
            self.stats.smtp_packets += 1;
        }

        self.stats.tcp_packets += tcp.len() as u64;
        self.stats.tcp_sessions += 1;
        if session.is_empty() {
            return Ok(None);
        }
        self.stats.smtp_sessions += 1;
        debug!(session = %session, "rebuilt SMTP session");
        Ok(Some(session))
    }

    /// Locate the header fields, body and termination sequence of a
    /// completed message and attach each span to the fragment able to
    /// hold it.
    fn extract_statements(
        &self,
        session: &mut SmtpSession,
        msg_indices: &[usize],
        fragments: &[usize],
        message_str: &str,
        term_seq_start: usize,
    ) {
        let mut header = "";
        let mut header_end = 0usize;
        if let Some(caps) = self.header_re.captures(message_str) {
            if let Some(g) = caps.get(1) {
                header = g.as_str();
                header_end = g.end() + 2;
            }
        }

        let mut start_field = 0usize;
        let mut next_i = 0usize;
        let mut last_kind: Option<ImfFieldKind> = None;
        while let Some(caps) = self.header_field_re.captures_at(header, next_i) {
            let Some(g) = caps.get(1) else { break };
            let end_field = g.start();
            if end_field > 0 {
                if let Some(msg) = fragment_holding(session, msg_indices, fragments, start_field) {
                    msg.add_statement(last_kind, start_field, end_field);
                }
            }
            start_field = g.start();
            next_i = g.end();
            last_kind = field_kind(&caps);
        }
        if let Some(msg) = fragment_holding(session, msg_indices, fragments, start_field) {
            msg.add_statement(last_kind, start_field, header.len());
        }

        if let Some(msg) = fragment_holding(session, msg_indices, fragments, header_end) {
            msg.add_statement(Some(ImfFieldKind::Body), header_end, term_seq_start);
        }
        if let Some(msg) = fragment_holding(session, msg_indices, fragments, term_seq_start) {
            msg.add_statement(Some(ImfFieldKind::TermSeq), term_seq_start, message_str.len());
        }
    }
}

/// The latest fragment starting at or before the statement. Marks the
/// fragment boundary on the message the first time a statement lands
/// in it.
fn fragment_holding<'a>(
    session: &'a mut SmtpSession,
    msg_indices: &[usize],
    fragments: &[usize],
    stmt_index: usize,
) -> Option<&'a mut ImfMessage> {
    for i in (0..fragments.len()).rev() {
        if i < msg_indices.len() && stmt_index >= fragments[i] {
            let msg = session.message_at_mut(msg_indices[i])?;
            let count = msg.statement_count();
            if !msg.fragments().contains(&count) {
                msg.set_fragment(i, count);
            }
            return Some(msg);
        }
    }
    None
}
