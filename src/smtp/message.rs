//! Internet Message Format (RFC 5322) content model
//!
//! A message carries the text accumulated under a DATA command plus
//! typed spans located inside it: header fields, the body and the
//! termination sequence. Concatenating spans need not reproduce the
//! payload; spans may overlap fragment boundaries.

use serde::{Deserialize, Serialize};

/// Typed spans extracted from message content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImfFieldKind {
    ReturnPath,
    Received,
    ResentDate,
    ResentFrom,
    ResentSender,
    ResentTo,
    ResentCc,
    ResentBcc,
    ResentMessageId,
    Date,
    From,
    Sender,
    ReplyTo,
    To,
    Cc,
    Bcc,
    MessageId,
    InReplyTo,
    References,
    Subject,
    Comments,
    Keywords,
    MimeVersion,
    ContentType,
    ContentTransferEncoding,
    ContentId,
    ContentDescription,
    /// Any `X-` extension header
    XField,
    Body,
    TermSeq,
}

/// A typed span inside a message, as byte offsets into its text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImfStatement {
    pub kind: Option<ImfFieldKind>,
    pub start: usize,
    pub end: usize,
}

/// Message content sent under a DATA command.
///
/// With reassembly on, one message holds the whole accumulated text;
/// with reassembly off, each payload fragment becomes its own message.
/// `start_offset` records where this message begins in the accumulated
/// text so spans can be rebased onto it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImfMessage {
    text: String,
    start_offset: usize,
    statements: Vec<ImfStatement>,
    /// Statement indices at which a new payload fragment begins
    fragments: Vec<usize>,
}

impl ImfMessage {
    pub fn new(start_offset: usize) -> Self {
        Self { start_offset, ..Default::default() }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn set_text(&mut self, text: impl Into<String>) {
        self.text = text.into();
        // drop any fragment marker now out of bounds
        let len = self.text.len();
        self.fragments.retain(|&f| f < len);
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn start_offset(&self) -> usize {
        self.start_offset
    }

    /// Record a typed span given in accumulated-text offsets. The span
    /// is rebased onto this message and dropped if it falls outside it.
    pub fn add_statement(&mut self, kind: Option<ImfFieldKind>, start: usize, end: usize) {
        let Some(start) = start.checked_sub(self.start_offset) else {
            return;
        };
        let Some(end) = end.checked_sub(self.start_offset) else {
            return;
        };
        if end > start {
            self.statements.push(ImfStatement { kind, start, end });
        }
    }

    /// Mark that the fragment with the given index starts at the given
    /// statement position.
    pub fn set_fragment(&mut self, frag_index: usize, stmt_index: usize) {
        if frag_index < self.fragments.len() {
            self.fragments[frag_index] = stmt_index;
        } else if frag_index == self.fragments.len() {
            self.fragments.push(stmt_index);
        }
    }

    pub fn fragments(&self) -> &[usize] {
        &self.fragments
    }

    pub fn statements(&self) -> &[ImfStatement] {
        &self.statements
    }

    pub fn statement_count(&self) -> usize {
        self.statements.len()
    }

    /// The text covered by the given span.
    pub fn statement_text(&self, statement: &ImfStatement) -> &str {
        &self.text[statement.start..statement.end]
    }
}
