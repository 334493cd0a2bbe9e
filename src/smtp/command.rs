//! SMTP command and response models

use serde::{Deserialize, Serialize};

/// SMTP command verbs tracked by the reconstructor.
///
/// Commands outside RFC 5321's core set (STARTTLS, AUTH) fall under
/// `Extension`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SmtpCommandKind {
    /// HELO or EHLO
    Helo,
    Help,
    Vrfy,
    Expn,
    Noop,
    /// MAIL FROM:
    Mail,
    /// RCPT TO:
    Rcpt,
    Quit,
    Rset,
    Data,
    Extension,
}

impl std::fmt::Display for SmtpCommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SmtpCommandKind::Helo => "HELO",
            SmtpCommandKind::Help => "HELP",
            SmtpCommandKind::Vrfy => "VRFY",
            SmtpCommandKind::Expn => "EXPN",
            SmtpCommandKind::Noop => "NOOP",
            SmtpCommandKind::Mail => "MAIL",
            SmtpCommandKind::Rcpt => "RCPT",
            SmtpCommandKind::Quit => "QUIT",
            SmtpCommandKind::Rset => "RSET",
            SmtpCommandKind::Data => "DATA",
            SmtpCommandKind::Extension => "EXTN",
        };
        write!(f, "{}", name)
    }
}

/// A command line as sent by the client.
///
/// The raw line is kept verbatim: signature patterns run against the
/// original bytes, not a normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpCommand {
    pub kind: SmtpCommandKind,
    pub raw: String,
}

impl SmtpCommand {
    pub fn new(kind: SmtpCommandKind, raw: impl Into<String>) -> Self {
        Self { kind, raw: raw.into() }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }
}

/// A server reply: three-digit code and text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpResponse {
    pub code: u16,
    pub text: String,
}

impl SmtpResponse {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self { code, text: text.into() }
    }

    /// 2xx and 3xx replies report success or an intermediate go-ahead.
    pub fn is_positive(&self) -> bool {
        (200..400).contains(&self.code)
    }
}

impl std::fmt::Display for SmtpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}
