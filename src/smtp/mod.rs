//! SMTP dialogue reconstruction
//!
//! Extracts the SMTP conversation carried by a rebuilt TCP session:
//! client commands, server responses and message content, in the order
//! they were sent, together with the mail transactions they form.

pub mod command;
pub mod message;
pub mod parser;
pub mod session;

pub use command::{SmtpCommand, SmtpCommandKind, SmtpResponse};
pub use message::{ImfFieldKind, ImfMessage, ImfStatement};
pub use parser::{ParserStats, SmtpParser};
pub use session::{ClientStatement, SmtpError, SmtpSession};
