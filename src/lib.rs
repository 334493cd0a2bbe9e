//! SMTP bot detection from captured traffic.
//!
//! Rebuilds TCP sessions out of capture files, reconstructs the SMTP
//! dialogue each session carried and matches the dialogues against
//! compiled bot signatures.

pub mod config;
pub mod core;
pub mod engine;
pub mod signatures;
pub mod smtp;
pub mod tcp;

pub use config::Config;
pub use engine::{Pipeline, RunReport};
pub use signatures::{Signature, SignatureCompiler, SignatureMatcher};
pub use smtp::{SmtpParser, SmtpSession};
pub use tcp::builder::SessionBuilder;
pub use tcp::session::TcpSession;
