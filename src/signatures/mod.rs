//! Bot signature compilation and matching
//!
//! A signature is an ordered list of regular expressions that an SMTP
//! conversation must satisfy, plus optional TCP handshake
//! preconditions. Signatures are written in a small definition
//! language with macros and capture variables, compiled into
//! [`Signature`] values and matched against rebuilt sessions with
//! block backtracking.

pub mod compiler;
pub mod matcher;
pub mod model;

pub use compiler::{SignatureCompiler, SignatureError};
pub use matcher::{MatchedClient, MatchingSession, SignatureMatcher};
pub use model::{Link, Signature, SignatureStatement, TcpEvent};
