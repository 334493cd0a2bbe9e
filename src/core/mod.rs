//! Core shared types for session reconstruction
//!
//! Provides the data structures used by the TCP and SMTP layers:
//! - `TcpPacket`: decoded TCP segment with capture timestamp
//! - `ConnectionKey`: direction-independent connection identity

pub mod key;
pub mod packet;

pub use key::ConnectionKey;
pub use packet::{TcpFlags, TcpOption, TcpPacket};
