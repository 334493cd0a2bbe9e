//! TCP session reconstruction
//!
//! Rebuilds bidirectional TCP sessions from captured segments:
//! - `TcpSession`: per-connection reassembly with out-of-order handling
//! - `SessionBuilder`: session table with handshake gating, pending
//!   eviction and an adaptive inactivity timeout

pub mod builder;
pub mod session;

pub use builder::{BuilderStats, SessionBuilder};
pub use session::{EndpointState, TcpSession};
