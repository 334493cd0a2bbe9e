//! Capture and processing engine
//!
//! The engine owns everything between a capture file and the matched
//! sessions: packet sources, the reassembly/parsing/matching
//! pipeline, the result sinks and the end-of-run report.

pub mod capture;
pub mod pipeline;
pub mod report;
pub mod sink;

pub use capture::{MemorySource, PacketSource, PcapFileSource};
pub use pipeline::Pipeline;
pub use report::{DiscardCounters, RunReport};
pub use sink::{JsonlSink, LogSink, NullObserver, ResultSink, SignatureObserver};
