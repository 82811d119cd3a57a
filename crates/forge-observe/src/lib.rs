//! Process-wide `tracing` setup for forge binaries.

mod logger;
pub use logger::*;
