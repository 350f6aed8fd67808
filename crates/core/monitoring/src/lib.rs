//! Logging and metrics plumbing shared by the tracedb crates.

pub mod logging;
pub mod telemetry;
