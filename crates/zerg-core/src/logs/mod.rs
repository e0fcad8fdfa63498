//! Structured per-worker logging and read-side aggregation.
//!
//! Writers append one JSON object per line to a per-worker file with
//! size-based rotation; the aggregator merges all worker files (plus the
//! orchestrator's) by timestamp at read time. Task artifacts (command
//! output, diffs, execution events) live in per-task directories with a
//! retention policy.

pub mod aggregator;
pub mod writer;

pub use aggregator::{LogAggregator, LogQuery};
pub use writer::{
    LogEvent, LogFields, LogLevel, LogPhase, StructuredLogWriter, TaskArtifactCapture, WriterId,
};
