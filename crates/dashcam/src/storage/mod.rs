//! Storage for captured stills
//!
//! - Output path templates (fixed path or per-session names)
//! - Lazily opened per-session output sink
//! - Latest-frame symlink

pub mod path;
pub mod sink;

pub use path::OutputPath;
pub use sink::{update_latest_link, OutputSink, SinkSummary, PUBLIC_READ_MODE};
