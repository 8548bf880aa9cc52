// Copyright (c) Abstract Machines

//! cpuhog - process CPU sampling and logging
//!
//! This library samples the OS process table on a fixed delay, keeps the
//! processes above a CPU threshold, and appends them to dated, append-only
//! CSV logs. Logs can later be aggregated into per-process time series,
//! rolling means and histograms for reporting.

pub mod analysis;
pub mod appender;
pub mod collector;
pub mod config;
pub mod error;
pub mod sample;
pub mod sampler;
pub mod source;

// Re-export commonly used types
pub use appender::{AppendOutcome, LogAppender};
pub use collector::{Collector, CollectorConfig, LoopState, RunSummary, StopReason};
pub use config::CpuhogConfig;
pub use error::{Error, Result};
pub use sample::{Column, LogFormat, ProcessSample, ProcessStatus};
pub use sampler::{Sampler, SamplerConfig};
pub use source::{ProcessSource, ScriptedProcess, ScriptedSource, SysinfoSource};
