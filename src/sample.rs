// Copyright (c) Abstract Machines

use crate::error::{Error, Result};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Timestamp layout used for every time column in the logs.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Placeholder written when a text field could not be resolved.
pub const NOT_AVAILABLE: &str = "N/A";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessStatus {
    Running,
    Sleeping,
    Idle,
    Stopped,
    Zombie,
    Dead,
    DiskSleep,
    Unknown,
}

impl ProcessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStatus::Running => "running",
            ProcessStatus::Sleeping => "sleeping",
            ProcessStatus::Idle => "idle",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Zombie => "zombie",
            ProcessStatus::Dead => "dead",
            ProcessStatus::DiskSleep => "disk-sleep",
            ProcessStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of one process at one tick.
///
/// Fields that could not be read hold their sentinel: `0` for numbers,
/// [`NOT_AVAILABLE`] for `name` and `username`, the capture `timestamp` for
/// `create_time` and [`ProcessStatus::Unknown`] for `status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub timestamp: DateTime<Local>,
    pub pid: u32,
    pub name: String,
    pub create_time: DateTime<Local>,
    pub cores: u32,
    /// Percent of one core unless the run normalises by core count.
    pub cpu_usage: f64,
    pub status: ProcessStatus,
    pub nice: i32,
    /// Resident set size in bytes.
    pub memory_usage: u64,
    pub read_bytes: u64,
    pub write_bytes: u64,
    pub n_threads: u32,
    pub username: String,
}

/// How byte-valued columns are rendered in a log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Byte columns as `12.34MB`. Display only, never fed back into analysis.
    #[default]
    Human,
    /// Raw integers, suitable for later reprocessing.
    Numeric,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "human" => Ok(LogFormat::Human),
            "numeric" => Ok(LogFormat::Numeric),
            other => Err(Error::Configuration(format!(
                "log format must be 'human' or 'numeric', got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Pid,
    Timestamp,
    Name,
    CreateTime,
    Cores,
    CpuUsage,
    Status,
    Nice,
    MemoryUsage,
    ReadBytes,
    WriteBytes,
    NThreads,
    Username,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Column::Pid,
        Column::Timestamp,
        Column::Name,
        Column::CreateTime,
        Column::Cores,
        Column::CpuUsage,
        Column::Status,
        Column::Nice,
        Column::MemoryUsage,
        Column::ReadBytes,
        Column::WriteBytes,
        Column::NThreads,
        Column::Username,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Column::Pid => "pid",
            Column::Timestamp => "timestamp",
            Column::Name => "name",
            Column::CreateTime => "create_time",
            Column::Cores => "cores",
            Column::CpuUsage => "cpu_usage",
            Column::Status => "status",
            Column::Nice => "nice",
            Column::MemoryUsage => "memory_usage",
            Column::ReadBytes => "read_bytes",
            Column::WriteBytes => "write_bytes",
            Column::NThreads => "n_threads",
            Column::Username => "username",
        }
    }

    pub fn default_columns() -> Vec<Column> {
        vec![
            Column::Pid,
            Column::Timestamp,
            Column::Name,
            Column::CpuUsage,
            Column::MemoryUsage,
            Column::ReadBytes,
            Column::WriteBytes,
            Column::Status,
            Column::CreateTime,
            Column::Nice,
            Column::NThreads,
            Column::Cores,
            Column::Username,
        ]
    }

    /// Parses a comma-separated column list. `pid` is always the first
    /// column and is prepended when missing.
    pub fn parse_list(list: &str) -> Result<Vec<Column>> {
        let mut columns = vec![Column::Pid];
        let parts = list.split(',').map(str::trim).filter(|s| !s.is_empty());
        for (idx, part) in parts.enumerate() {
            let column: Column = part.parse()?;
            if column == Column::Pid && idx == 0 {
                continue;
            }
            if columns.contains(&column) {
                return Err(Error::DuplicateColumn(part.to_string()));
            }
            columns.push(column);
        }
        Ok(columns)
    }

    pub fn render(&self, sample: &ProcessSample, format: LogFormat) -> String {
        let bytes = |value: u64| match format {
            LogFormat::Human => format_bytes(value),
            LogFormat::Numeric => value.to_string(),
        };

        match self {
            Column::Pid => sample.pid.to_string(),
            Column::Timestamp => sample.timestamp.format(TIMESTAMP_FORMAT).to_string(),
            Column::Name => sample.name.clone(),
            Column::CreateTime => sample.create_time.format(TIMESTAMP_FORMAT).to_string(),
            Column::Cores => sample.cores.to_string(),
            Column::CpuUsage => format!("{:.2}", sample.cpu_usage),
            Column::Status => sample.status.to_string(),
            Column::Nice => sample.nice.to_string(),
            Column::MemoryUsage => bytes(sample.memory_usage),
            Column::ReadBytes => bytes(sample.read_bytes),
            Column::WriteBytes => bytes(sample.write_bytes),
            Column::NThreads => sample.n_threads.to_string(),
            Column::Username => sample.username.clone(),
        }
    }

    /// Ascending order of two samples by this column.
    pub fn compare(&self, a: &ProcessSample, b: &ProcessSample) -> Ordering {
        match self {
            Column::Pid => a.pid.cmp(&b.pid),
            Column::Timestamp => a.timestamp.cmp(&b.timestamp),
            Column::Name => a.name.cmp(&b.name),
            Column::CreateTime => a.create_time.cmp(&b.create_time),
            Column::Cores => a.cores.cmp(&b.cores),
            Column::CpuUsage => a.cpu_usage.total_cmp(&b.cpu_usage),
            Column::Status => a.status.as_str().cmp(b.status.as_str()),
            Column::Nice => a.nice.cmp(&b.nice),
            Column::MemoryUsage => a.memory_usage.cmp(&b.memory_usage),
            Column::ReadBytes => a.read_bytes.cmp(&b.read_bytes),
            Column::WriteBytes => a.write_bytes.cmp(&b.write_bytes),
            Column::NThreads => a.n_threads.cmp(&b.n_threads),
            Column::Username => a.username.cmp(&b.username),
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Column {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_lowercase();
        Column::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| Error::UnknownColumn(s.to_string()))
    }
}

/// Renders a byte count with binary units, e.g. `12.34MB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["", "K", "M", "G", "T", "P"];

    let mut value = bytes as f64;
    for unit in &UNITS[..UNITS.len() - 1] {
        if value < 1024.0 {
            return format!("{value:.2}{unit}B");
        }
        value /= 1024.0;
    }
    format!("{value:.2}{}B", UNITS[UNITS.len() - 1])
}
