// Copyright (c) Abstract Machines

pub mod scripted;
pub mod system;

use crate::error::Result;
use crate::sample::ProcessStatus;
use chrono::{DateTime, Local};

pub use scripted::{ScriptedProcess, ScriptedSource};
pub use system::SysinfoSource;

/// Opaque reference to a process seen at the last refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessHandle {
    pub pid: u32,
}

/// Per-process attributes a source can be asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    Name,
    CreateTime,
    Cores,
    CpuUsage,
    Status,
    Nice,
    Memory,
    ReadBytes,
    WriteBytes,
    Threads,
    Username,
}

impl Field {
    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Name => "name",
            Field::CreateTime => "create_time",
            Field::Cores => "cores",
            Field::CpuUsage => "cpu_usage",
            Field::Status => "status",
            Field::Nice => "nice",
            Field::Memory => "memory",
            Field::ReadBytes => "read_bytes",
            Field::WriteBytes => "write_bytes",
            Field::Threads => "threads",
            Field::Username => "username",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Float(f64),
    Unsigned(u64),
    Signed(i64),
    Time(DateTime<Local>),
    Status(ProcessStatus),
}

/// Outcome of querying one field of one process.
#[derive(Debug, Clone, PartialEq)]
pub enum Probe {
    Value(FieldValue),
    /// The platform has no way to report this field.
    Unsupported,
    /// The field exists but the caller lacks permission to read it.
    Denied,
    /// The process exited between enumeration and the query.
    Vanished,
}

impl Probe {
    pub fn is_vanished(&self) -> bool {
        matches!(self, Probe::Vanished)
    }
}

/// Read-only view of the OS process table.
pub trait ProcessSource {
    /// Re-reads the process table. Called once per tick.
    fn refresh(&mut self) -> Result<()>;

    /// Processes seen at the last refresh, in enumeration order.
    fn list_processes(&self) -> Vec<ProcessHandle>;

    fn query(&self, handle: ProcessHandle, field: Field) -> Probe;
}

impl<S: ProcessSource + ?Sized> ProcessSource for Box<S> {
    fn refresh(&mut self) -> Result<()> {
        (**self).refresh()
    }

    fn list_processes(&self) -> Vec<ProcessHandle> {
        (**self).list_processes()
    }

    fn query(&self, handle: ProcessHandle, field: Field) -> Probe {
        (**self).query(handle, field)
    }
}
