// Copyright (c) Abstract Machines

//! In-memory process table that replays a fixed script, one table per
//! refresh. Used by the tests and for dry runs without touching the OS.

use super::{Field, FieldValue, Probe, ProcessHandle, ProcessSource};
use crate::error::{Error, Result};
use crate::sample::ProcessStatus;
use chrono::{DateTime, Local};
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone)]
pub struct ScriptedProcess {
    pub pid: u32,
    pub name: String,
    pub cpu_usage: f64,
    pub memory: u64,
    pub threads: u32,
    pub username: String,
    pub status: ProcessStatus,
    pub created: DateTime<Local>,
    vanished: bool,
    overrides: HashMap<Field, Probe>,
}

impl ScriptedProcess {
    pub fn new(pid: u32, name: &str, cpu_usage: f64) -> Self {
        Self {
            pid,
            name: name.to_string(),
            cpu_usage,
            memory: 1024 * 1024,
            threads: 1,
            username: "root".to_string(),
            status: ProcessStatus::Running,
            created: Local::now(),
            vanished: false,
            overrides: HashMap::new(),
        }
    }

    pub fn with_memory(mut self, bytes: u64) -> Self {
        self.memory = bytes;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_username(mut self, username: &str) -> Self {
        self.username = username.to_string();
        self
    }

    /// Forces `field` to answer with `probe` instead of its scripted value.
    pub fn with_probe(mut self, field: Field, probe: Probe) -> Self {
        self.overrides.insert(field, probe);
        self
    }

    pub fn denied(self, field: Field) -> Self {
        self.with_probe(field, Probe::Denied)
    }

    /// Listed by the enumeration but gone by the time any field is queried.
    pub fn vanished(mut self) -> Self {
        self.vanished = true;
        self
    }

    fn value(&self, field: Field) -> FieldValue {
        match field {
            Field::Name => FieldValue::Text(self.name.clone()),
            Field::CreateTime => FieldValue::Time(self.created),
            Field::Cores => FieldValue::Unsigned(4),
            Field::CpuUsage => FieldValue::Float(self.cpu_usage),
            Field::Status => FieldValue::Status(self.status),
            Field::Nice => FieldValue::Signed(0),
            Field::Memory => FieldValue::Unsigned(self.memory),
            Field::ReadBytes | Field::WriteBytes => FieldValue::Unsigned(0),
            Field::Threads => FieldValue::Unsigned(u64::from(self.threads)),
            Field::Username => FieldValue::Text(self.username.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Step {
    Table(Vec<ScriptedProcess>),
    Fail(String),
}

/// Replays scripted process tables. Once the script runs out, the last table
/// stays current.
#[derive(Debug, Default)]
pub struct ScriptedSource {
    steps: VecDeque<Step>,
    current: Vec<ScriptedProcess>,
    always_fail: Option<String>,
    refreshes: usize,
}

impl ScriptedSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// A source whose every refresh fails with `reason`.
    pub fn failing(reason: &str) -> Self {
        Self {
            always_fail: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn push_tick(mut self, processes: Vec<ScriptedProcess>) -> Self {
        self.steps.push_back(Step::Table(processes));
        self
    }

    pub fn push_failure(mut self, reason: &str) -> Self {
        self.steps.push_back(Step::Fail(reason.to_string()));
        self
    }

    pub fn refresh_count(&self) -> usize {
        self.refreshes
    }
}

impl ProcessSource for ScriptedSource {
    fn refresh(&mut self) -> Result<()> {
        self.refreshes += 1;

        if let Some(reason) = &self.always_fail {
            return Err(Error::ProcessTable(reason.clone()));
        }

        match self.steps.pop_front() {
            Some(Step::Table(processes)) => {
                self.current = processes;
                Ok(())
            }
            Some(Step::Fail(reason)) => Err(Error::ProcessTable(reason)),
            None => Ok(()),
        }
    }

    fn list_processes(&self) -> Vec<ProcessHandle> {
        self.current
            .iter()
            .map(|p| ProcessHandle { pid: p.pid })
            .collect()
    }

    fn query(&self, handle: ProcessHandle, field: Field) -> Probe {
        let Some(process) = self.current.iter().find(|p| p.pid == handle.pid) else {
            return Probe::Vanished;
        };

        if process.vanished {
            return Probe::Vanished;
        }

        match process.overrides.get(&field) {
            Some(probe) => probe.clone(),
            None => Probe::Value(process.value(field)),
        }
    }
}
