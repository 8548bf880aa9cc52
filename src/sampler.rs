// Copyright (c) Abstract Machines

use crate::error::Result;
use crate::sample::{Column, ProcessSample, ProcessStatus, NOT_AVAILABLE};
use crate::source::{Field, FieldValue, Probe, ProcessHandle, ProcessSource};
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Samples must exceed this CPU percentage to be kept.
    pub threshold: f64,
    /// Rows shown in the per-tick debug listing, 0 for all. Never limits
    /// what is logged.
    pub max_records: usize,
    pub sort_by: Column,
    pub descending: bool,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            threshold: 10.0,
            max_records: 25,
            sort_by: Column::CpuUsage,
            descending: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickStats {
    /// Processes enumerated by the refresh, pid 0 excluded.
    pub seen: usize,
    pub vanished: usize,
    pub degraded_fields: usize,
    pub accepted: usize,
}

/// Raw per-process records of one refresh, before filtering.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub tick: u64,
    pub taken_at: DateTime<Local>,
    pub samples: Vec<ProcessSample>,
    pub stats: TickStats,
}

pub struct Sampler<S> {
    source: S,
    config: SamplerConfig,
    tick: u64,
}

impl<S: ProcessSource> Sampler<S> {
    pub fn new(source: S, config: SamplerConfig) -> Self {
        Self {
            source,
            config,
            tick: 0,
        }
    }

    pub fn config(&self) -> &SamplerConfig {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Number of snapshots taken so far.
    pub fn ticks(&self) -> u64 {
        self.tick
    }

    /// Refreshes the process table and reads every live process. Processes
    /// that vanish mid-read are left out; unreadable fields are defaulted.
    pub fn snapshot(&mut self) -> Result<Snapshot> {
        self.tick += 1;
        self.source.refresh()?;

        let taken_at = Local::now();
        let handles = self.source.list_processes();
        let mut stats = TickStats::default();

        let mut samples = Vec::with_capacity(handles.len());
        for handle in handles {
            if handle.pid == 0 {
                continue;
            }
            stats.seen += 1;

            let mut reader = FieldReader::new(&self.source, handle);
            let sample = reader.read_sample(taken_at);
            stats.degraded_fields += reader.degraded.len();

            match sample {
                Some(sample) => {
                    if !reader.degraded.is_empty() {
                        debug!(
                            "tick {}: pid {} ({}) degraded fields: {}",
                            self.tick,
                            sample.pid,
                            sample.name,
                            reader
                                .degraded
                                .iter()
                                .map(|f| f.as_str())
                                .collect::<Vec<_>>()
                                .join(",")
                        );
                    }
                    samples.push(sample);
                }
                None => {
                    stats.vanished += 1;
                    debug!("tick {}: pid {} vanished during read", self.tick, handle.pid);
                }
            }
        }

        Ok(Snapshot {
            tick: self.tick,
            taken_at,
            samples,
            stats,
        })
    }

    /// Orders the samples by the configured key and keeps every one strictly
    /// above the threshold.
    pub fn select(&self, mut samples: Vec<ProcessSample>) -> Vec<ProcessSample> {
        let key = self.config.sort_by;
        if self.config.descending {
            samples.sort_by(|a, b| key.compare(b, a));
        } else {
            samples.sort_by(|a, b| key.compare(a, b));
        }

        samples.retain(|s| s.cpu_usage > self.config.threshold);
        samples
    }

    /// The leading rows of a selection shown in the debug listing.
    pub fn preview<'s>(&self, selected: &'s [ProcessSample]) -> &'s [ProcessSample] {
        match self.config.max_records {
            0 => selected,
            n => &selected[..n.min(selected.len())],
        }
    }

    /// One full sampling pass: snapshot followed by selection.
    pub fn sample(&mut self) -> Result<Snapshot> {
        let mut snapshot = self.snapshot()?;
        snapshot.samples = self.select(std::mem::take(&mut snapshot.samples));
        snapshot.stats.accepted = snapshot.samples.len();
        Ok(snapshot)
    }
}

/// Reads the fields of one process, tracking which ones fell back to their
/// default and whether the process disappeared.
struct FieldReader<'a, S: ?Sized> {
    source: &'a S,
    handle: ProcessHandle,
    vanished: bool,
    degraded: Vec<Field>,
}

impl<'a, S: ProcessSource + ?Sized> FieldReader<'a, S> {
    fn new(source: &'a S, handle: ProcessHandle) -> Self {
        Self {
            source,
            handle,
            vanished: false,
            degraded: Vec::new(),
        }
    }

    fn read_sample(&mut self, taken_at: DateTime<Local>) -> Option<ProcessSample> {
        let sample = ProcessSample {
            timestamp: taken_at,
            pid: self.handle.pid,
            name: self.text(Field::Name),
            create_time: self.time(Field::CreateTime).unwrap_or(taken_at),
            cores: saturate_u32(self.unsigned(Field::Cores)),
            cpu_usage: clamp_cpu(self.float(Field::CpuUsage)),
            status: self.status(),
            nice: self.signed(Field::Nice).clamp(i32::MIN as i64, i32::MAX as i64) as i32,
            memory_usage: self.unsigned(Field::Memory),
            read_bytes: self.unsigned(Field::ReadBytes),
            write_bytes: self.unsigned(Field::WriteBytes),
            n_threads: saturate_u32(self.unsigned(Field::Threads)),
            username: self.text(Field::Username),
        };

        if self.vanished {
            None
        } else {
            Some(sample)
        }
    }

    fn probe(&mut self, field: Field) -> Option<FieldValue> {
        if self.vanished {
            return None;
        }

        match self.source.query(self.handle, field) {
            Probe::Value(value) => Some(value),
            Probe::Vanished => {
                self.vanished = true;
                None
            }
            Probe::Denied | Probe::Unsupported => {
                self.degraded.push(field);
                None
            }
        }
    }

    fn mismatch(&mut self, field: Field) {
        debug!("pid {}: unexpected value type for {}", self.handle.pid, field.as_str());
        self.degraded.push(field);
    }

    fn text(&mut self, field: Field) -> String {
        match self.probe(field) {
            Some(FieldValue::Text(text)) => text,
            Some(_) => {
                self.mismatch(field);
                NOT_AVAILABLE.to_string()
            }
            None => NOT_AVAILABLE.to_string(),
        }
    }

    fn float(&mut self, field: Field) -> f64 {
        match self.probe(field) {
            Some(FieldValue::Float(v)) => v,
            Some(FieldValue::Unsigned(v)) => v as f64,
            Some(FieldValue::Signed(v)) => v as f64,
            Some(_) => {
                self.mismatch(field);
                0.0
            }
            None => 0.0,
        }
    }

    fn unsigned(&mut self, field: Field) -> u64 {
        match self.probe(field) {
            Some(FieldValue::Unsigned(v)) => v,
            Some(FieldValue::Signed(v)) if v >= 0 => v as u64,
            Some(_) => {
                self.mismatch(field);
                0
            }
            None => 0,
        }
    }

    fn signed(&mut self, field: Field) -> i64 {
        match self.probe(field) {
            Some(FieldValue::Signed(v)) => v,
            Some(FieldValue::Unsigned(v)) => i64::try_from(v).unwrap_or(i64::MAX),
            Some(_) => {
                self.mismatch(field);
                0
            }
            None => 0,
        }
    }

    fn time(&mut self, field: Field) -> Option<DateTime<Local>> {
        match self.probe(field) {
            Some(FieldValue::Time(t)) => Some(t),
            Some(_) => {
                self.mismatch(field);
                None
            }
            None => None,
        }
    }

    fn status(&mut self) -> ProcessStatus {
        match self.probe(Field::Status) {
            Some(FieldValue::Status(status)) => status,
            Some(_) => {
                self.mismatch(Field::Status);
                ProcessStatus::Unknown
            }
            None => ProcessStatus::Unknown,
        }
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn clamp_cpu(value: f64) -> f64 {
    if value.is_finite() && value > 0.0 {
        value
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{ScriptedProcess, ScriptedSource};

    fn sampler(threshold: f64, processes: Vec<ScriptedProcess>) -> Sampler<ScriptedSource> {
        let config = SamplerConfig {
            threshold,
            max_records: 0,
            ..SamplerConfig::default()
        };
        Sampler::new(ScriptedSource::new().push_tick(processes), config)
    }

    fn pids(samples: &[ProcessSample]) -> Vec<u32> {
        samples.iter().map(|s| s.pid).collect()
    }

    #[test]
    fn test_sampler_config_default() {
        let config = SamplerConfig::default();
        assert_eq!(config.threshold, 10.0);
        assert_eq!(config.max_records, 25);
        assert_eq!(config.sort_by, Column::CpuUsage);
        assert!(config.descending);
    }

    #[test]
    fn test_threshold_is_strictly_greater() {
        let mut sampler = sampler(
            15.0,
            vec![
                ScriptedProcess::new(10, "below", 14.99),
                ScriptedProcess::new(11, "equal", 15.0),
                ScriptedProcess::new(12, "above", 15.01),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![12]);
        assert_eq!(snapshot.stats.accepted, 1);
        assert_eq!(snapshot.stats.seen, 3);
    }

    #[test]
    fn test_pid_zero_is_never_reported() {
        let mut sampler = sampler(
            0.0,
            vec![
                ScriptedProcess::new(0, "idle", 99.0),
                ScriptedProcess::new(7, "worker", 50.0),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![7]);
        assert_eq!(snapshot.stats.seen, 1);
    }

    #[test]
    fn test_denied_field_keeps_process_with_default() {
        let mut sampler = sampler(
            5.0,
            vec![
                ScriptedProcess::new(20, "secret", 40.0)
                    .with_username("daemon")
                    .with_memory(4096)
                    .denied(Field::Username)
                    .denied(Field::Memory),
                ScriptedProcess::new(21, "open", 30.0).with_username("bob"),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![20, 21]);

        let secret = &snapshot.samples[0];
        assert_eq!(secret.username, NOT_AVAILABLE);
        assert_eq!(secret.memory_usage, 0);
        assert_eq!(secret.cpu_usage, 40.0);
        assert_eq!(secret.name, "secret");
        assert_eq!(snapshot.samples[1].username, "bob");
        assert_eq!(snapshot.stats.degraded_fields, 2);
    }

    #[test]
    fn test_unsupported_fields_use_sentinels() {
        let mut sampler = sampler(
            0.0,
            vec![ScriptedProcess::new(30, "portable", 12.0)
                .with_probe(Field::Nice, Probe::Unsupported)
                .with_probe(Field::Cores, Probe::Unsupported)
                .with_probe(Field::Status, Probe::Unsupported)
                .with_probe(Field::CreateTime, Probe::Denied)],
        );

        let snapshot = sampler.sample().unwrap();
        let sample = &snapshot.samples[0];
        assert_eq!(sample.nice, 0);
        assert_eq!(sample.cores, 0);
        assert_eq!(sample.status, ProcessStatus::Unknown);
        assert_eq!(sample.create_time, sample.timestamp);
    }

    #[test]
    fn test_vanished_process_is_dropped() {
        let mut sampler = sampler(
            0.0,
            vec![
                ScriptedProcess::new(40, "stays", 20.0),
                ScriptedProcess::new(41, "gone", 90.0).vanished(),
                ScriptedProcess::new(42, "late-exit", 80.0)
                    .with_probe(Field::Threads, Probe::Vanished),
                ScriptedProcess::new(43, "also-stays", 10.0),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![40, 43]);
        assert_eq!(snapshot.stats.vanished, 2);
    }

    #[test]
    fn test_max_records_only_limits_preview() {
        let config = SamplerConfig {
            threshold: 0.0,
            max_records: 2,
            ..SamplerConfig::default()
        };
        let source = ScriptedSource::new().push_tick(vec![
            ScriptedProcess::new(1, "a", 5.0),
            ScriptedProcess::new(2, "b", 50.0),
            ScriptedProcess::new(3, "c", 25.0),
        ]);
        let mut sampler = Sampler::new(source, config);

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![2, 3, 1]);
        assert_eq!(pids(sampler.preview(&snapshot.samples)), vec![2, 3]);
    }

    #[test]
    fn test_default_config_keeps_every_busy_process() {
        let processes = (1..=30)
            .map(|pid| ScriptedProcess::new(pid, "busy", 50.0 + f64::from(pid)))
            .collect();
        let mut sampler = Sampler::new(
            ScriptedSource::new().push_tick(processes),
            SamplerConfig::default(),
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(snapshot.stats.accepted, 30);
        assert_eq!(snapshot.samples.len(), 30);
        assert_eq!(snapshot.samples[0].pid, 30);
        assert_eq!(sampler.preview(&snapshot.samples).len(), 25);
    }

    #[test]
    fn test_sort_by_other_column_ascending() {
        let config = SamplerConfig {
            threshold: 0.0,
            max_records: 0,
            sort_by: Column::MemoryUsage,
            descending: false,
        };
        let source = ScriptedSource::new().push_tick(vec![
            ScriptedProcess::new(1, "a", 5.0).with_memory(300),
            ScriptedProcess::new(2, "b", 50.0).with_memory(100),
            ScriptedProcess::new(3, "c", 25.0).with_memory(200),
        ]);
        let mut sampler = Sampler::new(source, config);

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![2, 3, 1]);
    }

    #[test]
    fn test_ties_keep_enumeration_order() {
        let mut sampler = sampler(
            0.0,
            vec![
                ScriptedProcess::new(5, "first", 30.0),
                ScriptedProcess::new(3, "second", 30.0),
                ScriptedProcess::new(9, "third", 30.0),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(pids(&snapshot.samples), vec![5, 3, 9]);
    }

    #[test]
    fn test_nothing_above_threshold_is_not_an_error() {
        let mut sampler = sampler(
            90.0,
            vec![
                ScriptedProcess::new(1, "quiet", 1.0),
                ScriptedProcess::new(2, "calm", 2.0),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert!(snapshot.samples.is_empty());
        assert_eq!(snapshot.stats.seen, 2);
    }

    #[test]
    fn test_negative_or_nan_cpu_is_clamped() {
        let mut sampler = sampler(
            -1.0,
            vec![
                ScriptedProcess::new(1, "neg", -3.0),
                ScriptedProcess::new(2, "nan", f64::NAN),
            ],
        );

        let snapshot = sampler.sample().unwrap();
        assert_eq!(snapshot.samples.len(), 2);
        assert!(snapshot.samples.iter().all(|s| s.cpu_usage == 0.0));
    }

    #[test]
    fn test_refresh_failure_propagates() {
        let mut sampler = Sampler::new(
            ScriptedSource::failing("table unavailable"),
            SamplerConfig::default(),
        );
        assert!(sampler.sample().is_err());
        assert_eq!(sampler.ticks(), 1);
    }
}
