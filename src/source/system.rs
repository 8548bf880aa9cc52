// Copyright (c) Abstract Machines

use super::{Field, FieldValue, Probe, ProcessHandle, ProcessSource};
use crate::error::Result;
use crate::sample::ProcessStatus;
use chrono::{DateTime, Local};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System, UpdateKind, Users};
use tracing::debug;

/// Process table backed by `sysinfo`, with `/proc` reads on Linux for the
/// fields `sysinfo` does not expose (nice, affinity, thread count).
pub struct SysinfoSource {
    system: System,
    users: Users,
    normalize_cpu: bool,
    cpu_count: usize,
}

impl SysinfoSource {
    /// Takes an initial snapshot and waits out the minimum CPU measurement
    /// window, so the first tick already reports meaningful CPU usage.
    pub fn new(normalize_cpu: bool) -> Self {
        let mut system = System::new_all();
        system.refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        std::thread::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL);

        let cpu_count = system.cpus().len().max(1);
        debug!(
            "Process source ready: {} processes, {} logical cpus",
            system.processes().len(),
            cpu_count
        );

        Self {
            system,
            users: Users::new_with_refreshed_list(),
            normalize_cpu,
            cpu_count,
        }
    }

    fn refresh_kind() -> ProcessRefreshKind {
        ProcessRefreshKind::new()
            .with_cpu()
            .with_memory()
            .with_disk_usage()
            .with_user(UpdateKind::OnlyIfNotSet)
    }

    fn map_status(status: sysinfo::ProcessStatus) -> ProcessStatus {
        match status {
            sysinfo::ProcessStatus::Run => ProcessStatus::Running,
            sysinfo::ProcessStatus::Sleep => ProcessStatus::Sleeping,
            sysinfo::ProcessStatus::Idle => ProcessStatus::Idle,
            sysinfo::ProcessStatus::Stop | sysinfo::ProcessStatus::Tracing => {
                ProcessStatus::Stopped
            }
            sysinfo::ProcessStatus::Zombie => ProcessStatus::Zombie,
            sysinfo::ProcessStatus::Dead => ProcessStatus::Dead,
            sysinfo::ProcessStatus::UninterruptibleDiskSleep => ProcessStatus::DiskSleep,
            _ => ProcessStatus::Unknown,
        }
    }

    fn local_time(secs: u64) -> Option<DateTime<Local>> {
        let secs = i64::try_from(secs).ok()?;
        DateTime::from_timestamp(secs, 0).map(|t| t.with_timezone(&Local))
    }
}

impl ProcessSource for SysinfoSource {
    fn refresh(&mut self) -> Result<()> {
        self.system
            .refresh_processes_specifics(ProcessesToUpdate::All, true, Self::refresh_kind());
        self.users.refresh_list();
        Ok(())
    }

    fn list_processes(&self) -> Vec<ProcessHandle> {
        let mut handles: Vec<ProcessHandle> = self
            .system
            .processes()
            .keys()
            .map(|pid| ProcessHandle { pid: pid.as_u32() })
            .collect();
        handles.sort_by_key(|h| h.pid);
        handles
    }

    fn query(&self, handle: ProcessHandle, field: Field) -> Probe {
        let Some(process) = self.system.process(Pid::from_u32(handle.pid)) else {
            return Probe::Vanished;
        };

        match field {
            Field::Name => Probe::Value(FieldValue::Text(
                process.name().to_string_lossy().into_owned(),
            )),
            Field::CreateTime => {
                let started = match process.start_time() {
                    0 => System::boot_time(),
                    secs => secs,
                };
                match Self::local_time(started) {
                    Some(time) => Probe::Value(FieldValue::Time(time)),
                    None => Probe::Unsupported,
                }
            }
            Field::CpuUsage => {
                let mut usage = f64::from(process.cpu_usage());
                if self.normalize_cpu {
                    usage /= self.cpu_count as f64;
                }
                Probe::Value(FieldValue::Float(usage))
            }
            Field::Status => Probe::Value(FieldValue::Status(Self::map_status(process.status()))),
            Field::Memory => Probe::Value(FieldValue::Unsigned(process.memory())),
            Field::ReadBytes => Probe::Value(FieldValue::Unsigned(process.disk_usage().read_bytes)),
            Field::WriteBytes => {
                Probe::Value(FieldValue::Unsigned(process.disk_usage().written_bytes))
            }
            Field::Username => match process
                .user_id()
                .and_then(|uid| self.users.get_user_by_id(uid))
            {
                Some(user) => Probe::Value(FieldValue::Text(user.name().to_string())),
                None => Probe::Denied,
            },
            Field::Nice => procfs::nice(handle.pid),
            Field::Cores => procfs::allowed_cores(handle.pid),
            Field::Threads => procfs::threads(handle.pid),
        }
    }
}

#[cfg(target_os = "linux")]
mod procfs {
    use super::{FieldValue, Probe};
    use std::fs;
    use std::io::ErrorKind;

    fn read(pid: u32, file: &str) -> Result<String, Probe> {
        fs::read_to_string(format!("/proc/{pid}/{file}")).map_err(|e| match e.kind() {
            ErrorKind::NotFound => Probe::Vanished,
            ErrorKind::PermissionDenied => Probe::Denied,
            _ => Probe::Unsupported,
        })
    }

    fn status_value(pid: u32, key: &str) -> Result<String, Probe> {
        let contents = read(pid, "status")?;
        contents
            .lines()
            .find_map(|line| line.strip_prefix(key))
            .map(|v| v.trim().to_string())
            .ok_or(Probe::Unsupported)
    }

    pub fn nice(pid: u32) -> Probe {
        let contents = match read(pid, "stat") {
            Ok(contents) => contents,
            Err(probe) => return probe,
        };

        // comm may contain spaces and parens; fields restart after the last ')'
        let Some(close_paren) = contents.rfind(')') else {
            return Probe::Unsupported;
        };
        let fields: Vec<&str> = contents[close_paren + 1..].split_whitespace().collect();

        match fields.get(16).and_then(|v| v.parse::<i64>().ok()) {
            Some(nice) => Probe::Value(FieldValue::Signed(nice)),
            None => Probe::Unsupported,
        }
    }

    pub fn threads(pid: u32) -> Probe {
        match status_value(pid, "Threads:") {
            Ok(value) => match value.parse::<u64>() {
                Ok(n) => Probe::Value(FieldValue::Unsigned(n)),
                Err(_) => Probe::Unsupported,
            },
            Err(probe) => probe,
        }
    }

    pub fn allowed_cores(pid: u32) -> Probe {
        match status_value(pid, "Cpus_allowed_list:") {
            Ok(list) => match count_cpu_list(&list) {
                Some(n) => Probe::Value(FieldValue::Unsigned(n)),
                None => Probe::Unsupported,
            },
            Err(probe) => probe,
        }
    }

    /// Counts the cpus in a kernel cpu list such as `0-3,6,8-9`.
    pub fn count_cpu_list(list: &str) -> Option<u64> {
        let mut count = 0;
        for part in list.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            match part.split_once('-') {
                Some((lo, hi)) => {
                    let lo: u64 = lo.parse().ok()?;
                    let hi: u64 = hi.parse().ok()?;
                    if hi < lo {
                        return None;
                    }
                    count += hi - lo + 1;
                }
                None => {
                    part.parse::<u64>().ok()?;
                    count += 1;
                }
            }
        }
        Some(count)
    }
}

#[cfg(not(target_os = "linux"))]
mod procfs {
    use super::Probe;

    pub fn nice(_pid: u32) -> Probe {
        Probe::Unsupported
    }

    pub fn threads(_pid: u32) -> Probe {
        Probe::Unsupported
    }

    pub fn allowed_cores(_pid: u32) -> Probe {
        Probe::Unsupported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_status() {
        assert_eq!(
            SysinfoSource::map_status(sysinfo::ProcessStatus::Run),
            ProcessStatus::Running
        );
        assert_eq!(
            SysinfoSource::map_status(sysinfo::ProcessStatus::Zombie),
            ProcessStatus::Zombie
        );
        assert_eq!(
            SysinfoSource::map_status(sysinfo::ProcessStatus::Unknown(99)),
            ProcessStatus::Unknown
        );
    }

    #[test]
    fn test_local_time_from_epoch_seconds() {
        let time = SysinfoSource::local_time(1_700_000_000).unwrap();
        assert_eq!(time.timestamp(), 1_700_000_000);
        assert!(SysinfoSource::local_time(u64::MAX).is_none());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_count_cpu_list() {
        assert_eq!(procfs::count_cpu_list("0-3"), Some(4));
        assert_eq!(procfs::count_cpu_list("0-3,6,8-9"), Some(7));
        assert_eq!(procfs::count_cpu_list("5"), Some(1));
        assert_eq!(procfs::count_cpu_list("3-1"), None);
        assert_eq!(procfs::count_cpu_list("x"), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_reads_own_process() {
        let mut source = SysinfoSource::new(false);
        source.refresh().unwrap();

        let me = ProcessHandle {
            pid: std::process::id(),
        };
        assert!(source.list_processes().contains(&me));
        assert!(matches!(
            source.query(me, Field::Threads),
            Probe::Value(FieldValue::Unsigned(n)) if n >= 1
        ));
        assert!(matches!(
            source.query(me, Field::Cores),
            Probe::Value(FieldValue::Unsigned(n)) if n >= 1
        ));
        assert!(matches!(
            source.query(me, Field::Nice),
            Probe::Value(FieldValue::Signed(_))
        ));
        assert!(matches!(
            source.query(me, Field::Memory),
            Probe::Value(FieldValue::Unsigned(n)) if n > 0
        ));
    }
}
