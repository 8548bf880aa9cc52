// Copyright (c) Abstract Machines

use crate::error::{Error, Result};
use crate::sample::{Column, LogFormat, ProcessSample};
use chrono::{Local, NaiveDate};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub path: PathBuf,
    pub rows: usize,
    pub wrote_header: bool,
}

/// Appends sample rows to a dated CSV file.
///
/// The header is written only when the file is created (or found empty).
/// Existing content is never rewritten, and a file whose header does not
/// match the configured columns is refused rather than extended. One writer
/// per file is assumed.
#[derive(Debug, Clone)]
pub struct LogAppender {
    dir: PathBuf,
    logical_name: String,
    format: LogFormat,
    columns: Vec<Column>,
}

impl LogAppender {
    pub fn new(
        dir: impl Into<PathBuf>,
        logical_name: &str,
        format: LogFormat,
        columns: Vec<Column>,
    ) -> Result<Self> {
        if logical_name.trim().is_empty() {
            return Err(Error::Configuration("log name must not be empty".into()));
        }
        if columns.first() != Some(&Column::Pid) {
            return Err(Error::Configuration(
                "pid must be the first log column".into(),
            ));
        }

        Ok(Self {
            dir: dir.into(),
            logical_name: logical_name.to_string(),
            format,
            columns,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// `{name}_{YYYY-MM-DD}_logs.csv` for human logs, `{name}_{YYYY-MM-DD}.csv`
    /// for numeric ones.
    pub fn file_name(&self, date: NaiveDate) -> String {
        let suffix = match self.format {
            LogFormat::Human => "_logs",
            LogFormat::Numeric => "",
        };
        format!("{}_{}{}.csv", self.logical_name, date.format("%Y-%m-%d"), suffix)
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(self.file_name(date))
    }

    pub fn current_path(&self) -> PathBuf {
        self.path_for(Local::now().date_naive())
    }

    /// Appends to today's file.
    pub fn append(&self, samples: &[ProcessSample]) -> Result<AppendOutcome> {
        self.append_to(&self.current_path(), samples)
    }

    pub fn append_to(&self, path: &Path, samples: &[ProcessSample]) -> Result<AppendOutcome> {
        if samples.is_empty() {
            return Ok(AppendOutcome {
                path: path.to_path_buf(),
                rows: 0,
                wrote_header: false,
            });
        }

        let needs_header = match fs::metadata(path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if !needs_header {
            self.check_header(path)?;
        }

        let buffer = self.render(samples, needs_header)?;

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&buffer)?;
        file.flush()?;

        debug!(
            "Appended {} rows to {}{}",
            samples.len(),
            path.display(),
            if needs_header { " (new file)" } else { "" }
        );

        Ok(AppendOutcome {
            path: path.to_path_buf(),
            rows: samples.len(),
            wrote_header: needs_header,
        })
    }

    fn header(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.as_str()).collect()
    }

    fn render(&self, samples: &[ProcessSample], with_header: bool) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());

        if with_header {
            writer.write_record(self.header())?;
        }
        for sample in samples {
            writer.write_record(self.columns.iter().map(|c| c.render(sample, self.format)))?;
        }

        writer.into_inner().map_err(|e| Error::Io(e.into_error()))
    }

    fn check_header(&self, path: &Path) -> Result<()> {
        let mut first_line = String::new();
        BufReader::new(File::open(path)?).read_line(&mut first_line)?;

        let expected = self.header().join(",");
        if first_line.trim_end() != expected {
            return Err(Error::Configuration(format!(
                "{} has header '{}', expected '{}'",
                path.display(),
                first_line.trim_end(),
                expected
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::tests::sample;

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn appender(dir: &Path, format: LogFormat) -> LogAppender {
        let columns = Column::parse_list("name,cpu_usage,memory_usage").unwrap();
        LogAppender::new(dir, "cpu_log", format, columns).unwrap()
    }

    #[test]
    fn test_file_name_by_format() {
        let dir = tempfile::tempdir().unwrap();
        let date = NaiveDate::from_ymd_opt(2020, 5, 14).unwrap();

        assert_eq!(
            appender(dir.path(), LogFormat::Human).file_name(date),
            "cpu_log_2020-05-14_logs.csv"
        );
        assert_eq!(
            appender(dir.path(), LogFormat::Numeric).file_name(date),
            "cpu_log_2020-05-14.csv"
        );
    }

    #[test]
    fn test_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let appender = appender(dir.path(), LogFormat::Human);
        let path = dir.path().join("log.csv");
        let batch = vec![sample(1, "a", 20.0), sample(2, "b", 30.0)];

        let first = appender.append_to(&path, &batch).unwrap();
        assert!(first.wrote_header);
        assert_eq!(first.rows, 2);
        assert_eq!(read_lines(&path).len(), 3);

        let second = appender.append_to(&path, &batch).unwrap();
        assert!(!second.wrote_header);

        let lines = read_lines(&path);
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines.iter().filter(|l| *l == "pid,name,cpu_usage,memory_usage").count(),
            1
        );
        assert_eq!(lines[0], "pid,name,cpu_usage,memory_usage");
        assert_eq!(lines[1], "1,a,20.00,12.34MB");
    }

    #[test]
    fn test_existing_rows_are_preserved() {
        let dir = tempfile::tempdir().unwrap();
        let appender = appender(dir.path(), LogFormat::Numeric);
        let path = dir.path().join("log.csv");

        appender.append_to(&path, &[sample(1, "a", 20.0)]).unwrap();
        let before = fs::read_to_string(&path).unwrap();

        appender.append_to(&path, &[sample(2, "b", 40.0)]).unwrap();
        let after = fs::read_to_string(&path).unwrap();

        assert!(after.starts_with(&before));
        assert!(after.ends_with("2,b,40.00,12939264\n"));
    }

    #[test]
    fn test_empty_batch_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let appender = appender(dir.path(), LogFormat::Human);
        let path = dir.path().join("log.csv");

        let outcome = appender.append_to(&path, &[]).unwrap();
        assert_eq!(outcome.rows, 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_empty_existing_file_gets_header() {
        let dir = tempfile::tempdir().unwrap();
        let appender = appender(dir.path(), LogFormat::Human);
        let path = dir.path().join("log.csv");
        File::create(&path).unwrap();

        let outcome = appender.append_to(&path, &[sample(1, "a", 20.0)]).unwrap();
        assert!(outcome.wrote_header);
        assert_eq!(read_lines(&path).len(), 2);
    }

    #[test]
    fn test_mismatched_header_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.csv");
        fs::write(&path, "pid,name\n1,a\n").unwrap();

        let appender = appender(dir.path(), LogFormat::Human);
        let err = appender.append_to(&path, &[sample(2, "b", 20.0)]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert_eq!(fs::read_to_string(&path).unwrap(), "pid,name\n1,a\n");
    }

    #[test]
    fn test_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("logs").join("today");
        let appender = appender(&nested, LogFormat::Numeric);

        let outcome = appender.append(&[sample(1, "a", 20.0)]).unwrap();
        assert!(outcome.path.starts_with(&nested));
        assert!(outcome.path.exists());
    }

    #[test]
    fn test_unwritable_target_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let appender = appender(dir.path(), LogFormat::Numeric);

        // today's log path is occupied by a directory
        let path = appender.current_path();
        fs::create_dir(&path).unwrap();
        fs::write(path.join("keep.txt"), "untouched\n").unwrap();

        let err = appender.append(&[sample(1, "a", 20.0)]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(
            fs::read_to_string(path.join("keep.txt")).unwrap(),
            "untouched\n"
        );
    }

    #[test]
    fn test_log_dir_blocked_by_file_leaves_it_intact() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("logs");
        fs::write(&blocker, "pid,name\n1,a\n").unwrap();
        let appender = appender(&blocker, LogFormat::Numeric);

        let err = appender.append(&[sample(2, "b", 30.0)]).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(fs::read_to_string(&blocker).unwrap(), "pid,name\n1,a\n");
    }

    #[test]
    fn test_new_rejects_bad_configuration() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LogAppender::new(dir.path(), "", LogFormat::Human, vec![Column::Pid]).is_err());
        assert!(LogAppender::new(
            dir.path(),
            "cpu_log",
            LogFormat::Human,
            vec![Column::Name, Column::Pid]
        )
        .is_err());
    }
}
