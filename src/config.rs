// Copyright (c) Abstract Machines

use crate::analysis::AnalysisOptions;
use crate::appender::LogAppender;
use crate::collector::CollectorConfig;
use crate::error::{Error, Result};
use crate::sample::{Column, LogFormat};
use crate::sampler::SamplerConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_PATH: &str = "cpuhog.toml";
const DEFAULT_CONFIG_SECTION: &str = "cpuhog";

/// Fields that can be set from the TOML file. Anything left out keeps its
/// default.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub log_level: Option<String>,
    pub delay: Option<u64>,
    pub error_backoff_ms: Option<u64>,
    pub failure_budget: Option<u32>,
    pub live_update: Option<bool>,
    pub max_ticks: Option<u64>,
    pub threshold: Option<f64>,
    pub max_records: Option<usize>,
    pub sort_by: Option<String>,
    pub descending: Option<bool>,
    pub columns: Option<String>,
    pub filename: Option<String>,
    pub output_dir: Option<String>,
    pub format: Option<String>,
    pub normalize_cpu: Option<bool>,
    pub min_cpu: Option<f64>,
    pub rolling_window: Option<usize>,
    pub histogram_bins: Option<usize>,
    pub top_n: Option<usize>,
    pub watchlist: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CpuhogConfig {
    pub log_level: String,
    /// Seconds between ticks in live-update mode.
    pub delay: u64,
    pub error_backoff_ms: u64,
    pub failure_budget: u32,
    pub live_update: bool,
    /// Stop after this many ticks, 0 for no limit.
    pub max_ticks: u64,
    pub threshold: f64,
    pub max_records: usize,
    pub sort_by: Column,
    pub descending: bool,
    pub columns: Vec<Column>,
    pub filename: String,
    pub output_dir: PathBuf,
    pub format: LogFormat,
    pub normalize_cpu: bool,
    pub min_cpu: f64,
    pub rolling_window: usize,
    pub histogram_bins: usize,
    pub top_n: usize,
    pub watchlist: Vec<String>,
}

impl Default for CpuhogConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            delay: 10,
            error_backoff_ms: 1000,
            failure_budget: 100,
            live_update: false,
            max_ticks: 0,
            threshold: 10.0,
            max_records: 25,
            sort_by: Column::CpuUsage,
            descending: true,
            columns: Column::default_columns(),
            filename: "cpu_log".to_string(),
            output_dir: PathBuf::from("."),
            format: LogFormat::Human,
            normalize_cpu: false,
            min_cpu: 20.0,
            rolling_window: 40,
            histogram_bins: 50,
            top_n: 10,
            watchlist: Vec::new(),
        }
    }
}

impl CpuhogConfig {
    /// Defaults, then the TOML file, then `CPUHOG_*` environment variables.
    ///
    /// An explicitly named file must exist; the default `cpuhog.toml` is
    /// optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (config_path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match env::var("CPUHOG_CONFIG_FILE") {
                Ok(p) if !p.is_empty() => (PathBuf::from(p), true),
                _ => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
            },
        };

        let mut config = if config_path.exists() {
            Self::from_toml_file(&config_path)?
        } else if explicit {
            return Err(Error::Configuration(format!(
                "config file '{}' not accessible",
                config_path.display()
            )));
        } else {
            Self::default()
        };

        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with the file's section, without the environment.
    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let mut config = Self::default();
        config.apply_file(Self::from_file(path)?)?;
        Ok(config)
    }

    fn from_file(path: &Path) -> Result<FileConfig> {
        let contents = std::fs::read_to_string(path)?;
        let config: HashMap<String, toml::Value> = toml::from_str(&contents)?;

        let section = env::var("CPUHOG_CONFIG_SECTION")
            .unwrap_or_else(|_| DEFAULT_CONFIG_SECTION.to_string());

        let section_value = config.get(&section).ok_or_else(|| {
            Error::Configuration(format!("config section '{section}' not found in TOML file"))
        })?;

        section_value.clone().try_into().map_err(|e| {
            Error::Configuration(format!("failed to parse config section '{section}': {e}"))
        })
    }

    pub fn apply_file(&mut self, file: FileConfig) -> Result<()> {
        if let Some(v) = file.log_level {
            self.log_level = v;
        }
        if let Some(v) = file.delay {
            self.delay = v;
        }
        if let Some(v) = file.error_backoff_ms {
            self.error_backoff_ms = v;
        }
        if let Some(v) = file.failure_budget {
            self.failure_budget = v;
        }
        if let Some(v) = file.live_update {
            self.live_update = v;
        }
        if let Some(v) = file.max_ticks {
            self.max_ticks = v;
        }
        if let Some(v) = file.threshold {
            self.threshold = v;
        }
        if let Some(v) = file.max_records {
            self.max_records = v;
        }
        if let Some(v) = file.sort_by {
            self.sort_by = v.parse()?;
        }
        if let Some(v) = file.descending {
            self.descending = v;
        }
        if let Some(v) = file.columns {
            self.columns = Column::parse_list(&v)?;
        }
        if let Some(v) = file.filename {
            self.filename = v;
        }
        if let Some(v) = file.output_dir {
            self.output_dir = PathBuf::from(v);
        }
        if let Some(v) = file.format {
            self.format = v.parse()?;
        }
        if let Some(v) = file.normalize_cpu {
            self.normalize_cpu = v;
        }
        if let Some(v) = file.min_cpu {
            self.min_cpu = v;
        }
        if let Some(v) = file.rolling_window {
            self.rolling_window = v;
        }
        if let Some(v) = file.histogram_bins {
            self.histogram_bins = v;
        }
        if let Some(v) = file.top_n {
            self.top_n = v;
        }
        if let Some(v) = file.watchlist {
            self.watchlist = v;
        }
        Ok(())
    }

    /// Applies `CPUHOG_*` variables. Values that fail to parse are ignored.
    pub fn apply_env(&mut self) {
        if let Ok(val) = env::var("CPUHOG_LOG_LEVEL") {
            if !val.is_empty() {
                self.log_level = val;
            }
        }

        if let Ok(val) = env::var("CPUHOG_DELAY") {
            if let Ok(delay) = val.parse() {
                self.delay = delay;
            }
        }

        if let Ok(val) = env::var("CPUHOG_ERROR_BACKOFF_MS") {
            if let Ok(backoff) = val.parse() {
                self.error_backoff_ms = backoff;
            }
        }

        if let Ok(val) = env::var("CPUHOG_MAX_TICKS") {
            if let Ok(max_ticks) = val.parse() {
                self.max_ticks = max_ticks;
            }
        }

        if let Ok(val) = env::var("CPUHOG_FAILURE_BUDGET") {
            if let Ok(budget) = val.parse() {
                self.failure_budget = budget;
            }
        }

        if let Ok(val) = env::var("CPUHOG_LIVE_UPDATE") {
            self.live_update = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("CPUHOG_THRESHOLD") {
            if let Ok(threshold) = val.parse() {
                self.threshold = threshold;
            }
        }

        if let Ok(val) = env::var("CPUHOG_MAX_RECORDS") {
            if let Ok(max_records) = val.parse() {
                self.max_records = max_records;
            }
        }

        if let Ok(val) = env::var("CPUHOG_SORT_BY") {
            if let Ok(column) = val.parse() {
                self.sort_by = column;
            }
        }

        if let Ok(val) = env::var("CPUHOG_DESCENDING") {
            self.descending = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("CPUHOG_COLUMNS") {
            if let Ok(columns) = Column::parse_list(&val) {
                self.columns = columns;
            }
        }

        if let Ok(val) = env::var("CPUHOG_FILENAME") {
            if !val.is_empty() {
                self.filename = val;
            }
        }

        if let Ok(val) = env::var("CPUHOG_OUTPUT_DIR") {
            if !val.is_empty() {
                self.output_dir = PathBuf::from(val);
            }
        }

        if let Ok(val) = env::var("CPUHOG_FORMAT") {
            if let Ok(format) = val.parse() {
                self.format = format;
            }
        }

        if let Ok(val) = env::var("CPUHOG_NORMALIZE_CPU") {
            self.normalize_cpu = val.to_lowercase() == "true" || val == "1";
        }

        if let Ok(val) = env::var("CPUHOG_MIN_CPU") {
            if let Ok(min_cpu) = val.parse() {
                self.min_cpu = min_cpu;
            }
        }

        if let Ok(val) = env::var("CPUHOG_ROLLING_WINDOW") {
            if let Ok(window) = val.parse() {
                self.rolling_window = window;
            }
        }

        if let Ok(val) = env::var("CPUHOG_HISTOGRAM_BINS") {
            if let Ok(bins) = val.parse() {
                self.histogram_bins = bins;
            }
        }

        if let Ok(val) = env::var("CPUHOG_TOP_N") {
            if let Ok(top_n) = val.parse() {
                self.top_n = top_n;
            }
        }

        if let Ok(val) = env::var("CPUHOG_WATCHLIST") {
            self.watchlist = val
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold < 0.0 {
            return Err(Error::Configuration(format!(
                "threshold must be a non-negative number, got {}",
                self.threshold
            )));
        }
        if self.rolling_window == 0 {
            return Err(Error::Configuration("rolling window must be at least 1".into()));
        }
        if self.histogram_bins == 0 {
            return Err(Error::Configuration("histogram bins must be at least 1".into()));
        }
        if self.filename.trim().is_empty() {
            return Err(Error::Configuration("log filename must not be empty".into()));
        }
        Ok(())
    }

    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            threshold: self.threshold,
            max_records: self.max_records,
            sort_by: self.sort_by,
            descending: self.descending,
        }
    }

    pub fn collector_config(&self) -> CollectorConfig {
        CollectorConfig {
            delay: self.delay(),
            error_backoff: self.error_backoff(),
            failure_budget: self.failure_budget,
            live_update: self.live_update,
            max_ticks: (self.max_ticks > 0).then_some(self.max_ticks),
        }
    }

    pub fn appender(&self) -> Result<LogAppender> {
        LogAppender::new(
            &self.output_dir,
            &self.filename,
            self.format,
            self.columns.clone(),
        )
    }

    pub fn analysis_options(&self) -> AnalysisOptions {
        AnalysisOptions {
            min_cpu: self.min_cpu,
            window: self.rolling_window,
            bins: self.histogram_bins,
            top_n: self.top_n,
            watchlist: self.watchlist.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    #[test]
    fn test_cpuhog_config_default() {
        let config = CpuhogConfig::default();

        assert_eq!(config.log_level, "info");
        assert_eq!(config.delay, 10);
        assert_eq!(config.failure_budget, 100);
        assert_eq!(config.threshold, 10.0);
        assert_eq!(config.max_records, 25);
        assert_eq!(config.filename, "cpu_log");
        assert_eq!(config.format, LogFormat::Human);
        assert_eq!(config.columns[0], Column::Pid);
        assert!(!config.live_update);
        assert!(config.watchlist.is_empty());
    }

    #[test]
    fn test_cpuhog_config_durations() {
        let config = CpuhogConfig {
            delay: 15,
            error_backoff_ms: 250,
            ..Default::default()
        };

        assert_eq!(config.delay(), Duration::from_secs(15));
        assert_eq!(config.error_backoff(), Duration::from_millis(250));
    }

    #[test]
    fn test_collector_config_max_ticks() {
        let unlimited = CpuhogConfig::default().collector_config();
        assert_eq!(unlimited.max_ticks, None);

        let limited = CpuhogConfig {
            max_ticks: 3,
            ..Default::default()
        }
        .collector_config();
        assert_eq!(limited.max_ticks, Some(3));
    }

    #[test]
    fn test_apply_file_overrides() {
        let mut config = CpuhogConfig::default();
        let file = FileConfig {
            threshold: Some(15.0),
            columns: Some("name,cpu_usage".to_string()),
            format: Some("numeric".to_string()),
            sort_by: Some("memory_usage".to_string()),
            watchlist: Some(vec!["Firefox".to_string()]),
            ..Default::default()
        };

        config.apply_file(file).unwrap();

        assert_eq!(config.threshold, 15.0);
        assert_eq!(
            config.columns,
            vec![Column::Pid, Column::Name, Column::CpuUsage]
        );
        assert_eq!(config.format, LogFormat::Numeric);
        assert_eq!(config.sort_by, Column::MemoryUsage);
        assert_eq!(config.watchlist, vec!["Firefox".to_string()]);
        assert_eq!(config.delay, 10);
    }

    #[test]
    fn test_apply_file_rejects_bad_column() {
        let mut config = CpuhogConfig::default();
        let file = FileConfig {
            columns: Some("name,nonsense".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            config.apply_file(file),
            Err(Error::UnknownColumn(_))
        ));
    }

    #[test]
    fn test_from_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuhog.toml");
        std::fs::write(
            &path,
            "[cpuhog]\ndelay = 15\nthreshold = 12.5\nlive_update = true\nwatchlist = [\"teams\", \"pycharm\"]\n",
        )
        .unwrap();

        let config = CpuhogConfig::from_toml_file(&path).unwrap();

        assert_eq!(config.delay, 15);
        assert_eq!(config.threshold, 12.5);
        assert!(config.live_update);
        assert_eq!(config.watchlist, vec!["teams", "pycharm"]);
    }

    #[test]
    fn test_load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        assert!(matches!(
            CpuhogConfig::load(Some(&path)),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_load_missing_section_fails() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuhog.toml");
        std::fs::write(&path, "[other]\ndelay = 1\n").unwrap();

        assert!(CpuhogConfig::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_load_rejects_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cpuhog.toml");
        std::fs::write(&path, "[cpuhog]\ndelya = 1\n").unwrap();

        assert!(CpuhogConfig::from_toml_file(&path).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let config = CpuhogConfig {
            rolling_window: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = CpuhogConfig {
            threshold: -1.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cpuhog_config_from_env_threshold() {
        env::set_var("CPUHOG_THRESHOLD", "42.5");
        let mut config = CpuhogConfig::default();
        config.apply_env();
        env::remove_var("CPUHOG_THRESHOLD");

        assert_eq!(config.threshold, 42.5);
    }

    #[test]
    fn test_cpuhog_config_from_env_delay_invalid() {
        env::set_var("CPUHOG_DELAY", "soon");
        let mut config = CpuhogConfig::default();
        config.apply_env();
        env::remove_var("CPUHOG_DELAY");

        assert_eq!(config.delay, 10);
    }

    #[test]
    fn test_cpuhog_config_from_env_live_update() {
        env::set_var("CPUHOG_LIVE_UPDATE", "TRUE");
        let mut config = CpuhogConfig::default();
        config.apply_env();
        env::remove_var("CPUHOG_LIVE_UPDATE");

        assert!(config.live_update);
    }

    #[test]
    fn test_cpuhog_config_from_env_watchlist() {
        env::set_var("CPUHOG_WATCHLIST", "teams, ,kernel_task");
        let mut config = CpuhogConfig::default();
        config.apply_env();
        env::remove_var("CPUHOG_WATCHLIST");

        assert_eq!(config.watchlist, vec!["teams", "kernel_task"]);
    }

    #[test]
    fn test_cpuhog_config_from_env_format() {
        env::set_var("CPUHOG_FORMAT", "numeric");
        let mut config = CpuhogConfig::default();
        config.apply_env();
        env::remove_var("CPUHOG_FORMAT");

        assert_eq!(config.format, LogFormat::Numeric);
    }

    #[test]
    fn test_cpuhog_config_from_env_loop_and_report_keys() {
        let vars = [
            ("CPUHOG_ERROR_BACKOFF_MS", "250"),
            ("CPUHOG_MAX_TICKS", "12"),
            ("CPUHOG_DESCENDING", "false"),
            ("CPUHOG_ROLLING_WINDOW", "5"),
            ("CPUHOG_HISTOGRAM_BINS", "20"),
            ("CPUHOG_TOP_N", "3"),
        ];
        for (key, value) in vars {
            env::set_var(key, value);
        }
        let mut config = CpuhogConfig::default();
        config.apply_env();
        for (key, _) in vars {
            env::remove_var(key);
        }

        assert_eq!(config.error_backoff(), Duration::from_millis(250));
        assert_eq!(config.max_ticks, 12);
        assert!(!config.descending);
        assert_eq!(config.rolling_window, 5);
        assert_eq!(config.histogram_bins, 20);
        assert_eq!(config.top_n, 3);
    }
}
