// Copyright (c) Abstract Machines

use clap::{Args, Parser, Subcommand};
use cpuhog::{Column, CpuhogConfig, LogFormat};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(
    name = "cpuhog",
    about = "Log processes that hog the CPU and summarise the logs",
    version
)]
pub struct Cli {
    /// TOML config file (default: cpuhog.toml if present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// trace, debug, info, warn or error
    #[arg(long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Sample the process table and append busy processes to the log.
    Monitor(MonitorArgs),
    /// Aggregate one numeric log into series and histograms.
    Analyze {
        log: PathBuf,
        #[command(flatten)]
        report: ReportArgs,
    },
    /// Compare two numeric logs process by process.
    Compare {
        log_a: PathBuf,
        log_b: PathBuf,
        #[command(flatten)]
        report: ReportArgs,
    },
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// Seconds between samples in live-update mode
    #[arg(short, long)]
    pub delay: Option<u64>,

    /// Rows shown in the per-tick debug listing, 0 for all
    #[arg(short = 'n', long = "max-records")]
    pub max_records: Option<usize>,

    /// Only log processes above this CPU percentage
    #[arg(short, long)]
    pub threshold: Option<f64>,

    /// Log file prefix; the date is appended
    #[arg(short, long)]
    pub filename: Option<String>,

    /// Comma-separated columns; pid always comes first
    #[arg(short, long)]
    pub columns: Option<String>,

    /// Column to sort by
    #[arg(short, long = "sort-by")]
    pub sort_by: Option<String>,

    /// Sort ascending instead of descending
    #[arg(long)]
    pub ascending: bool,

    /// Keep sampling until interrupted
    #[arg(short = 'u', long = "live-update")]
    pub live_update: bool,

    /// human (byte sizes like 12.34MB) or numeric
    #[arg(long)]
    pub format: Option<String>,

    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,

    /// Stop after this many ticks
    #[arg(long)]
    pub count: Option<u64>,

    /// Report CPU as a share of all cores instead of one core
    #[arg(long = "normalize-cpu")]
    pub normalize_cpu: bool,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    /// Ignore rows at or below this CPU percentage
    #[arg(long = "min-cpu")]
    pub min_cpu: Option<f64>,

    /// Rolling mean window, in samples
    #[arg(long)]
    pub window: Option<usize>,

    #[arg(long)]
    pub bins: Option<usize>,

    /// Process name to report on; repeat for more
    #[arg(short, long = "watch")]
    pub watch: Vec<String>,

    /// Where the JSON report is written
    #[arg(long = "output-dir")]
    pub output_dir: Option<PathBuf>,
}

impl MonitorArgs {
    pub fn apply(&self, config: &mut CpuhogConfig) -> cpuhog::Result<()> {
        if let Some(delay) = self.delay {
            config.delay = delay;
        }
        if let Some(max_records) = self.max_records {
            config.max_records = max_records;
        }
        if let Some(threshold) = self.threshold {
            config.threshold = threshold;
        }
        if let Some(filename) = &self.filename {
            config.filename = filename.clone();
        }
        if let Some(columns) = &self.columns {
            config.columns = Column::parse_list(columns)?;
        }
        if let Some(sort_by) = &self.sort_by {
            config.sort_by = sort_by.parse()?;
        }
        if self.ascending {
            config.descending = false;
        }
        if self.live_update {
            config.live_update = true;
        }
        if let Some(format) = &self.format {
            config.format = format.parse::<LogFormat>()?;
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(count) = self.count {
            config.max_ticks = count;
        }
        if self.normalize_cpu {
            config.normalize_cpu = true;
        }
        config.validate()
    }
}

impl ReportArgs {
    pub fn apply(&self, config: &mut CpuhogConfig) -> cpuhog::Result<()> {
        if let Some(min_cpu) = self.min_cpu {
            config.min_cpu = min_cpu;
        }
        if let Some(window) = self.window {
            config.rolling_window = window;
        }
        if let Some(bins) = self.bins {
            config.histogram_bins = bins;
        }
        if !self.watch.is_empty() {
            config.watchlist = self.watch.clone();
        }
        if let Some(dir) = &self.output_dir {
            config.output_dir = dir.clone();
        }
        config.validate()
    }
}
