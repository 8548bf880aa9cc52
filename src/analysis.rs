// Copyright (c) Abstract Machines

//! Aggregation of numeric sample logs into the series a report renderer
//! draws: per-process CPU over time, rolling means and histograms, for one
//! log or two logs side by side.

use crate::error::{Error, Result};
use crate::sample::TIMESTAMP_FORMAT;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisOptions {
    /// Rows at or below this CPU percentage are ignored.
    pub min_cpu: f64,
    pub window: usize,
    pub bins: usize,
    /// Number of busiest processes reported when the watchlist is empty.
    pub top_n: usize,
    pub watchlist: Vec<String>,
}

impl Default for AnalysisOptions {
    fn default() -> Self {
        Self {
            min_cpu: 20.0,
            window: 40,
            bins: 50,
            top_n: 10,
            watchlist: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub name: String,
    pub cpu_usage: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SeriesPoint {
    pub timestamp: NaiveDateTime,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Histogram {
    /// `counts.len() + 1` bin edges.
    pub edges: Vec<f64>,
    pub counts: Vec<f64>,
    pub density: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub name: String,
    pub series: Vec<SeriesPoint>,
    pub rolling_mean: Vec<SeriesPoint>,
    pub histogram: Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisReport {
    pub source: PathBuf,
    pub rows: usize,
    pub watchlist: Vec<String>,
    pub total: Vec<SeriesPoint>,
    pub total_rolling_mean: Vec<SeriesPoint>,
    pub processes: Vec<ProcessReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparedProcess {
    pub name: String,
    pub rolling_mean_a: Vec<SeriesPoint>,
    pub rolling_mean_b: Vec<SeriesPoint>,
    pub histogram_a: Histogram,
    pub histogram_b: Histogram,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonReport {
    pub legend_a: String,
    pub legend_b: String,
    pub watchlist: Vec<String>,
    pub processes: Vec<ComparedProcess>,
}

/// Reads a numeric log, keeping rows with `cpu_usage > min_cpu`, sorted by
/// timestamp. Columns are located by header name; extra columns are ignored.
pub fn load_log(path: &Path, min_cpu: f64) -> Result<Vec<LogRecord>> {
    if !path.exists() {
        return Err(Error::MissingLog(path.to_path_buf()));
    }

    let mut reader = csv::ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| {
        headers
            .iter()
            .position(|h| h.trim() == name)
            .ok_or_else(|| Error::LogParse {
                path: path.to_path_buf(),
                line: 1,
                reason: format!("missing '{name}' column"),
            })
    };
    let ts_idx = column("timestamp")?;
    let name_idx = column("name")?;
    let cpu_idx = column("cpu_usage")?;

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        let parse_err = |reason: String| Error::LogParse {
            path: path.to_path_buf(),
            line,
            reason,
        };

        let field = |idx: usize| row.get(idx).map(str::trim).unwrap_or_default();

        let timestamp = NaiveDateTime::parse_from_str(field(ts_idx), TIMESTAMP_FORMAT)
            .map_err(|e| parse_err(format!("bad timestamp '{}': {e}", field(ts_idx))))?;
        let cpu_usage: f64 = field(cpu_idx)
            .parse()
            .map_err(|e| parse_err(format!("bad cpu_usage '{}': {e}", field(cpu_idx))))?;
        if !cpu_usage.is_finite() {
            return Err(parse_err(format!("non-finite cpu_usage '{}'", field(cpu_idx))));
        }

        if cpu_usage > min_cpu {
            records.push(LogRecord {
                timestamp,
                name: field(name_idx).to_lowercase(),
                cpu_usage,
            });
        }
    }

    records.sort_by_key(|r| r.timestamp);
    debug!(
        "Loaded {} rows above {:.1}% from {}",
        records.len(),
        min_cpu,
        path.display()
    );
    Ok(records)
}

/// Lower-cases, trims and de-duplicates names, keeping first occurrences.
pub fn normalize_names(names: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(names.len());
    for name in names {
        let name = name.trim().to_lowercase();
        if !name.is_empty() && !out.contains(&name) {
            out.push(name);
        }
    }
    out
}

/// The configured watchlist, or the `top_n` names with the highest total CPU
/// when none is configured.
pub fn resolve_watchlist(records: &[LogRecord], options: &AnalysisOptions) -> Vec<String> {
    let configured = normalize_names(&options.watchlist);
    if !configured.is_empty() {
        return configured;
    }

    let mut totals: HashMap<&str, f64> = HashMap::new();
    for record in records {
        *totals.entry(record.name.as_str()).or_default() += record.cpu_usage;
    }

    let mut ranked: Vec<(&str, f64)> = totals.into_iter().collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    ranked
        .into_iter()
        .take(options.top_n)
        .map(|(name, _)| name.to_string())
        .collect()
}

fn sum_by_timestamp<'a>(records: impl Iterator<Item = &'a LogRecord>) -> Vec<SeriesPoint> {
    let mut sums: BTreeMap<NaiveDateTime, f64> = BTreeMap::new();
    for record in records {
        *sums.entry(record.timestamp).or_default() += record.cpu_usage;
    }
    sums.into_iter()
        .map(|(timestamp, value)| SeriesPoint { timestamp, value })
        .collect()
}

/// Summed CPU of all processes per timestamp.
pub fn total_series(records: &[LogRecord]) -> Vec<SeriesPoint> {
    sum_by_timestamp(records.iter())
}

/// For each watched name, its summed CPU per timestamp. Order follows the
/// watchlist.
pub fn group_by_process(
    records: &[LogRecord],
    watchlist: &[String],
) -> Vec<(String, Vec<SeriesPoint>)> {
    watchlist
        .iter()
        .map(|name| {
            let points = sum_by_timestamp(records.iter().filter(|r| &r.name == name));
            (name.clone(), points)
        })
        .collect()
}

/// Trailing mean over `window` points, stamped with the last point of each
/// window. Nothing is emitted until a full window is available.
pub fn rolling_mean(points: &[SeriesPoint], window: usize) -> Vec<SeriesPoint> {
    if window == 0 || points.len() < window {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(points.len() - window + 1);
    let mut sum: f64 = points[..window].iter().map(|p| p.value).sum();
    out.push(SeriesPoint {
        timestamp: points[window - 1].timestamp,
        value: sum / window as f64,
    });

    for i in window..points.len() {
        sum += points[i].value - points[i - window].value;
        out.push(SeriesPoint {
            timestamp: points[i].timestamp,
            value: sum / window as f64,
        });
    }
    out
}

/// Equal-width histogram over the range of `values`.
pub fn histogram(values: &[f64], bins: usize, density: bool) -> Histogram {
    let lo = values.iter().copied().fold(f64::INFINITY, f64::min);
    let hi = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    if values.is_empty() {
        return Histogram {
            edges: Vec::new(),
            counts: Vec::new(),
            density,
        };
    }
    histogram_in_range(values, bins, lo, hi, density)
}

/// Equal-width histogram over `[lo, hi]`; values outside are ignored and the
/// last bin is closed. A degenerate range is widened by 0.5 on each side.
pub fn histogram_in_range(values: &[f64], bins: usize, lo: f64, hi: f64, density: bool) -> Histogram {
    let bins = bins.max(1);
    let (lo, hi) = if hi > lo { (lo, hi) } else { (lo - 0.5, hi + 0.5) };
    let width = (hi - lo) / bins as f64;

    let edges: Vec<f64> = (0..=bins).map(|i| lo + width * i as f64).collect();
    let mut counts = vec![0.0; bins];
    let mut total = 0usize;

    for &value in values {
        if !(lo..=hi).contains(&value) {
            continue;
        }
        let idx = (((value - lo) / width) as usize).min(bins - 1);
        counts[idx] += 1.0;
        total += 1;
    }

    if density && total > 0 {
        let scale = total as f64 * width;
        for count in &mut counts {
            *count /= scale;
        }
    }

    Histogram {
        edges,
        counts,
        density,
    }
}

fn values(points: &[SeriesPoint]) -> Vec<f64> {
    points.iter().map(|p| p.value).collect()
}

pub fn analyze(path: &Path, options: &AnalysisOptions) -> Result<AnalysisReport> {
    let records = load_log(path, options.min_cpu)?;
    let watchlist = resolve_watchlist(&records, options);
    info!(
        "Analysing {} rows from {} for {} processes",
        records.len(),
        path.display(),
        watchlist.len()
    );

    let total = total_series(&records);
    let total_rolling_mean = rolling_mean(&total, options.window);

    let mut processes = Vec::new();
    for (name, series) in group_by_process(&records, &watchlist) {
        if series.is_empty() {
            warn!("No samples for '{}' in {}", name, path.display());
            continue;
        }
        processes.push(ProcessReport {
            rolling_mean: rolling_mean(&series, options.window),
            histogram: histogram(&values(&series), options.bins, false),
            name,
            series,
        });
    }

    Ok(AnalysisReport {
        source: path.to_path_buf(),
        rows: records.len(),
        watchlist,
        total,
        total_rolling_mean,
        processes,
    })
}

pub fn compare(path_a: &Path, path_b: &Path, options: &AnalysisOptions) -> Result<ComparisonReport> {
    let records_a = load_log(path_a, options.min_cpu)?;
    let records_b = load_log(path_b, options.min_cpu)?;

    let combined: Vec<LogRecord> = records_a.iter().chain(records_b.iter()).cloned().collect();
    let watchlist = resolve_watchlist(&combined, options);

    let series_a = group_by_process(&records_a, &watchlist);
    let series_b = group_by_process(&records_b, &watchlist);

    let mut processes = Vec::new();
    for ((name, a), (_, b)) in series_a.into_iter().zip(series_b) {
        if a.is_empty() || b.is_empty() {
            debug!("Skipping '{}': not present in both logs", name);
            continue;
        }

        let (values_a, values_b) = (values(&a), values(&b));
        let lo = values_a
            .iter()
            .chain(&values_b)
            .copied()
            .fold(f64::INFINITY, f64::min);
        let hi = values_a
            .iter()
            .chain(&values_b)
            .copied()
            .fold(f64::NEG_INFINITY, f64::max);

        processes.push(ComparedProcess {
            rolling_mean_a: rolling_mean(&a, options.window),
            rolling_mean_b: rolling_mean(&b, options.window),
            histogram_a: histogram_in_range(&values_a, options.bins, lo, hi, true),
            histogram_b: histogram_in_range(&values_b, options.bins, lo, hi, true),
            name,
        });
    }

    Ok(ComparisonReport {
        legend_a: legend_for(path_a),
        legend_b: legend_for(path_b),
        watchlist,
        processes,
    })
}

/// The `YYYY-MM-DD` segment of a log file name, or its stem when there is none.
pub fn legend_for(path: &Path) -> String {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();

    stem.split('_')
        .find(|part| NaiveDate::parse_from_str(part, "%Y-%m-%d").is_ok())
        .map(str::to_string)
        .unwrap_or(stem)
}

pub fn analysis_file_name(log: &Path) -> String {
    let name = log
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    format!("cpu_analysis_of_{name}.json")
}

pub fn comparison_file_name(report: &ComparisonReport) -> String {
    format!(
        "cpu_comparison_of_{}_{}.json",
        report.legend_a, report.legend_b
    )
}

/// Writes `report` as pretty JSON, creating the parent directory if needed.
pub fn write_json<T: Serialize>(report: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    let writer = BufWriter::new(File::create(path)?);
    serde_json::to_writer_pretty(writer, report)?;
    Ok(())
}
