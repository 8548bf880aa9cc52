// Copyright (c) Abstract Machines

mod cli;

use crate::cli::{Cli, Command};
use anyhow::{Context, Result};
use clap::Parser;
use cpuhog::analysis::{self, AnalysisOptions};
use cpuhog::{Collector, CpuhogConfig, Sampler, StopReason, SysinfoSource};
use std::path::Path;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = CpuhogConfig::load(cli.config.as_deref()).context("loading configuration")?;
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }

    // Initialize logging
    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Command::Monitor(args) => {
            args.apply(&mut config).context("invalid monitor options")?;
            monitor(&config).await
        }
        Command::Analyze { log, report } => {
            report.apply(&mut config).context("invalid report options")?;
            analyze(&log, &config.analysis_options(), &config.output_dir)
        }
        Command::Compare {
            log_a,
            log_b,
            report,
        } => {
            report.apply(&mut config).context("invalid report options")?;
            compare(&log_a, &log_b, &config.analysis_options(), &config.output_dir)
        }
    }
}

async fn monitor(config: &CpuhogConfig) -> Result<()> {
    let appender = config.appender()?;
    info!(
        "Logging processes above {:.1}% CPU to {}",
        config.threshold,
        appender.current_path().display()
    );

    let source = SysinfoSource::new(config.normalize_cpu);
    let sampler = Sampler::new(source, config.sampler_config());
    let mut collector = Collector::new(sampler, appender, config.collector_config());

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let summary = collector.run(shutdown).await?;
    info!(
        "Stopped ({:?}) after {} ticks: {} rows written, {} failed ticks",
        summary.stop_reason, summary.ticks, summary.rows_written, summary.failures
    );

    if summary.stop_reason == StopReason::BudgetExhausted {
        tracing::warn!("Failure budget exhausted; check permissions and disk space");
    }
    Ok(())
}

fn analyze(log: &Path, options: &AnalysisOptions, output_dir: &Path) -> Result<()> {
    let report = analysis::analyze(log, options)
        .with_context(|| format!("analysing {}", log.display()))?;

    let out = output_dir.join(analysis::analysis_file_name(log));
    analysis::write_json(&report, &out)?;
    info!(
        "Wrote analysis of {} processes to {}",
        report.processes.len(),
        out.display()
    );
    Ok(())
}

fn compare(
    log_a: &Path,
    log_b: &Path,
    options: &AnalysisOptions,
    output_dir: &Path,
) -> Result<()> {
    let report = analysis::compare(log_a, log_b, options)
        .with_context(|| format!("comparing {} and {}", log_a.display(), log_b.display()))?;

    let out = output_dir.join(analysis::comparison_file_name(&report));
    analysis::write_json(&report, &out)?;
    info!(
        "Wrote comparison of {} processes to {}",
        report.processes.len(),
        out.display()
    );
    Ok(())
}
