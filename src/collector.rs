// Copyright (c) Abstract Machines

use crate::appender::LogAppender;
use crate::error::Result;
use crate::sample::format_bytes;
use crate::sampler::Sampler;
use crate::source::ProcessSource;
use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Sampling,
    Filtering,
    Persisting,
    Sleeping,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Live updates disabled; the single initial pass completed.
    OneShot,
    TickLimit,
    Shutdown,
    /// Too many consecutive failed ticks.
    BudgetExhausted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CollectorConfig {
    pub delay: Duration,
    pub error_backoff: Duration,
    /// Consecutive failed ticks tolerated before the loop gives up.
    pub failure_budget: u32,
    pub live_update: bool,
    pub max_ticks: Option<u64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            delay: Duration::from_secs(10),
            error_backoff: Duration::from_secs(1),
            failure_budget: 100,
            live_update: false,
            max_ticks: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub seen: usize,
    pub accepted: usize,
    pub rows_written: usize,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub ticks: u64,
    pub rows_written: usize,
    pub failures: u64,
    pub stop_reason: StopReason,
}

/// Drives the sampler and appender on a fixed delay.
///
/// An initial pass always runs. With live updates enabled the loop keeps
/// going until shutdown, the tick limit, or `failure_budget` consecutive
/// failures have been exceeded. Every tick error is tolerated in live mode:
/// it is logged, the next tick waits `error_backoff` instead of `delay`, and a
/// successful tick resets the count.
pub struct Collector<S> {
    sampler: Sampler<S>,
    appender: LogAppender,
    config: CollectorConfig,
    state: LoopState,
    consecutive_failures: u32,
    failures: u64,
    rows_written: usize,
}

impl<S: ProcessSource> Collector<S> {
    pub fn new(sampler: Sampler<S>, appender: LogAppender, config: CollectorConfig) -> Self {
        Self {
            sampler,
            appender,
            config,
            state: LoopState::Idle,
            consecutive_failures: 0,
            failures: 0,
            rows_written: 0,
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn sampler(&self) -> &Sampler<S> {
        &self.sampler
    }

    pub fn appender(&self) -> &LogAppender {
        &self.appender
    }

    fn transition(&mut self, next: LoopState) {
        if self.state != next {
            debug!("collector {:?} -> {:?}", self.state, next);
            self.state = next;
        }
    }

    /// One Sampling → Filtering → Persisting pass.
    pub fn tick(&mut self) -> Result<TickReport> {
        self.transition(LoopState::Sampling);
        let snapshot = self.sampler.snapshot()?;

        self.transition(LoopState::Filtering);
        let selected = self.sampler.select(snapshot.samples);
        debug!(
            "tick {}: {} processes, {} vanished, {} degraded fields, {} above {:.1}%",
            snapshot.tick,
            snapshot.stats.seen,
            snapshot.stats.vanished,
            snapshot.stats.degraded_fields,
            selected.len(),
            self.sampler.config().threshold
        );
        for sample in self.sampler.preview(&selected) {
            debug!(
                "  {:>7} {:<24} {:>7.2}% {:>10} {:>3} threads",
                sample.pid,
                sample.name,
                sample.cpu_usage,
                format_bytes(sample.memory_usage),
                sample.n_threads
            );
        }

        self.transition(LoopState::Persisting);
        let (rows_written, path) = if selected.is_empty() {
            (0, None)
        } else {
            let outcome = self.appender.append(&selected)?;
            (outcome.rows, Some(outcome.path))
        };
        self.rows_written += rows_written;

        Ok(TickReport {
            tick: snapshot.tick,
            seen: snapshot.stats.seen,
            accepted: selected.len(),
            rows_written,
            path,
        })
    }

    /// Runs the initial pass and, in live mode, the repeating cycle until
    /// `shutdown` resolves or another stop condition is met.
    ///
    /// Without live updates, an error from the single pass is returned.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let first = self.tick();
        if !self.config.live_update {
            self.transition(LoopState::Stopped);
            first?;
            return Ok(self.summary(StopReason::OneShot));
        }
        self.record(first);

        let stop_reason = loop {
            if self.consecutive_failures > self.config.failure_budget {
                warn!(
                    "Giving up after {} consecutive failed ticks",
                    self.consecutive_failures
                );
                break StopReason::BudgetExhausted;
            }

            if let Some(max_ticks) = self.config.max_ticks {
                if self.sampler.ticks() >= max_ticks {
                    break StopReason::TickLimit;
                }
            }

            let pause = if self.consecutive_failures > 0 {
                self.config.error_backoff
            } else {
                self.config.delay
            };

            self.transition(LoopState::Sleeping);
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, stopping collection");
                    break StopReason::Shutdown;
                }
                _ = tokio::time::sleep(pause) => {}
            }

            let result = self.tick();
            self.record(result);
        };

        self.transition(LoopState::Stopped);
        Ok(self.summary(stop_reason))
    }

    fn record(&mut self, result: Result<TickReport>) {
        match result {
            Ok(report) => {
                self.consecutive_failures = 0;
                if report.rows_written > 0 {
                    info!(
                        "tick {}: logged {} of {} processes",
                        report.tick, report.rows_written, report.seen
                    );
                }
            }
            Err(e) => {
                self.failures += 1;
                self.consecutive_failures += 1;
                error!(
                    "tick {} failed ({}/{} consecutive): {}",
                    self.sampler.ticks(),
                    self.consecutive_failures,
                    self.config.failure_budget,
                    e
                );
            }
        }
    }

    fn summary(&self, stop_reason: StopReason) -> RunSummary {
        RunSummary {
            ticks: self.sampler.ticks(),
            rows_written: self.rows_written,
            failures: self.failures,
            stop_reason,
        }
    }
}
