// src/scheduler.rs
//! Sequential execution of a named list of trials.
//!
//! Trials run strictly one after another. The first failing trial ends the
//! sweep; [`ExperimentScheduler::resume`] re-issues the tail of the list from an
//! explicit offset once the operator has dealt with the cause.

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::time::Duration;
use tracing::{error, info};

use crate::trial::TrialSpec;

/// Runs one trial end to end (reconfigure, start, load, stop)
pub trait TrialExecutor {
    fn execute(&mut self, experiment: &str, trial: &TrialSpec) -> Result<()>;
}

/// Accounting for one `run` call
#[derive(Debug, Clone)]
pub struct RunReport {
    pub experiment: String,
    /// Identities of the trials handled, in order
    pub trials: Vec<String>,
    pub started: DateTime<Local>,
    pub finished: DateTime<Local>,
    /// Wall time per executed trial (empty for dry runs)
    pub elapsed: Vec<Duration>,
    pub dry_run: bool,
}

impl RunReport {
    pub fn total_elapsed(&self) -> Duration {
        (self.finished - self.started).to_std().unwrap_or_default()
    }
}

pub struct ExperimentScheduler<E: TrialExecutor> {
    executor: E,
    /// Trials executed over the scheduler's lifetime, across `run` calls
    run_counter: u64,
}

fn banner(line: &str, rule: char) {
    let width = line.chars().count();
    let frame: String = std::iter::repeat(rule).take(width).collect();
    info!("{}", frame);
    info!("{}", line);
    info!("{}", frame);
}

/// `Xm Y.Ys`, as used in per-trial banners
pub fn format_trial_elapsed(d: Duration) -> String {
    let secs = d.as_secs_f64();
    let minutes = d.as_secs() / 60;
    format!("{}m {:.1}s", minutes, secs - (minutes * 60) as f64)
}

/// `Hh Mm Ss`, as used in the sweep summary banner
pub fn format_total_elapsed(d: Duration) -> String {
    let s = d.as_secs();
    format!("{}h {}m {}s", s / 3600, (s % 3600) / 60, s % 60)
}

/// Trials left after the first `done` have completed
pub fn remaining(done: usize, trials: Vec<TrialSpec>) -> Vec<TrialSpec> {
    trials.into_iter().skip(done).collect()
}

impl<E: TrialExecutor> ExperimentScheduler<E> {
    pub fn new(executor: E) -> Self {
        Self {
            executor,
            run_counter: 0,
        }
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn run_counter(&self) -> u64 {
        self.run_counter
    }

    /// Run `trials` in order. A dry run only reports each identity.
    /// Stops at the first failing trial and returns its error.
    pub fn run(&mut self, name: &str, trials: &[TrialSpec], dry_run: bool) -> Result<RunReport> {
        self.run_from(name, trials, 0, dry_run)
    }

    /// Re-issue `trials[done..]` after a partial failure. Banners and the
    /// resume hint on failure count positions in the full list.
    pub fn resume(
        &mut self,
        name: &str,
        done: usize,
        trials: Vec<TrialSpec>,
        dry_run: bool,
    ) -> Result<RunReport> {
        let done = done.min(trials.len());
        let rest = remaining(done, trials);
        if let Some(first) = rest.first() {
            info!("Resuming {} at trial #{}: {}", name, done + 1, first);
        } else {
            info!("Nothing left to resume in {} after {} trials", name, done);
        }
        self.run_from(name, &rest, done, dry_run)
    }

    /// `trials` are positions `offset + 1 ..` of a list of `offset + trials.len()`
    fn run_from(
        &mut self,
        name: &str,
        trials: &[TrialSpec],
        offset: usize,
        dry_run: bool,
    ) -> Result<RunReport> {
        let count = offset + trials.len();
        let width = count.to_string().len();
        let started = Local::now();
        let mut report = RunReport {
            experiment: name.to_string(),
            trials: Vec::with_capacity(trials.len()),
            started,
            finished: started,
            elapsed: Vec::new(),
            dry_run,
        };

        for (i, trial) in trials.iter().enumerate() {
            let pos = offset + i;
            let start = Local::now();
            banner(
                &format!(
                    "===     STARTING EXPERIMENT  [{}] {} #{:>w$}/{}  at  {}     ===",
                    self.run_counter,
                    name,
                    pos + 1,
                    count,
                    start.format("%H:%M:%S"),
                    w = width
                ),
                '=',
            );

            report.trials.push(trial.identity());
            if dry_run {
                info!("EXPERIMENT: {}", trial);
                continue;
            }

            if let Err(e) = self.executor.execute(name, trial) {
                error!(
                    "[{}] trial #{} of {} failed; {} trial(s) not attempted. Resume with offset {}",
                    name,
                    pos + 1,
                    count,
                    count - pos - 1,
                    pos
                );
                return Err(e).with_context(|| {
                    format!("{} trial #{} of {} ({}), resume at offset {}", name, pos + 1, count, trial, pos)
                });
            }
            self.run_counter += 1;

            let end = Local::now();
            let elapsed = (end - start).to_std().unwrap_or_default();
            report.elapsed.push(elapsed);
            banner(
                &format!(
                    "===     END EXPERIMENT  [{}] {} #{:>w$}/{}  at  {}  ({})     ===",
                    self.run_counter,
                    name,
                    pos + 1,
                    count,
                    end.format("%H:%M:%S"),
                    format_trial_elapsed(elapsed),
                    w = width
                ),
                '=',
            );
        }

        report.finished = Local::now();
        banner(
            &format!(
                "===     [{}] STARTED {}, FINISHED {}, TIME ELAPSED = {}     ===",
                name,
                report.started.format("%A, %b %d %H:%M:%S"),
                report.finished.format("%A, %b %d %H:%M:%S"),
                format_total_elapsed(report.total_elapsed())
            ),
            '-',
        );
        Ok(report)
    }
}
