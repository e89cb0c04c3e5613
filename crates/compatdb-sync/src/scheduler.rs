use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use compatdb_core::Checkpoint;
use compatdb_storage::BackoffPolicy;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::pipeline::{CycleError, CycleOutcome, SyncPipeline};

/// Observable scheduler state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub interval: Duration,
    pub last_tick: DateTime<Utc>,
    pub cycles: u64,
    pub last_error: Option<String>,
}

impl SchedulerStatus {
    pub fn time_remaining(&self, now: DateTime<Utc>) -> Option<Duration> {
        time_remaining(self.last_tick, self.interval, now)
    }
}

/// Final result of one scheduled tick, after retries.
#[derive(Debug)]
pub enum CycleReport {
    Completed(CycleOutcome),
    Failed { attempts: usize, error: CycleError },
}

/// Time until `last_tick + interval`, or `None` once that moment has passed.
pub fn time_remaining(
    last_tick: DateTime<Utc>,
    interval: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let next = last_tick + chrono::Duration::from_std(interval).ok()?;
    if now < next {
        (next - now).to_std().ok()
    } else {
        None
    }
}

pub fn format_days(remaining: Option<Duration>) -> String {
    let Some(remaining) = remaining else {
        return "N/A".to_string();
    };
    let secs = remaining.as_secs();
    format!(
        "{} days, {} hours, {} minutes, {} seconds",
        secs / 86_400,
        secs % 86_400 / 3_600,
        secs % 3_600 / 60,
        secs % 60
    )
}

/// Drives one ingestion cycle per interval; never runs two cycles at once.
pub struct Scheduler {
    pipeline: Arc<SyncPipeline>,
    interval: Duration,
    retry: BackoffPolicy,
    status: watch::Sender<SchedulerStatus>,
    results: Option<mpsc::Sender<CycleReport>>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<SyncPipeline>, interval: Duration, retry: BackoffPolicy) -> Self {
        let (status, _) = watch::channel(SchedulerStatus {
            interval,
            last_tick: pipeline.clock().now(),
            cycles: 0,
            last_error: None,
        });
        Self {
            pipeline,
            interval,
            retry,
            status,
            results: None,
        }
    }

    /// Deliver every tick's final result on `results`. Reports are dropped when the channel is full.
    pub fn with_results(mut self, results: mpsc::Sender<CycleReport>) -> Self {
        self.results = Some(results);
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.status.subscribe()
    }

    /// Load or seed the checkpoint, then tick until `shutdown` flips to true or its sender goes away.
    ///
    /// Returns immediately when the interval is zero. Only the startup checkpoint
    /// load can fail; cycle failures are retried and then reported.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), CycleError> {
        if self.interval.is_zero() {
            info!("update interval is zero; background ingestion disabled");
            return Ok(());
        }

        let mut checkpoint = self.pipeline.load_checkpoint().await?;
        self.status.send_modify(|s| s.last_tick = self.pipeline.clock().now());

        let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(interval_secs = self.interval.as_secs(), "scheduler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let report = self.tick(&mut checkpoint).await;
            let now = self.pipeline.clock().now();
            self.status.send_modify(|s| {
                s.last_tick = now;
                s.cycles += 1;
                s.last_error = match &report {
                    CycleReport::Failed { error, .. } => Some(error.to_string()),
                    CycleReport::Completed(_) => None,
                };
            });
            if let Some(results) = &self.results {
                if let Err(err) = results.try_send(report) {
                    warn!(error = %err, "dropping cycle report");
                }
            }
        }

        info!("scheduler stopped");
        Ok(())
    }

    async fn tick(&self, checkpoint: &mut Checkpoint) -> CycleReport {
        let mut attempt = 0;
        loop {
            match self.pipeline.run_cycle(checkpoint).await {
                Ok(outcome) => return CycleReport::Completed(outcome),
                Err(err) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(error = %err, attempt, delay_ms = delay.as_millis() as u64, "cycle failed; retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    error!(
                        error = %err,
                        last_processed = %checkpoint.last_processed_file,
                        "cycle failed; keeping checkpoint until next tick"
                    );
                    return CycleReport::Failed {
                        attempts: attempt + 1,
                        error: err,
                    };
                }
            }
        }
    }
}
