use crate::error::{Result, VigilError};
use crate::process::state::LifecycleStatus;
use crate::process::supervisor::AppHandle;
use chrono::{DateTime, Local};
use cron::Schedule;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// How often the scheduler checks for due firings
const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Parse a cron expression, accepting the standard 5-field form
/// ("m h dom mon dow") by prepending a seconds column. Parsed once at
/// load time; ticks only evaluate the structured schedule.
pub fn parse_schedule(expr: &str) -> Result<Schedule> {
    let normalized = normalize_expr(expr);
    Schedule::from_str(&normalized)
        .map_err(|e| VigilError::InvalidCronExpr(expr.to_string(), e.to_string()))
}

fn normalize_expr(expr: &str) -> String {
    if expr.split_whitespace().count() == 5 {
        format!("0 {}", expr)
    } else {
        expr.to_string()
    }
}

/// Whether a scheduled instant falls inside the half-open window
/// `(after, upto]`
pub fn fired_between(
    schedule: &Schedule,
    after: &DateTime<Local>,
    upto: &DateTime<Local>,
) -> bool {
    schedule
        .after(after)
        .next()
        .map(|t| t <= *upto)
        .unwrap_or(false)
}

/// What a due tick does to one cron app
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Launch the app
    Fire,
    /// Previous invocation still live; skip this firing, never queue it
    SkipOverlapping,
}

pub fn tick_outcome(status: LifecycleStatus) -> TickOutcome {
    match status {
        LifecycleStatus::Stopped => TickOutcome::Fire,
        _ => TickOutcome::SkipOverlapping,
    }
}

struct CronEntry {
    handle: AppHandle,
    schedule: Schedule,
}

/// Single ticking component driving all cron-mode apps.
///
/// Firing delegates to the app's own supervisor loop through its command
/// channel; the scheduler never touches runtime state directly and never
/// consults the restart policy.
pub struct CronScheduler {
    entries: Vec<CronEntry>,
    shutdown: watch::Receiver<bool>,
}

impl CronScheduler {
    /// Build a scheduler over the cron-mode subset of the app handles
    pub fn new(handles: &[AppHandle], shutdown: watch::Receiver<bool>) -> Result<Self> {
        let mut entries = Vec::new();

        for handle in handles {
            if let Some(ref expr) = handle.spec().cron_restart {
                entries.push(CronEntry {
                    handle: handle.clone(),
                    schedule: parse_schedule(expr)?,
                });
            }
        }

        Ok(Self { entries, shutdown })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn run(mut self) {
        if self.entries.is_empty() {
            return;
        }

        info!("Cron scheduler started ({} app(s))", self.entries.len());

        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last_tick = Local::now();

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let now = Local::now();
                    self.fire_due(&last_tick, &now).await;
                    last_tick = now;
                }
                res = self.shutdown.changed() => {
                    if res.is_err() || *self.shutdown.borrow() {
                        debug!("Cron scheduler shutting down");
                        return;
                    }
                }
            }
        }
    }

    async fn fire_due(&self, after: &DateTime<Local>, upto: &DateTime<Local>) {
        for entry in &self.entries {
            if !fired_between(&entry.schedule, after, upto) {
                continue;
            }

            match tick_outcome(entry.handle.snapshot().status) {
                TickOutcome::Fire => {
                    info!(app = %entry.handle.name(), "Cron firing");
                    if let Err(e) = entry.handle.start().await {
                        warn!(app = %entry.handle.name(), "Cron firing failed: {}", e);
                    }
                }
                TickOutcome::SkipOverlapping => {
                    warn!(
                        app = %entry.handle.name(),
                        "Previous invocation still running, skipping scheduled firing"
                    );
                }
            }
        }
    }
}
