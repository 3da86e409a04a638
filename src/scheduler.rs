//! Periodic task scheduling.
//!
//! A [`Trigger`] says when a task should next fire; [`spawn_periodic`] runs
//! a callback at each firing until shutdown.

use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::server::ShutdownSignal;

/// Source of firing times.
pub trait Trigger: Send + Sync {
    /// First firing strictly after `after`, or `None` if it never fires again.
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>>;

    fn describe(&self) -> String;
}

/// Cron expression evaluated in a fixed timezone.
///
/// Accepts the usual five fields (minute precision) or six/seven fields
/// with seconds first.
#[derive(Debug, Clone)]
pub struct CronTrigger {
    expression: String,
    schedule: Schedule,
    timezone: Tz,
}

impl CronTrigger {
    pub fn parse(expression: &str, timezone: Tz) -> Result<Self> {
        let trimmed = expression.trim();
        let full = match trimmed.split_whitespace().count() {
            5 => format!("0 {trimmed}"),
            6 | 7 => trimmed.to_string(),
            n => {
                return Err(Error::Schedule {
                    expression: expression.to_string(),
                    reason: format!("expected 5 to 7 fields, got {n}"),
                })
            }
        };
        let schedule = Schedule::from_str(&full).map_err(|e| Error::Schedule {
            expression: expression.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
            timezone,
        })
    }

    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl Trigger for CronTrigger {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&self.timezone);
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    fn describe(&self) -> String {
        format!("{} ({})", self.expression, self.timezone)
    }
}

/// Fires at a fixed period.
#[derive(Debug, Clone, Copy)]
pub struct IntervalTrigger(pub Duration);

impl Trigger for IntervalTrigger {
    fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(self.0).ok().map(|d| after + d)
    }

    fn describe(&self) -> String {
        format!("every {:?}", self.0)
    }
}

/// Run `task` at every firing of `trigger` until `shutdown`.
///
/// Firings are not concurrent: a run that outlasts the next firing delays
/// it. A task in progress when shutdown arrives is allowed to finish.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    trigger: Arc<dyn Trigger>,
    mut shutdown: ShutdownSignal,
    task: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        info!(task = name, schedule = %trigger.describe(), "Scheduled task registered");
        loop {
            let now = Utc::now();
            let Some(next) = trigger.next_after(now) else {
                warn!(task = name, "Schedule has no further firings");
                break;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);
            debug!(task = name, %next, "Next run scheduled");

            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    debug!(task = name, "Running scheduled task");
                    task().await;
                }
                () = shutdown.wait() => break,
            }
        }
        debug!(task = name, "Scheduled task stopped");
    })
}
