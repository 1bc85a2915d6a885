//! Backup Scheduler
//!
//! Registry of cron entries keyed by backup name, fired by one shared timer
//! driver. Registering the same schedule twice is a no-op.

use chrono::{DateTime, Utc};
use cron::Schedule;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Work fired on every occurrence of a schedule
pub type BackupTask = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Parse a cron expression.
///
/// Standard five-field expressions get a leading seconds field; six and seven
/// field expressions and `@hourly`-style shortcuts are taken as is.
pub fn parse_schedule(expression: &str) -> Result<Schedule> {
    let expression = expression.trim();
    let normalized = if expression.split_whitespace().count() == 5 {
        format!("0 {}", expression)
    } else {
        expression.to_string()
    };
    Schedule::from_str(&normalized).map_err(|e| Error::InvalidSchedule {
        schedule: expression.to_string(),
        reason: e.to_string(),
    })
}

struct Entry {
    job_id: Uuid,
    expression: String,
    schedule: Schedule,
    next: Option<DateTime<Utc>>,
    task: BackupTask,
}

/// Backup Scheduler
pub struct BackupScheduler {
    entries: Mutex<HashMap<String, Entry>>,
    tick: Duration,
    shutdown: CancellationToken,
}

impl Default for BackupScheduler {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl BackupScheduler {
    pub fn new(tick: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            tick,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register `task` under `expression` for `name`.
    ///
    /// Returns `true` when skipped because the same schedule is already
    /// registered. A different schedule replaces the previous entry.
    pub fn add_or_update(&self, name: &str, expression: &str, task: BackupTask) -> Result<bool> {
        let mut entries = self.entries.lock();
        if entries
            .get(name)
            .is_some_and(|e| e.expression == expression)
        {
            return Ok(true);
        }

        let schedule = parse_schedule(expression)?;
        let next = schedule.after(&Utc::now()).next();
        let job_id = Uuid::new_v4();
        if entries.remove(name).is_some() {
            debug!(backup = %name, "Replacing scheduled backup");
        }
        entries.insert(
            name.to_string(),
            Entry {
                job_id,
                expression: expression.to_string(),
                schedule,
                next,
                task,
            },
        );
        info!(backup = %name, schedule = %expression, %job_id, ?next, "Backup scheduled");
        Ok(false)
    }

    /// Unregister `name`. Returns `true` if it was registered.
    pub fn remove(&self, name: &str) -> bool {
        let removed = self.entries.lock().remove(name);
        if let Some(entry) = &removed {
            info!(backup = %name, job_id = %entry.job_id, "Backup unscheduled");
        }
        removed.is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.lock().contains_key(name)
    }

    /// Job id and schedule registered for `name`
    pub fn entry(&self, name: &str) -> Option<(Uuid, String)> {
        self.entries
            .lock()
            .get(name)
            .map(|e| (e.job_id, e.expression.clone()))
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tasks whose next occurrence is at or before `now`; their next
    /// occurrence moves past `now`
    fn due_tasks(&self, now: DateTime<Utc>) -> Vec<(String, BackupTask)> {
        let mut entries = self.entries.lock();
        let mut due = Vec::new();
        for (name, entry) in entries.iter_mut() {
            if entry.next.is_some_and(|next| next <= now) {
                entry.next = entry.schedule.after(&now).next();
                due.push((name.clone(), entry.task.clone()));
            }
        }
        due
    }

    /// Timer driver: fire due tasks until [`shutdown`](Self::shutdown)
    pub async fn run(self: Arc<Self>) {
        info!(tick = ?self.tick, "Backup scheduler started");
        let mut interval = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = interval.tick() => {
                    for (name, task) in self.due_tasks(Utc::now()) {
                        debug!(backup = %name, "Firing scheduled backup");
                        tokio::spawn(task());
                    }
                }
            }
        }
        info!("Backup scheduler stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}
