//! Cron-driven triggering of task runs.
//!
//! Each enabled task gets its own loop. A task never overlaps with itself:
//! in-process through a per-task guard, across processes through the store
//! lease the runner takes. Ticks that pass while a run is active are dropped.

use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::engine::TaskRunner;
use crate::engine::types::TaskRun;
use crate::rules::TaskDefinition;

/// A task bound to its cron schedule.
pub struct ScheduledTask {
    pub task: Arc<TaskDefinition>,
    pub expression: String,
    schedule: Schedule,
    running: Arc<Mutex<()>>,
}

impl ScheduledTask {
    /// Parse a 6-field cron expression (`sec min hour day month weekday`).
    pub fn new(task: Arc<TaskDefinition>, expression: &str) -> Result<Self> {
        let schedule = Schedule::from_str(expression)
            .with_context(|| format!("Invalid schedule '{}' for task {}", expression, task.name))?;
        Ok(Self {
            task,
            expression: expression.to_string(),
            schedule,
            running: Arc::new(Mutex::new(())),
        })
    }

    /// Next fire time strictly after `after`, evaluated in `tz`.
    pub fn next_fire(&self, after: DateTime<Utc>, tz: Tz) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc))
    }

    /// Run the task unless a run of it is already in progress here.
    pub async fn try_run(&self, runner: &TaskRunner) -> Option<TaskRun> {
        let Ok(_guard) = self.running.try_lock() else {
            info!(task = %self.task.name, "Previous run still active, skipping tick");
            return None;
        };
        Some(runner.run(&self.task).await)
    }
}

pub struct Scheduler {
    runner: Arc<TaskRunner>,
    tz: Tz,
    tasks: Vec<Arc<ScheduledTask>>,
}

impl Scheduler {
    pub fn new(runner: Arc<TaskRunner>, tz: Tz) -> Self {
        Self {
            runner,
            tz,
            tasks: Vec::new(),
        }
    }

    pub fn add(&mut self, task: ScheduledTask) {
        self.tasks.push(Arc::new(task));
    }

    pub fn tasks(&self) -> &[Arc<ScheduledTask>] {
        &self.tasks
    }

    /// Drive every task until `shutdown` flips to true or its sender is dropped.
    /// Runs in flight are allowed to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) -> Result<()> {
        if self.tasks.is_empty() {
            warn!("No tasks scheduled");
            return Ok(());
        }

        let mut loops = JoinSet::new();
        for scheduled in &self.tasks {
            info!(task = %scheduled.task.name, schedule = %scheduled.expression, "Scheduling task");
            loops.spawn(task_loop(
                scheduled.clone(),
                self.runner.clone(),
                self.tz,
                shutdown.clone(),
            ));
        }

        while let Some(joined) = loops.join_next().await {
            joined.context("Scheduler loop panicked")?;
        }

        info!("Scheduler stopped");
        Ok(())
    }
}

async fn task_loop(
    scheduled: Arc<ScheduledTask>,
    runner: Arc<TaskRunner>,
    tz: Tz,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let now = Utc::now();
        let Some(next) = scheduled.next_fire(now, tz) else {
            warn!(task = %scheduled.task.name, "Schedule has no upcoming fire time, stopping");
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => break,
        }

        if let Some(run) = scheduled.try_run(&runner).await {
            info!(
                task = %scheduled.task.name,
                status = %run.status,
                next_after = %next,
                "Scheduled run finished"
            );
        }
    }
}
