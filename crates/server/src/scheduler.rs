//! Durable scheduled tasks for one identity.
//!
//! Two tables back the store: `scheduled_tasks` holds the status record of
//! every task and is kept after completion for status queries; `task_queue`
//! holds one raw entry per task that has not reached a terminal state. The
//! earliest queue entry decides when the actor's [`Alarm`] fires.
//!
//! State moves forward only: pending -> running -> completed | failed, or
//! pending | running -> cancelled. The single way back is `retry` of a
//! failed task, which runs it again immediately.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use platewise_protocol::{new_id, now_millis};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::alarm::Alarm;
use crate::db::{Db, StoreError};
use crate::reminders::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn as_sql(self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Running => "running",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    fn from_sql(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskState::Pending),
            "running" => Some(TaskState::Running),
            "completed" => Some(TaskState::Completed),
            "failed" => Some(TaskState::Failed),
            "cancelled" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledTask {
    pub id: String,
    pub task_name: String,
    pub payload: Value,
    pub due_at: u64,
    pub state: TaskState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub attempts: u32,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Task not found: {0}")]
    NotFound(String),

    #[error("Cannot {action} task {id} in state {state}")]
    StateConflict {
        id: String,
        action: &'static str,
        state: TaskState,
    },

    #[error("Unknown task name: {0}")]
    UnknownTask(String),

    #[error("dueAt {0} is out of range")]
    DueAtOutOfRange(u64),

    #[error("{0}")]
    Store(#[from] StoreError),
}

impl From<rusqlite::Error> for TaskError {
    fn from(e: rusqlite::Error) -> Self {
        TaskError::Store(StoreError::Database(e))
    }
}

/// Failure inside a task body; recorded on the task as its error text.
#[derive(Debug, Error)]
pub enum TaskBodyError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Unknown task name: {0}")]
    UnknownTask(String),

    #[error("{0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Failed(String),
}

/// Runs the body of a scheduled task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &ScheduledTask) -> Result<(), TaskBodyError>;
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct SweepReport {
    pub completed: Vec<String>,
    pub failed: Vec<String>,
    /// Tasks left queued because settling them hit a storage error.
    pub errored: Vec<String>,
    /// Due time the alarm was re-armed to.
    pub next_due: Option<u64>,
}

pub const INTERRUPTED_ERROR: &str = "interrupted before completion";

/// Earliest re-arm after a sweep that hit storage errors.
pub const SWEEP_ERROR_BACKOFF_MS: u64 = 5_000;

const TASK_COLUMNS: &str =
    "id, task_name, payload, due_at, state, error, attempts, created_at, updated_at";

fn conversion_error(idx: usize, e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
}

#[derive(Debug, Error)]
#[error("unrecognized task state {0:?}")]
struct BadState(String);

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<ScheduledTask> {
    let payload: String = row.get(2)?;
    let state: String = row.get(4)?;
    Ok(ScheduledTask {
        id: row.get(0)?,
        task_name: row.get(1)?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(2, e))?,
        due_at: row.get::<_, i64>(3)? as u64,
        state: TaskState::from_sql(&state).ok_or_else(|| conversion_error(4, BadState(state)))?,
        error: row.get(5)?,
        attempts: row.get(6)?,
        created_at: row.get::<_, i64>(7)? as u64,
        updated_at: row.get::<_, i64>(8)? as u64,
    })
}

fn load_task(
    conn: &rusqlite::Connection,
    identity: &str,
    task_id: &str,
) -> Result<ScheduledTask, TaskError> {
    conn.query_row(
        &format!("SELECT {TASK_COLUMNS} FROM scheduled_tasks WHERE id = ?1 AND identity = ?2"),
        params![task_id, identity],
        task_from_row,
    )
    .optional()?
    .ok_or_else(|| TaskError::NotFound(task_id.to_string()))
}

/// Record a terminal outcome and drop the raw queue entry.
fn finish(
    conn: &mut rusqlite::Connection,
    task_id: &str,
    outcome: &Result<(), String>,
) -> Result<(), TaskError> {
    let (state, error) = match outcome {
        Ok(()) => (TaskState::Completed, None),
        Err(e) => (TaskState::Failed, Some(e.as_str())),
    };
    let tx = conn.transaction()?;
    tx.execute(
        "UPDATE scheduled_tasks SET state = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
        params![task_id, state.as_sql(), error, now_millis() as i64],
    )?;
    tx.execute("DELETE FROM task_queue WHERE task_id = ?1", params![task_id])?;
    tx.commit()?;
    Ok(())
}

pub struct ScheduledTaskStore {
    db: Db,
    identity: String,
    alarm: Alarm,
}

impl ScheduledTaskStore {
    pub fn new(db: Db, identity: impl Into<String>, alarm: Alarm) -> Self {
        Self {
            db,
            identity: identity.into(),
            alarm,
        }
    }

    pub fn alarm_at(&self) -> Option<u64> {
        self.alarm.armed_at()
    }

    /// Persist a pending task and pull the alarm forward if it is due sooner.
    pub async fn schedule(
        &mut self,
        task_name: &str,
        payload: Value,
        due_at: u64,
    ) -> Result<String, TaskError> {
        let Some(kind) = TaskKind::parse(task_name) else {
            return Err(TaskError::UnknownTask(task_name.to_string()));
        };
        let due_at_sql =
            i64::try_from(due_at).map_err(|_| TaskError::DueAtOutOfRange(due_at))?;

        let id = new_id();
        let identity = self.identity.clone();
        let task_id = id.clone();
        let task_name = task_name.to_string();
        let payload = serde_json::to_string(&payload).map_err(StoreError::from)?;
        self.db
            .call(move |conn| {
                let now = now_millis() as i64;
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO scheduled_tasks
                       (id, identity, task_name, payload, due_at, state, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                    params![task_id, identity, task_name, payload, due_at_sql, now],
                )?;
                tx.execute(
                    "INSERT INTO task_queue (task_id, identity, due_at) VALUES (?1, ?2, ?3)",
                    params![task_id, identity, due_at_sql],
                )?;
                tx.commit()?;
                Ok::<_, TaskError>(())
            })
            .await?;

        self.alarm.arm_no_later_than(due_at);
        info!(
            component = "scheduler",
            event = "task.scheduled",
            identity = %self.identity,
            task_id = %id,
            task_name = kind.as_str(),
            due_at,
            "Task scheduled"
        );
        Ok(id)
    }

    pub async fn status(&self, task_id: &str) -> Result<ScheduledTask, TaskError> {
        let identity = self.identity.clone();
        let task_id = task_id.to_string();
        self.db
            .call(move |conn| load_task(conn, &identity, &task_id))
            .await
    }

    /// Cancel a pending or running task; terminal tasks are a state conflict.
    pub async fn cancel(&mut self, task_id: &str) -> Result<ScheduledTask, TaskError> {
        let identity = self.identity.clone();
        let id = task_id.to_string();
        let task = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                let task = load_task(&tx, &identity, &id)?;
                if task.state.is_terminal() {
                    return Err(TaskError::StateConflict {
                        id,
                        action: "cancel",
                        state: task.state,
                    });
                }
                tx.execute(
                    "UPDATE scheduled_tasks SET state = 'cancelled', updated_at = ?2 WHERE id = ?1",
                    params![id, now_millis() as i64],
                )?;
                tx.execute("DELETE FROM task_queue WHERE task_id = ?1", params![id])?;
                let task = load_task(&tx, &identity, &id)?;
                tx.commit()?;
                Ok(task)
            })
            .await?;

        self.rearm().await?;
        info!(
            component = "scheduler",
            event = "task.cancelled",
            identity = %self.identity,
            task_id = %task_id,
            "Task cancelled"
        );
        Ok(task)
    }

    /// Re-run a failed task now and record the new outcome.
    pub async fn retry(
        &mut self,
        task_id: &str,
        executor: &dyn TaskExecutor,
    ) -> Result<ScheduledTask, TaskError> {
        let identity = self.identity.clone();
        let id = task_id.to_string();
        let task = self
            .db
            .call(move |conn| {
                let task = load_task(conn, &identity, &id)?;
                if task.state != TaskState::Failed {
                    return Err(TaskError::StateConflict {
                        id,
                        action: "retry",
                        state: task.state,
                    });
                }
                conn.execute(
                    "UPDATE scheduled_tasks
                     SET state = 'running', error = NULL, attempts = attempts + 1, updated_at = ?2
                     WHERE id = ?1",
                    params![id, now_millis() as i64],
                )?;
                load_task(conn, &identity, &id)
            })
            .await?;

        let outcome = run_body(executor, &task).await;
        self.record_outcome(&task.id, outcome).await?;
        self.status(task_id).await
    }

    /// Run every queued task due by now. One task failing never stops the
    /// others. Re-arms the alarm to the next remaining task afterwards.
    pub async fn sweep(&mut self, executor: &dyn TaskExecutor) -> Result<SweepReport, TaskError> {
        let now = now_millis();
        let identity = self.identity.clone();
        let due: Vec<String> = self
            .db
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT task_id FROM task_queue
                     WHERE identity = ?1 AND due_at <= ?2
                     ORDER BY due_at, task_id",
                )?;
                let ids = stmt
                    .query_map(params![identity, now as i64], |row| row.get(0))?
                    .collect::<Result<Vec<String>, _>>()?;
                Ok::<_, TaskError>(ids)
            })
            .await?;

        let mut report = SweepReport::default();
        for task_id in due {
            let outcome = self.sweep_one(&task_id, executor).await;
            match outcome {
                Ok(Some(true)) => report.completed.push(task_id),
                Ok(Some(false)) => report.failed.push(task_id),
                Ok(None) => {}
                Err(e) => {
                    report.errored.push(task_id.clone());
                    warn!(
                        component = "scheduler",
                        event = "task.sweep_error",
                        identity = %self.identity,
                        task_id = %task_id,
                        error = %e,
                        "Failed to process due task"
                    );
                }
            }
        }

        report.next_due = if report.errored.is_empty() {
            self.rearm().await?
        } else {
            // Errored entries are still due; don't wake straight back up for them.
            let floor = now_millis() + SWEEP_ERROR_BACKOFF_MS;
            let next = self.next_due().await?.map(|due| due.max(floor));
            self.alarm.set(next);
            next
        };
        debug!(
            component = "scheduler",
            event = "sweep.finished",
            identity = %self.identity,
            completed = report.completed.len(),
            failed = report.failed.len(),
            errored = report.errored.len(),
            next_due = ?report.next_due,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Claim, run and settle one task. `None` means it was no longer pending.
    async fn sweep_one(
        &self,
        task_id: &str,
        executor: &dyn TaskExecutor,
    ) -> Result<Option<bool>, TaskError> {
        let identity = self.identity.clone();
        let id = task_id.to_string();
        let claimed = self
            .db
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE scheduled_tasks
                     SET state = 'running', attempts = attempts + 1, updated_at = ?3
                     WHERE id = ?1 AND identity = ?2 AND state = 'pending'",
                    params![id, identity, now_millis() as i64],
                )?;
                if changed == 0 {
                    // Not pending anymore; the queue entry is stale.
                    conn.execute("DELETE FROM task_queue WHERE task_id = ?1", params![id])?;
                    return Ok(None);
                }
                load_task(conn, &identity, &id).map(Some)
            })
            .await?;

        let Some(task) = claimed else {
            return Ok(None);
        };
        let outcome = run_body(executor, &task).await;
        let succeeded = outcome.is_ok();
        self.record_outcome(&task.id, outcome).await?;
        Ok(Some(succeeded))
    }

    async fn record_outcome(&self, task_id: &str, outcome: Result<(), String>) -> Result<(), TaskError> {
        match &outcome {
            Ok(()) => info!(
                component = "scheduler",
                event = "task.completed",
                identity = %self.identity,
                task_id = %task_id,
                "Task completed"
            ),
            Err(e) => warn!(
                component = "scheduler",
                event = "task.failed",
                identity = %self.identity,
                task_id = %task_id,
                error = %e,
                "Task failed"
            ),
        }
        let id = task_id.to_string();
        self.db.call(move |conn| finish(conn, &id, &outcome)).await
    }

    /// Earliest due time among queued tasks.
    pub async fn next_due(&self) -> Result<Option<u64>, TaskError> {
        let identity = self.identity.clone();
        self.db
            .call(move |conn| {
                let due: Option<i64> = conn.query_row(
                    "SELECT MIN(due_at) FROM task_queue WHERE identity = ?1",
                    params![identity],
                    |row| row.get(0),
                )?;
                Ok::<_, TaskError>(due.map(|d| d as u64))
            })
            .await
    }

    /// Point the alarm at the earliest queued task, or disarm it.
    pub async fn rearm(&mut self) -> Result<Option<u64>, TaskError> {
        let next = self.next_due().await?;
        self.alarm.set(next);
        Ok(next)
    }

    /// Fail tasks left `running` by a previous process so they can be retried.
    pub async fn recover_interrupted(&self) -> Result<usize, TaskError> {
        let identity = self.identity.clone();
        let recovered = self
            .db
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "DELETE FROM task_queue WHERE task_id IN
                       (SELECT id FROM scheduled_tasks WHERE identity = ?1 AND state = 'running')",
                    params![identity],
                )?;
                let changed = tx.execute(
                    "UPDATE scheduled_tasks SET state = 'failed', error = ?2, updated_at = ?3
                     WHERE identity = ?1 AND state = 'running'",
                    params![identity, INTERRUPTED_ERROR, now_millis() as i64],
                )?;
                tx.commit()?;
                Ok::<_, TaskError>(changed)
            })
            .await?;

        if recovered > 0 {
            warn!(
                component = "scheduler",
                event = "task.recovered_interrupted",
                identity = %self.identity,
                count = recovered,
                "Marked interrupted tasks as failed"
            );
        }
        Ok(recovered)
    }

    /// Identities with at least one queued task, for alarm rehydration at startup.
    pub async fn identities_with_queued_tasks(db: &Db) -> Result<Vec<String>, StoreError> {
        db.call(|conn| {
            let mut stmt =
                conn.prepare("SELECT DISTINCT identity FROM task_queue ORDER BY identity")?;
            let identities = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok::<_, StoreError>(identities)
        })
        .await
    }
}

/// Execute a body, folding errors and panics into the recorded error text.
async fn run_body(executor: &dyn TaskExecutor, task: &ScheduledTask) -> Result<(), String> {
    match AssertUnwindSafe(executor.execute(task)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(panic) => Err(match panic.downcast_ref::<&str>() {
            Some(s) => format!("task panicked: {s}"),
            None => match panic.downcast_ref::<String>() {
                Some(s) => format!("task panicked: {s}"),
                None => "task panicked".to_string(),
            },
        }),
    }
}
