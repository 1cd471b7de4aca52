//! Commands sent to a session actor from the socket loop, the HTTP API and
//! the actor's own alarm.

use serde_json::Value;
use tokio::sync::oneshot;

use crate::connection::Connection;
use crate::db::StoreError;
use crate::profile::{Goals, Profile};
use crate::scheduler::{ScheduledTask, TaskError};

#[derive(Debug)]
pub enum DetachCause {
    /// Close frame or end of stream.
    Closed,
    /// Transport error.
    Error(String),
}

/// A command that can be sent to a session actor.
pub enum SessionCommand {
    // -- Transport --
    /// Bind a freshly upgraded connection, superseding any current one.
    Attach { connection: Connection },

    /// Raw text frame received on `connection_id`.
    Inbound { connection_id: u64, text: String },

    Detach {
        connection_id: u64,
        cause: DetachCause,
    },

    /// The wake-up timer fired; sweep due tasks.
    Alarm,

    // -- Scheduled tasks (use oneshot reply channels) --
    ScheduleTask {
        task_name: String,
        payload: Value,
        due_at: u64,
        reply: oneshot::Sender<Result<String, TaskError>>,
    },
    TaskStatus {
        task_id: String,
        reply: oneshot::Sender<Result<ScheduledTask, TaskError>>,
    },
    CancelTask {
        task_id: String,
        reply: oneshot::Sender<Result<ScheduledTask, TaskError>>,
    },
    RetryTask {
        task_id: String,
        reply: oneshot::Sender<Result<ScheduledTask, TaskError>>,
    },

    // -- Profile and records --
    GetProfile {
        reply: oneshot::Sender<Result<Profile, StoreError>>,
    },
    /// Merge `goals` into the stored profile.
    UpdateGoals {
        goals: Goals,
        reply: oneshot::Sender<Result<Profile, StoreError>>,
    },
    ListRecords {
        prefix: String,
        limit: usize,
        reply: oneshot::Sender<Result<Vec<String>, StoreError>>,
    },
    DeleteRecord {
        key: String,
        reply: oneshot::Sender<Result<bool, StoreError>>,
    },
}

impl SessionCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionCommand::Attach { .. } => "attach",
            SessionCommand::Inbound { .. } => "inbound",
            SessionCommand::Detach { .. } => "detach",
            SessionCommand::Alarm => "alarm",
            SessionCommand::ScheduleTask { .. } => "schedule_task",
            SessionCommand::TaskStatus { .. } => "task_status",
            SessionCommand::CancelTask { .. } => "cancel_task",
            SessionCommand::RetryTask { .. } => "retry_task",
            SessionCommand::GetProfile { .. } => "get_profile",
            SessionCommand::UpdateGoals { .. } => "update_goals",
            SessionCommand::ListRecords { .. } => "list_records",
            SessionCommand::DeleteRecord { .. } => "delete_record",
        }
    }
}
