//! Bodies of the scheduled task kinds.
//!
//! Every body produces a `system` notice whose id is derived from the task
//! id. The notice goes into the conversation context only if it isn't there
//! yet, so running a body twice leaves one copy, and it is pushed to the
//! live connection when there is one.

use std::sync::Arc;

use async_trait::async_trait;
use platewise_protocol::{now_millis, Message, ServerMessage};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::connection::OutboundMessage;
use crate::conversation::ConversationContext;
use crate::nutrition::NutritionScorer;
use crate::profile::Profile;
use crate::scheduler::{ScheduledTask, TaskBodyError, TaskExecutor};
use crate::store::IdentityStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    MealReminder,
    DailySummary,
    GoalCheckIn,
}

impl TaskKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "meal-reminder" => Some(TaskKind::MealReminder),
            "daily-summary" => Some(TaskKind::DailySummary),
            "goal-check-in" => Some(TaskKind::GoalCheckIn),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskKind::MealReminder => "meal-reminder",
            TaskKind::DailySummary => "daily-summary",
            TaskKind::GoalCheckIn => "goal-check-in",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MealReminderPayload {
    meal: Option<String>,
    note: Option<String>,
}

pub fn notice_id(task_id: &str) -> String {
    format!("task-{task_id}")
}

pub struct ReminderRunner {
    store: IdentityStateStore,
    scorer: Arc<dyn NutritionScorer>,
    live: Option<mpsc::Sender<OutboundMessage>>,
}

impl ReminderRunner {
    pub fn new(
        store: IdentityStateStore,
        scorer: Arc<dyn NutritionScorer>,
        live: Option<mpsc::Sender<OutboundMessage>>,
    ) -> Self {
        Self { store, scorer, live }
    }

    fn meal_reminder(task: &ScheduledTask) -> Result<String, TaskBodyError> {
        let payload: MealReminderPayload = if task.payload.is_null() {
            MealReminderPayload::default()
        } else {
            serde_json::from_value(task.payload.clone())
                .map_err(|e| TaskBodyError::InvalidPayload(e.to_string()))?
        };

        let meal = payload.meal.as_deref().unwrap_or("meal");
        let mut text = format!("Reminder: time to log your {meal}.");
        if let Some(note) = payload.note.filter(|n| !n.trim().is_empty()) {
            text.push(' ');
            text.push_str(note.trim());
        }
        Ok(text)
    }

    async fn daily_summary(&self) -> Result<String, TaskBodyError> {
        let profile: Profile = self.store.load_or_create().await?;
        let today: Vec<_> = profile.meals_on_day_of(now_millis()).collect();
        if today.is_empty() {
            return Ok("Daily summary: no meals logged today. Use /analyze to log one.".into());
        }

        // Entries logged without an analysis get scored now for the total.
        let calories: u32 = today
            .iter()
            .map(|entry| match &entry.analysis {
                Some(a) => a.calories,
                None => self.scorer.analyze(&entry.description, &profile.goals).calories,
            })
            .sum();
        let count = today.len();
        let meals = if count == 1 { "meal" } else { "meals" };
        Ok(match profile.goals.daily_calories {
            Some(goal) => format!(
                "Daily summary: {count} {meals} logged, about {calories} kcal of your {goal} kcal goal."
            ),
            None => format!(
                "Daily summary: {count} {meals} logged, about {calories} kcal. Set a calorie goal with /goals."
            ),
        })
    }

    async fn goal_check_in(&self) -> Result<String, TaskBodyError> {
        let profile: Profile = self.store.load_or_create().await?;
        Ok(if profile.goals.is_empty() {
            "You haven't set any goals yet. Try /goals calories 2000 protein 120.".into()
        } else {
            format!(
                "Checking in on your goals: {}. How is it going?",
                profile.goals.describe()
            )
        })
    }

    async fn deliver(&self, task: &ScheduledTask, text: String) -> Result<(), TaskBodyError> {
        let notice = Message::system(text).with_id(notice_id(&task.id));

        let mut context: ConversationContext = self.store.load_or_create().await?;
        if !context.contains(&notice.id) {
            context.push(notice.clone());
            self.store.store(&context).await?;
        }

        if let Some(live) = &self.live {
            let delivered = live
                .send(OutboundMessage::Json(ServerMessage::message(&notice)))
                .await
                .is_ok();
            debug!(
                component = "reminders",
                event = "reminder.pushed",
                identity = %self.store.identity(),
                task_id = %task.id,
                delivered,
                "Pushed reminder to live connection"
            );
        }
        Ok(())
    }
}

#[async_trait]
impl TaskExecutor for ReminderRunner {
    async fn execute(&self, task: &ScheduledTask) -> Result<(), TaskBodyError> {
        let kind = TaskKind::parse(&task.task_name)
            .ok_or_else(|| TaskBodyError::UnknownTask(task.task_name.clone()))?;
        let text = match kind {
            TaskKind::MealReminder => Self::meal_reminder(task)?,
            TaskKind::DailySummary => self.daily_summary().await?,
            TaskKind::GoalCheckIn => self.goal_check_in().await?,
        };
        self.deliver(task, text).await
    }
}
