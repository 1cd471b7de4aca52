//! Per-identity profile: goals plus a bounded meal history.

use platewise_protocol::{new_id, now_millis};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::nutrition::MealAnalysis;
use crate::store::Record;

/// Meal history capacity; the oldest entries are evicted first.
pub const MAX_HISTORY: usize = 30;

/// Nutrition goals. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Goals {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_calories: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protein_grams: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub carbs_grams: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fat_grams: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dietary_restrictions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<String>,
}

impl Goals {
    pub fn is_empty(&self) -> bool {
        *self == Goals::default()
    }

    /// Overlay every field that is set in `update`.
    pub fn merge(&mut self, update: Goals) {
        if update.daily_calories.is_some() {
            self.daily_calories = update.daily_calories;
        }
        if update.protein_grams.is_some() {
            self.protein_grams = update.protein_grams;
        }
        if update.carbs_grams.is_some() {
            self.carbs_grams = update.carbs_grams;
        }
        if update.fat_grams.is_some() {
            self.fat_grams = update.fat_grams;
        }
        if update.dietary_restrictions.is_some() {
            self.dietary_restrictions = update.dietary_restrictions;
        }
        if update.focus.is_some() {
            self.focus = update.focus;
        }
    }

    /// One-line human summary, e.g. "2000 kcal/day, 120 g protein".
    pub fn describe(&self) -> String {
        let mut parts = Vec::new();
        if let Some(kcal) = self.daily_calories {
            parts.push(format!("{kcal} kcal/day"));
        }
        if let Some(g) = self.protein_grams {
            parts.push(format!("{g} g protein"));
        }
        if let Some(g) = self.carbs_grams {
            parts.push(format!("{g} g carbs"));
        }
        if let Some(g) = self.fat_grams {
            parts.push(format!("{g} g fat"));
        }
        if let Some(list) = self.dietary_restrictions.as_ref().filter(|l| !l.is_empty()) {
            parts.push(list.join(", "));
        }
        if let Some(focus) = &self.focus {
            parts.push(format!("focus: {focus}"));
        }
        if parts.is_empty() {
            "no goals set".to_string()
        } else {
            parts.join(", ")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MealEntry {
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<MealAnalysis>,
    pub recorded_at: u64,
}

impl MealEntry {
    pub fn new(description: impl Into<String>, analysis: Option<MealAnalysis>) -> Self {
        Self {
            id: new_id(),
            description: description.into(),
            analysis,
            recorded_at: now_millis(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    #[serde(default)]
    pub goals: Goals,
    #[serde(default)]
    pub history: Vec<MealEntry>,
    #[serde(default)]
    pub created_at: u64,
    #[serde(default)]
    pub updated_at: u64,
}

impl Profile {
    pub fn new() -> Self {
        let now = now_millis();
        Self {
            goals: Goals::default(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Append to history, evicting the oldest entries past [`MAX_HISTORY`].
    pub fn record_meal(&mut self, entry: MealEntry) {
        self.history.push(entry);
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.touch();
    }

    pub fn update_goals(&mut self, update: Goals) {
        self.goals.merge(update);
        self.touch();
    }

    /// Most recent `n` entries, oldest first.
    pub fn recent_history(&self, n: usize) -> &[MealEntry] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Entries recorded on the same UTC day as `now`.
    pub fn meals_on_day_of(&self, now: u64) -> impl Iterator<Item = &MealEntry> {
        const DAY_MS: u64 = 86_400_000;
        let day = now / DAY_MS;
        self.history
            .iter()
            .filter(move |entry| entry.recorded_at / DAY_MS == day)
    }

    // updated_at never moves backwards, even if the wall clock does.
    fn touch(&mut self) {
        self.updated_at = self.updated_at.max(now_millis());
    }
}

impl Default for Profile {
    fn default() -> Self {
        Self::new()
    }
}

impl Record for Profile {
    const KEY: &'static str = "profile";
    const SCHEMA_VERSION: u32 = 2;

    fn create() -> Self {
        Profile::new()
    }

    fn upgrade(from_version: u32, mut value: Value) -> Value {
        // v1 kept history under `mealHistory`.
        if from_version == 1 {
            if let Some(obj) = value.as_object_mut() {
                if let Some(history) = obj.remove("mealHistory") {
                    obj.entry("history").or_insert(history);
                }
            }
        }
        value
    }
}
