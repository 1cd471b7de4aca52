//! Meal scoring and recommendations.
//!
//! These are plain functions over plain data: they never touch storage or
//! the network. The session runtime only depends on the [`NutritionScorer`]
//! contract; [`KeywordScorer`] is a small table-driven default.

use serde::{Deserialize, Serialize};

use crate::profile::{Goals, Profile};

/// Estimated nutrition for one meal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MealAnalysis {
    pub calories: u32,
    pub protein_grams: u32,
    pub carbs_grams: u32,
    pub fat_grams: u32,
    /// 0-100, higher is a better fit for the goals.
    pub score: u8,
    pub recognized: Vec<String>,
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recommendation {
    pub title: String,
    pub reason: String,
}

pub trait NutritionScorer: Send + Sync {
    fn analyze(&self, description: &str, goals: &Goals) -> MealAnalysis;

    /// `hint` is the free text that triggered the request, if any.
    fn recommend(&self, profile: &Profile, hint: Option<&str>) -> Vec<Recommendation>;
}

struct Food {
    keyword: &'static str,
    calories: u32,
    protein: u32,
    carbs: u32,
    fat: u32,
    wholesome: bool,
    meat: bool,
}

const fn food(
    keyword: &'static str,
    calories: u32,
    protein: u32,
    carbs: u32,
    fat: u32,
    wholesome: bool,
    meat: bool,
) -> Food {
    Food {
        keyword,
        calories,
        protein,
        carbs,
        fat,
        wholesome,
        meat,
    }
}

const FOODS: &[Food] = &[
    food("oatmeal", 150, 5, 27, 3, true, false),
    food("berries", 60, 1, 14, 0, true, false),
    food("banana", 105, 1, 27, 0, true, false),
    food("apple", 95, 0, 25, 0, true, false),
    food("yogurt", 100, 10, 7, 3, true, false),
    food("egg", 78, 6, 1, 5, false, false),
    food("toast", 80, 3, 14, 1, false, false),
    food("avocado", 160, 2, 9, 15, true, false),
    food("salad", 100, 3, 10, 5, true, false),
    food("beans", 120, 8, 21, 0, true, false),
    food("lentil", 115, 9, 20, 0, true, false),
    food("tofu", 90, 10, 2, 5, true, false),
    food("rice", 200, 4, 45, 0, false, false),
    food("pasta", 220, 8, 43, 1, false, false),
    food("chicken", 230, 43, 0, 5, false, true),
    food("salmon", 280, 39, 0, 13, true, true),
    food("steak", 270, 26, 0, 18, false, true),
    food("burger", 550, 30, 40, 30, false, true),
    food("pizza", 285, 12, 36, 10, false, false),
    food("fries", 365, 4, 48, 17, false, false),
    food("soda", 150, 0, 39, 0, false, false),
];

const INDULGENT: &[&str] = &["burger", "pizza", "fries", "soda"];

/// Typical mixed meal, used when nothing in the description is recognized.
const FALLBACK: (u32, u32, u32, u32) = (450, 20, 50, 15);

#[derive(Debug, Default, Clone, Copy)]
pub struct KeywordScorer;

impl KeywordScorer {
    fn is_vegetarian(goals: &Goals) -> bool {
        goals.dietary_restrictions.as_ref().is_some_and(|list| {
            list.iter()
                .any(|r| matches!(r.to_ascii_lowercase().as_str(), "vegetarian" | "vegan"))
        })
    }
}

impl NutritionScorer for KeywordScorer {
    fn analyze(&self, description: &str, goals: &Goals) -> MealAnalysis {
        let lower = description.to_ascii_lowercase();
        let matched: Vec<&Food> = FOODS.iter().filter(|f| lower.contains(f.keyword)).collect();

        let mut analysis = MealAnalysis::default();
        if matched.is_empty() {
            let (calories, protein, carbs, fat) = FALLBACK;
            analysis.calories = calories;
            analysis.protein_grams = protein;
            analysis.carbs_grams = carbs;
            analysis.fat_grams = fat;
            analysis
                .notes
                .push("I didn't recognize the items, so this is a typical-meal estimate.".into());
        }
        for f in &matched {
            analysis.calories += f.calories;
            analysis.protein_grams += f.protein;
            analysis.carbs_grams += f.carbs;
            analysis.fat_grams += f.fat;
            analysis.recognized.push(f.keyword.to_string());
        }

        let mut score: i32 = 70;
        if analysis.protein_grams >= 20 {
            score += 10;
        } else {
            analysis.notes.push("Light on protein.".into());
        }
        if matched.iter().any(|f| f.wholesome) {
            score += 10;
        }
        if matched.iter().any(|f| INDULGENT.contains(&f.keyword)) {
            score -= 15;
            analysis
                .notes
                .push("Includes some indulgent items; balance it out later.".into());
        }
        if let Some(daily) = goals.daily_calories {
            // Three meals a day as the per-meal budget.
            let budget = daily / 3;
            if analysis.calories > budget {
                score -= 15;
                analysis.notes.push(format!(
                    "About {} kcal over a {} kcal per-meal budget.",
                    analysis.calories - budget,
                    budget
                ));
            }
        }
        if Self::is_vegetarian(goals) && matched.iter().any(|f| f.meat) {
            score -= 20;
            analysis
                .notes
                .push("Contains meat, which conflicts with your dietary restrictions.".into());
        }

        analysis.score = score.clamp(0, 100) as u8;
        analysis
    }

    fn recommend(&self, profile: &Profile, hint: Option<&str>) -> Vec<Recommendation> {
        let vegetarian = Self::is_vegetarian(&profile.goals);
        let recent: Vec<&MealAnalysis> = profile
            .recent_history(5)
            .iter()
            .filter_map(|entry| entry.analysis.as_ref())
            .collect();

        let avg = |f: fn(&MealAnalysis) -> u32| -> Option<u32> {
            if recent.is_empty() {
                None
            } else {
                Some(recent.iter().map(|a| f(a)).sum::<u32>() / recent.len() as u32)
            }
        };

        let mut recs = Vec::new();

        if let (Some(goal), Some(avg_protein)) = (profile.goals.protein_grams, avg(|a| a.protein_grams)) {
            if avg_protein < goal / 3 {
                let title = if vegetarian {
                    "Tofu stir-fry with lentils"
                } else {
                    "Grilled chicken salad"
                };
                recs.push(Recommendation {
                    title: title.into(),
                    reason: format!(
                        "Your recent meals average {avg_protein} g protein, under a third of your {goal} g goal."
                    ),
                });
            }
        }

        if let (Some(goal), Some(avg_calories)) = (profile.goals.daily_calories, avg(|a| a.calories)) {
            if avg_calories > goal / 3 {
                recs.push(Recommendation {
                    title: "Greek yogurt with berries".into(),
                    reason: format!(
                        "A lighter option: recent meals average {avg_calories} kcal against a {} kcal per-meal budget.",
                        goal / 3
                    ),
                });
            }
        }

        let wants_breakfast = hint.is_some_and(|h| h.to_ascii_lowercase().contains("breakfast"));
        if wants_breakfast {
            recs.push(Recommendation {
                title: "Oatmeal with banana and yogurt".into(),
                reason: "Slow carbs plus some protein to start the day.".into(),
            });
        }

        if recs.is_empty() {
            let title = if vegetarian {
                "Bean and avocado rice bowl"
            } else {
                "Salmon with rice and salad"
            };
            recs.push(Recommendation {
                title: title.into(),
                reason: "A balanced plate of protein, carbs and vegetables.".into(),
            });
        }

        recs.truncate(3);
        recs
    }
}
