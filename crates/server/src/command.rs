//! Command recognition and parsing.
//!
//! A message is a command if it starts with [`COMMAND_PREFIX`] or matches one
//! of a few natural-language patterns. Parsing is deterministic: prefix-style
//! tokens win over whole-phrase patterns, and starts-with phrases win over
//! contains phrases.

use serde_json::{json, Map, Value};

pub const COMMAND_PREFIX: char = '/';

/// Default number of history entries returned by `get-history`.
pub const DEFAULT_HISTORY_LIMIT: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandType {
    AnalyzeMeal,
    Recommend,
    SetGoals,
    GetHistory,
    Help,
    /// A prefixed command with a name we don't know.
    Unknown(String),
}

impl CommandType {
    pub fn as_str(&self) -> &str {
        match self {
            CommandType::AnalyzeMeal => "analyze-meal",
            CommandType::Recommend => "recommend",
            CommandType::SetGoals => "set-goals",
            CommandType::GetHistory => "get-history",
            CommandType::Help => "help",
            CommandType::Unknown(name) => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCommand {
    pub command_type: CommandType,
    pub payload: Value,
}

impl ParsedCommand {
    fn new(command_type: CommandType, payload: Value) -> Self {
        Self {
            command_type,
            payload,
        }
    }
}

/// Pure predicate: would [`parse_command`] claim this text?
pub fn is_command(text: &str) -> bool {
    let text = text.trim();
    if text.starts_with(COMMAND_PREFIX) {
        return true;
    }
    let lower = text.to_lowercase();
    lower.starts_with("analyze")
        || lower.starts_with("set goal")
        || lower.contains("show history")
        || lower.contains("meal history")
        || lower.contains("recommend")
        || lower.contains("suggest")
}

pub fn parse_command(text: &str) -> Option<ParsedCommand> {
    let text = text.trim();

    if let Some(body) = text.strip_prefix(COMMAND_PREFIX) {
        return Some(parse_prefixed(body));
    }

    let lower = text.to_lowercase();
    if lower.starts_with("analyze") {
        let rest = strip_leading(text.get("analyze".len()..).unwrap_or(""));
        return Some(analyze(rest));
    }
    if lower.starts_with("set goal") {
        let skip = if lower.starts_with("set goals") {
            "set goals".len()
        } else {
            "set goal".len()
        };
        let rest = text.get(skip..).unwrap_or("");
        return Some(ParsedCommand::new(
            CommandType::SetGoals,
            parse_goals(strip_leading(rest)),
        ));
    }
    if lower.contains("show history") || lower.contains("meal history") {
        return Some(history(None));
    }
    if lower.contains("recommend") || lower.contains("suggest") {
        return Some(ParsedCommand::new(
            CommandType::Recommend,
            json!({ "hint": text }),
        ));
    }
    None
}

fn parse_prefixed(body: &str) -> ParsedCommand {
    let body = body.trim();
    let (name, rest) = match body.find(char::is_whitespace) {
        Some(idx) => (&body[..idx], body[idx..].trim()),
        None => (body, ""),
    };

    match name.to_lowercase().as_str() {
        "analyze" | "analyze-meal" | "meal" | "log" => analyze(rest),
        "recommend" | "suggest" => {
            let hint = if rest.is_empty() {
                Value::Null
            } else {
                Value::String(rest.to_string())
            };
            ParsedCommand::new(CommandType::Recommend, json!({ "hint": hint }))
        }
        "goals" | "goal" | "set-goals" => {
            ParsedCommand::new(CommandType::SetGoals, parse_goals(rest))
        }
        "history" | "get-history" => history(rest.parse().ok()),
        "help" | "" => ParsedCommand::new(CommandType::Help, json!({})),
        other => ParsedCommand::new(CommandType::Unknown(other.to_string()), json!({})),
    }
}

fn analyze(description: &str) -> ParsedCommand {
    ParsedCommand::new(
        CommandType::AnalyzeMeal,
        json!({ "mealDescription": description }),
    )
}

fn history(limit: Option<usize>) -> ParsedCommand {
    ParsedCommand::new(
        CommandType::GetHistory,
        json!({ "limit": limit.unwrap_or(DEFAULT_HISTORY_LIMIT) }),
    )
}

fn strip_leading(text: &str) -> &str {
    text.trim_start_matches(|c: char| c.is_whitespace() || c == ':')
        .trim_end()
}

const RESTRICTIONS: &[&str] = &[
    "vegetarian",
    "vegan",
    "pescatarian",
    "gluten-free",
    "dairy-free",
    "nut-free",
    "keto",
    "halal",
    "kosher",
];

fn metric_key(token: &str) -> Option<&'static str> {
    match token {
        "calories" | "calorie" | "kcal" | "cal" => Some("dailyCalories"),
        "protein" => Some("proteinGrams"),
        "carbs" | "carb" | "carbohydrates" => Some("carbsGrams"),
        "fat" | "fats" => Some("fatGrams"),
        _ => None,
    }
}

fn number(token: &str) -> Option<u64> {
    token
        .trim_end_matches("kcal")
        .trim_end_matches('g')
        .parse()
        .ok()
}

/// Pull goal fields out of free text such as
/// `calories 2000, 140g protein, vegetarian, focus muscle gain`.
///
/// Keys match the camelCase goal fields; anything unrecognized is ignored.
pub fn parse_goals(text: &str) -> Value {
    let normalized: String = text
        .to_lowercase()
        .chars()
        .map(|c| if matches!(c, ',' | '=' | ':' | ';') { ' ' } else { c })
        .collect();
    let tokens: Vec<&str> = normalized.split_whitespace().collect();

    let mut goals = Map::new();
    let mut restrictions = Vec::new();
    let mut consumed = vec![false; tokens.len()];
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];

        if token == "focus" {
            let focus = tokens[i + 1..].join(" ");
            if !focus.is_empty() {
                goals.insert("focus".into(), Value::String(focus));
            }
            break;
        }

        if let Some(key) = metric_key(token) {
            // "140g protein" claims the number before; otherwise "protein 140".
            let before = i.checked_sub(1).filter(|&p| !consumed[p]);
            let after = Some(i + 1).filter(|&n| n < tokens.len());
            let found = [before, after]
                .into_iter()
                .flatten()
                .find_map(|idx| number(tokens[idx]).map(|v| (idx, v)));
            if let Some((idx, value)) = found {
                consumed[idx] = true;
                goals.insert(key.into(), json!(value));
            }
        } else if RESTRICTIONS.contains(&token) {
            restrictions.push(Value::String(token.to_string()));
        }
        i += 1;
    }

    if !restrictions.is_empty() {
        goals.insert("dietaryRestrictions".into(), Value::Array(restrictions));
    }
    Value::Object(goals)
}
