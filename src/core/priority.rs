//! Priority hints accepted at the enqueue boundary.
//!
//! A producer either states a numeric score or a named level. Both resolve to
//! a score in `[0, 1]` through [`PriorityHint::score`], the only place that
//! conversion happens.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// Score used when a message carries no usable priority.
pub const DEFAULT_PRIORITY: f64 = 0.5;

/// Message field inspected by [`PriorityHint::from_message`].
pub const PRIORITY_FIELD: &str = "priority";

/// Named priority levels.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum PriorityLevel {
    #[serde(alias = "critical")]
    Urgent,
    High,
    #[serde(alias = "normal")]
    Regular,
    Low,
}

impl PriorityLevel {
    pub fn score(self) -> f64 {
        match self {
            PriorityLevel::Urgent => 1.0,
            PriorityLevel::High => 0.8,
            PriorityLevel::Regular => DEFAULT_PRIORITY,
            PriorityLevel::Low => 0.1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PriorityLevel::Urgent => "urgent",
            PriorityLevel::High => "high",
            PriorityLevel::Regular => "regular",
            PriorityLevel::Low => "low",
        }
    }
}

impl Default for PriorityLevel {
    fn default() -> Self {
        PriorityLevel::Regular
    }
}

impl std::fmt::Display for PriorityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for PriorityLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "urgent" | "critical" => Ok(PriorityLevel::Urgent),
            "high" => Ok(PriorityLevel::High),
            "regular" | "normal" => Ok(PriorityLevel::Regular),
            "low" => Ok(PriorityLevel::Low),
            _ => Err(format!("Unknown priority level: {}", s)),
        }
    }
}

/// Explicit priority indicator: a raw score or a named level.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum PriorityHint {
    Score(f64),
    Level(PriorityLevel),
}

impl PriorityHint {
    /// Read the `priority` field of a message payload, if it holds something usable.
    pub fn from_message(message: &Value) -> Option<Self> {
        match message.get(PRIORITY_FIELD)? {
            Value::Number(n) => n.as_f64().map(PriorityHint::Score),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Resolve to a score in `[0, 1]`.
    pub fn score(self) -> f64 {
        match self {
            PriorityHint::Score(score) => clamp_score(score),
            PriorityHint::Level(level) => level.score(),
        }
    }
}

impl From<PriorityLevel> for PriorityHint {
    fn from(level: PriorityLevel) -> Self {
        PriorityHint::Level(level)
    }
}

impl From<f64> for PriorityHint {
    fn from(score: f64) -> Self {
        PriorityHint::Score(score)
    }
}

impl FromStr for PriorityHint {
    type Err = String;

    /// Accepts either a number (`"0.7"`) or a level name (`"urgent"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(score) = s.trim().parse::<f64>() {
            return Ok(PriorityHint::Score(score));
        }
        s.parse::<PriorityLevel>().map(PriorityHint::Level)
    }
}

/// Priority score for an optional hint; absent hints get [`DEFAULT_PRIORITY`].
pub fn resolve_priority(hint: Option<PriorityHint>) -> f64 {
    hint.map_or(DEFAULT_PRIORITY, PriorityHint::score)
}

/// Clamp into `[0, 1]`. NaN falls back to the default.
pub fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        DEFAULT_PRIORITY
    } else {
        score.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_level_scores() {
        assert_eq!(PriorityLevel::Urgent.score(), 1.0);
        assert_eq!(PriorityLevel::Regular.score(), 0.5);
        assert_eq!(PriorityLevel::Low.score(), 0.1);
    }

    #[test]
    fn test_from_message() {
        assert_eq!(
            PriorityHint::from_message(&json!({"priority": 0.9})),
            Some(PriorityHint::Score(0.9))
        );
        assert_eq!(
            PriorityHint::from_message(&json!({"priority": "URGENT"})),
            Some(PriorityHint::Level(PriorityLevel::Urgent))
        );
        assert_eq!(
            PriorityHint::from_message(&json!({"priority": "0.25"})),
            Some(PriorityHint::Score(0.25))
        );
        assert_eq!(PriorityHint::from_message(&json!({"text": "hi"})), None);
        assert_eq!(PriorityHint::from_message(&json!({"priority": "whenever"})), None);
        assert_eq!(PriorityHint::from_message(&json!("plain string")), None);
    }

    #[test]
    fn test_resolve_clamps_and_defaults() {
        assert_eq!(resolve_priority(None), DEFAULT_PRIORITY);
        assert_eq!(resolve_priority(Some(PriorityHint::Score(4.0))), 1.0);
        assert_eq!(resolve_priority(Some(PriorityHint::Score(-1.0))), 0.0);
        assert_eq!(resolve_priority(Some(PriorityHint::Score(f64::NAN))), DEFAULT_PRIORITY);
        assert_eq!(resolve_priority(Some(PriorityLevel::High.into())), 0.8);
    }

    #[test]
    fn test_hint_serde() {
        let hint: PriorityHint = serde_json::from_value(json!("normal")).unwrap();
        assert_eq!(hint, PriorityHint::Level(PriorityLevel::Regular));

        let hint: PriorityHint = serde_json::from_value(json!(0.3)).unwrap();
        assert_eq!(hint, PriorityHint::Score(0.3));
    }
}
