use std::collections::BTreeMap;
use std::ops::AddAssign;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_creation: u64,
}

impl TokenUsage {
    pub fn new(input: u64, output: u64, cache_read: u64, cache_creation: u64) -> Self {
        Self {
            input,
            output,
            cache_read,
            cache_creation,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.input == 0 && self.output == 0 && self.cache_read == 0 && self.cache_creation == 0
    }

    pub fn billable(&self) -> u64 {
        self.input.saturating_add(self.output)
    }

    pub fn total(&self) -> u64 {
        self.input
            .saturating_add(self.output)
            .saturating_add(self.cache_read)
            .saturating_add(self.cache_creation)
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input = self.input.saturating_add(rhs.input);
        self.output = self.output.saturating_add(rhs.output);
        self.cache_read = self.cache_read.saturating_add(rhs.cache_read);
        self.cache_creation = self.cache_creation.saturating_add(rhs.cache_creation);
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ModelUsage {
    pub tokens: TokenUsage,
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DayActivity {
    pub message_count: u64,
    pub session_count: u64,
    pub token_count: u64,
}

impl AddAssign for DayActivity {
    fn add_assign(&mut self, rhs: Self) {
        self.message_count += rhs.message_count;
        self.session_count += rhs.session_count;
        self.token_count += rhs.token_count;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSummary {
    pub id: String,
    pub display_name: String,
    pub path: String,
    pub session_count: u64,
    pub message_count: u64,
    pub total_tokens: TokenUsage,
    pub last_active: Option<DateTime<Utc>>,
    pub estimated_cost: f64,
    #[serde(default)]
    pub models: BTreeMap<String, ModelUsage>,
    #[serde(default)]
    pub daily: BTreeMap<NaiveDate, DayActivity>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct DailyActivity {
    pub date: NaiveDate,
    pub message_count: u64,
    pub session_count: u64,
    pub token_count: u64,
    // Approximation: all-time cost scaled by this day's token share.
    pub estimated_cost: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Streaks {
    pub current: u32,
    pub longest: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ParseStrategy {
    #[default]
    None,
    Sequential,
    Parallel,
    Fallback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct RefreshStats {
    pub parsed_projects: usize,
    pub cached_projects: usize,
    pub strategy: ParseStrategy,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct AggregateState {
    pub projects: Vec<ProjectSummary>,
    pub total_estimated_cost: f64,
    pub total_tokens: TokenUsage,
    pub total_sessions: u64,
    pub total_messages: u64,
    pub cache_hit_ratio: f64,
    pub model_breakdown: BTreeMap<String, ModelUsage>,
    pub daily_activity: Vec<DailyActivity>,
    pub streaks: Streaks,
    pub most_active_day: Option<DailyActivity>,
    pub refresh: RefreshStats,
    pub generated_at: DateTime<Utc>,
}

impl AggregateState {
    pub fn empty(generated_at: DateTime<Utc>) -> Self {
        Self {
            generated_at,
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_usage_accumulates_and_defaults_missing_fields() {
        let parsed: TokenUsage = serde_json::from_str(r#"{"input":5}"#).expect("parse");
        assert_eq!(parsed, TokenUsage::new(5, 0, 0, 0));

        let mut total = TokenUsage::default();
        total += TokenUsage::new(1, 2, 3, 4);
        total += TokenUsage::new(10, 20, 30, 40);
        assert_eq!(total, TokenUsage::new(11, 22, 33, 44));
        assert_eq!(total.billable(), 33);
        assert_eq!(total.total(), 110);
        assert!(TokenUsage::default().is_zero());
    }

    #[test]
    fn summary_serializes_camel_case() {
        let summary = ProjectSummary {
            id: "-repo-app".to_string(),
            display_name: "app".to_string(),
            session_count: 2,
            ..ProjectSummary::default()
        };
        let value = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(value["displayName"], "app");
        assert_eq!(value["sessionCount"], 2);
        assert!(value.get("totalTokens").is_some());
    }
}
