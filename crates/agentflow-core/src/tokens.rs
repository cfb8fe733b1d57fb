// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Token governance types: per-user window limits and usage records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The fixed set of rolling usage windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageWindow {
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl UsageWindow {
    /// All windows in ascending length.
    pub const ALL: [UsageWindow; 5] = [
        UsageWindow::Minute,
        UsageWindow::Hour,
        UsageWindow::Day,
        UsageWindow::Week,
        UsageWindow::Month,
    ];

    /// The rolling window length. A month is fixed to 30 days.
    pub fn duration(&self) -> Duration {
        match self {
            Self::Minute => Duration::minutes(1),
            Self::Hour => Duration::hours(1),
            Self::Day => Duration::days(1),
            Self::Week => Duration::weeks(1),
            Self::Month => Duration::days(30),
        }
    }

    /// Wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::Day => "day",
            Self::Week => "week",
            Self::Month => "month",
        }
    }
}

/// Limit for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    /// Maximum tokens admitted within the window.
    pub limit: u64,

    /// Disabled windows are ignored by admission.
    pub enabled: bool,
}

impl WindowLimit {
    /// An enabled limit.
    pub fn enabled(limit: u64) -> Self {
        Self { limit, enabled: true }
    }

    /// A disabled limit.
    pub fn disabled() -> Self {
        Self { limit: 0, enabled: false }
    }
}

/// Per-user token limits across all windows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSettings {
    pub minute: WindowLimit,
    pub hour: WindowLimit,
    pub day: WindowLimit,
    pub week: WindowLimit,
    pub month: WindowLimit,

    /// Usage percentage at which a warning event is emitted.
    pub warning_threshold_percent: u8,

    /// Model cost in micro-units per million tokens, used for usage
    /// cost attribution.
    pub cost_per_million_tokens: u64,
}

impl Default for TokenSettings {
    fn default() -> Self {
        Self {
            minute: WindowLimit::disabled(),
            hour: WindowLimit::disabled(),
            day: WindowLimit::enabled(100_000),
            week: WindowLimit::disabled(),
            month: WindowLimit::enabled(1_000_000),
            warning_threshold_percent: 80,
            cost_per_million_tokens: 150_000,
        }
    }
}

impl TokenSettings {
    /// The limit configured for a window.
    pub fn limit(&self, window: UsageWindow) -> WindowLimit {
        match window {
            UsageWindow::Minute => self.minute,
            UsageWindow::Hour => self.hour,
            UsageWindow::Day => self.day,
            UsageWindow::Week => self.week,
            UsageWindow::Month => self.month,
        }
    }

    /// Windows with admission enabled.
    pub fn enabled_windows(&self) -> Vec<UsageWindow> {
        UsageWindow::ALL
            .into_iter()
            .filter(|w| self.limit(*w).enabled)
            .collect()
    }
}

/// One recorded LLM call, attributed to a model and an agent type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageRecord {
    /// Record identifier.
    pub id: Uuid,

    /// The user the call was made on behalf of.
    pub user_id: String,

    /// Model that served the call.
    pub model: String,

    /// Which agent surface made the call (e.g. "workflow", "planner").
    pub agent_type: String,

    /// Prompt tokens consumed.
    pub prompt_tokens: u64,

    /// Completion tokens produced.
    pub completion_tokens: u64,

    /// Total tokens.
    pub total_tokens: u64,

    /// Cost in micro-units derived from `cost_per_million_tokens`.
    pub cost_micros: u64,

    /// When the call completed.
    pub created_at: DateTime<Utc>,
}

impl UsageRecord {
    /// Build a record, deriving totals and micro-unit cost.
    pub fn new(
        user_id: impl Into<String>,
        model: impl Into<String>,
        agent_type: impl Into<String>,
        prompt_tokens: u64,
        completion_tokens: u64,
        cost_per_million_tokens: u64,
    ) -> Self {
        let total_tokens = prompt_tokens + completion_tokens;
        let cost_micros = total_tokens * cost_per_million_tokens / 1_000_000;

        Self {
            id: Uuid::new_v4(),
            user_id: user_id.into(),
            model: model.into(),
            agent_type: agent_type.into(),
            prompt_tokens,
            completion_tokens,
            total_tokens,
            cost_micros,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_windows_follow_settings() {
        let mut settings = TokenSettings::default();
        settings.minute = WindowLimit::enabled(500);
        settings.month = WindowLimit::disabled();

        assert_eq!(
            settings.enabled_windows(),
            vec![UsageWindow::Minute, UsageWindow::Day]
        );
    }

    #[test]
    fn test_usage_record_cost_derivation() {
        let record = UsageRecord::new("u-1", "gemini-2.5-flash", "workflow", 900, 100, 150_000);
        assert_eq!(record.total_tokens, 1000);
        // 1000 tokens at 150_000 micro-units per million.
        assert_eq!(record.cost_micros, 150);
    }

    #[test]
    fn test_window_durations_are_ascending() {
        let mut last = Duration::zero();
        for window in UsageWindow::ALL {
            assert!(window.duration() > last);
            last = window.duration();
        }
    }
}
