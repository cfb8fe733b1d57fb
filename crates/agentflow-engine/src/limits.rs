// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Token limiter: per-user admission against rolling usage windows.

use crate::metrics;
use agentflow_core::error::EngineError;
use agentflow_core::tokens::{UsageRecord, UsageWindow};
use agentflow_llm::UsageRecorder;
use agentflow_state::{UsageStore, UsageStoreRef};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Completion cap assumed when estimating a planned call.
const ESTIMATE_COMPLETION_TOKENS: u64 = 1024;

/// Rough token estimate for a planned call: one token per four prompt
/// characters plus the completion cap.
pub fn estimate_tokens(prompt: &str) -> u64 {
    (prompt.len() as u64) / 4 + ESTIMATE_COMPLETION_TOKENS
}

/// Result of a non-rejecting limit check (token governance endpoint).
#[derive(Debug, Clone, serde::Serialize)]
pub struct LimitCheck {
    /// Whether the call would be admitted.
    pub allowed: bool,

    /// The window that would reject it, if any.
    pub exceeded_window: Option<String>,

    /// Windows already past the warning threshold.
    pub warnings: Vec<String>,
}

/// Tracks per-user LLM token usage per window and admits or rejects
/// planned calls.
pub struct TokenLimiter {
    usage: UsageStoreRef,
    // Admission check and usage write form a critical section keyed by
    // user id; no global lock.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl TokenLimiter {
    /// Create a limiter over a usage store.
    pub fn new(usage: UsageStoreRef) -> Self {
        Self {
            usage,
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Admit a planned call.
    ///
    /// Sums usage over `[now - window, now]` for every enabled window;
    /// any crossing rejects with `TokenLimitExceeded`. On admission the
    /// windows that are past the warning threshold are returned so the
    /// orchestrator can emit (deduplicated) warning events.
    pub async fn admit(
        &self,
        user_id: &str,
        estimate: u64,
    ) -> Result<Vec<UsageWindow>, EngineError> {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let settings = self
            .usage
            .settings(user_id)
            .await
            .map_err(|e| EngineError::state(e.to_string()))?;

        let now = Utc::now();
        let mut warnings = Vec::new();

        for window in settings.enabled_windows() {
            let limit = settings.limit(window).limit;
            let used = self
                .usage
                .usage_since(user_id, now - window.duration())
                .await
                .map_err(|e| EngineError::state(e.to_string()))?;

            if used + estimate > limit {
                metrics::ADMISSION_REJECTIONS.inc();
                warn!(
                    user = %user_id,
                    window = window.as_str(),
                    used,
                    limit,
                    estimate,
                    "Token admission rejected: limit reached"
                );
                return Err(EngineError::TokenLimitExceeded {
                    window: window.as_str().to_string(),
                    used,
                    limit,
                    estimate,
                });
            }

            let threshold = limit * settings.warning_threshold_percent as u64 / 100;
            if used + estimate >= threshold {
                warnings.push(window);
            }
        }

        debug!(user = %user_id, estimate, "Token admission granted");
        Ok(warnings)
    }

    /// Non-rejecting check for the token governance endpoint.
    pub async fn check(&self, user_id: &str, estimate: u64) -> LimitCheck {
        match self.admit(user_id, estimate).await {
            Ok(warnings) => LimitCheck {
                allowed: true,
                exceeded_window: None,
                warnings: warnings.iter().map(|w| w.as_str().to_string()).collect(),
            },
            Err(EngineError::TokenLimitExceeded { window, .. }) => LimitCheck {
                allowed: false,
                exceeded_window: Some(window),
                warnings: Vec::new(),
            },
            Err(_) => LimitCheck {
                allowed: false,
                exceeded_window: None,
                warnings: Vec::new(),
            },
        }
    }

    /// Record a completed call. Usage is recorded even when the
    /// admission check already passed, feeding future window rollups.
    pub async fn record(
        &self,
        user_id: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
        agent_type: &str,
    ) {
        let lock = self.lock_for(user_id);
        let _guard = lock.lock().await;

        let cost_rate = match self.usage.settings(user_id).await {
            Ok(settings) => settings.cost_per_million_tokens,
            Err(_) => 0,
        };

        let record = UsageRecord::new(
            user_id,
            model,
            agent_type,
            prompt_tokens,
            completion_tokens,
            cost_rate,
        );

        metrics::LLM_CALLS.inc();
        metrics::TOKENS_CONSUMED.inc_by(record.total_tokens);

        if let Err(err) = self.usage.record_usage(&record).await {
            // Accounting must not fail the workflow.
            warn!(user = %user_id, error = %err, "Failed to record token usage");
        }
    }
}

/// Adapter wiring the gateway's usage hook to the limiter for one
/// workflow's user.
pub struct WorkflowUsageRecorder {
    limiter: Arc<TokenLimiter>,
    user_id: String,
}

impl WorkflowUsageRecorder {
    /// Bind a limiter to a user.
    pub fn new(limiter: Arc<TokenLimiter>, user_id: impl Into<String>) -> Self {
        Self {
            limiter,
            user_id: user_id.into(),
        }
    }
}

#[async_trait]
impl UsageRecorder for WorkflowUsageRecorder {
    async fn record(&self, model: &str, prompt_tokens: u64, completion_tokens: u64, agent_type: &str) {
        self.limiter
            .record(&self.user_id, model, prompt_tokens, completion_tokens, agent_type)
            .await;
    }
}
