// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Engine configuration.

use std::time::Duration;

/// Tunable knobs of the execution engine. Defaults match production;
/// tests shrink the delays to milliseconds.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bounded in-executor retries per step for transient failures.
    pub step_max_retries: u32,

    /// Base delay of the executor's linear backoff.
    pub step_retry_delay: Duration,

    /// Per-attempt timeout for tool invocations.
    pub tool_timeout: Duration,

    /// Per-attempt timeout for model calls (the gateway applies its own
    /// retry policy underneath).
    pub llm_timeout: Duration,

    /// Total failure budget before optional-tool skipping stops and the
    /// workflow fails.
    pub max_optional_failures: u32,

    /// Worker pool size: workflows executing in parallel.
    pub max_workers: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_max_retries: 2,
            step_retry_delay: Duration::from_secs(2),
            tool_timeout: Duration::from_secs(30),
            llm_timeout: Duration::from_secs(120),
            max_optional_failures: 3,
            max_workers: 32,
        }
    }
}

impl EngineConfig {
    /// Millisecond-scale delays for tests.
    pub fn for_tests() -> Self {
        Self {
            step_retry_delay: Duration::from_millis(1),
            tool_timeout: Duration::from_secs(5),
            llm_timeout: Duration::from_secs(5),
            ..Self::default()
        }
    }
}
