// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Prometheus counters for engine observability.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec,
};

lazy_static! {
    /// Workflows that entered the running state.
    pub static ref WORKFLOWS_STARTED: IntCounter = register_int_counter!(
        "agentflow_workflows_started_total",
        "Workflows that entered the running state"
    )
    .expect("metric registration");

    /// Workflows by terminal outcome.
    pub static ref WORKFLOWS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "agentflow_workflows_finished_total",
        "Workflows reaching a terminal state",
        &["outcome"]
    )
    .expect("metric registration");

    /// Steps executed by type.
    pub static ref STEPS_EXECUTED: IntCounterVec = register_int_counter_vec!(
        "agentflow_steps_executed_total",
        "Steps dispatched by the executor",
        &["step_type"]
    )
    .expect("metric registration");

    /// Steps skipped (smart retry, conditions, optional tools).
    pub static ref STEPS_SKIPPED: IntCounter = register_int_counter!(
        "agentflow_steps_skipped_total",
        "Steps bypassed instead of executed"
    )
    .expect("metric registration");

    /// Model calls admitted through the token limiter.
    pub static ref LLM_CALLS: IntCounter = register_int_counter!(
        "agentflow_llm_calls_total",
        "Model calls issued through the gateway"
    )
    .expect("metric registration");

    /// Total tokens recorded by the limiter.
    pub static ref TOKENS_CONSUMED: IntCounter = register_int_counter!(
        "agentflow_tokens_consumed_total",
        "Tokens recorded across all users"
    )
    .expect("metric registration");

    /// Calls rejected by token admission.
    pub static ref ADMISSION_REJECTIONS: IntCounter = register_int_counter!(
        "agentflow_admission_rejections_total",
        "Model calls rejected by token admission"
    )
    .expect("metric registration");
}
