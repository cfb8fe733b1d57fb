// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! LLM gateway: retry, model fallback, structured extraction and
//! usage accounting around a provider.

use crate::extract;
use crate::provider::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};
use agentflow_core::schema::OutputFormat;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Receives usage figures after every successful call.
///
/// The token limiter implements this; the gateway stays independent of
/// the engine crate.
#[async_trait]
pub trait UsageRecorder: Send + Sync {
    /// Record one completed call.
    async fn record(&self, model: &str, prompt_tokens: u64, completion_tokens: u64, agent_type: &str);
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Model used until the failure threshold trips.
    pub primary_model: String,

    /// Lighter model used after repeated primary failures.
    pub fallback_model: String,

    /// Upper bound on attempts per call (interactive default 5).
    pub max_attempts: u32,

    /// Fixed delay between transient-failure attempts (default 60 s).
    pub retry_delay: Duration,

    /// Consecutive failures on the primary model before subsequent
    /// calls switch to the fallback model.
    pub fallback_after: u32,

    /// Sampling temperature forwarded to the provider.
    pub temperature: Option<f32>,

    /// Output token cap forwarded to the provider.
    pub max_tokens: Option<u32>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            primary_model: "gemini-2.5-flash".to_string(),
            fallback_model: "gemini-2.0-flash-lite".to_string(),
            max_attempts: 5,
            retry_delay: Duration::from_secs(60),
            fallback_after: 3,
            temperature: Some(0.2),
            max_tokens: Some(8192),
        }
    }
}

impl GatewayConfig {
    /// Batch profile: the retry bound is raised for off-request work.
    pub fn batch(mut self) -> Self {
        self.max_attempts = 50;
        self
    }
}

/// Wraps the model endpoint for the rest of the engine.
pub struct LlmGateway {
    provider: Arc<dyn LlmProvider>,
    config: GatewayConfig,
    consecutive_failures: AtomicU32,
    fallback_engaged: AtomicBool,
    recorder: Option<Arc<dyn UsageRecorder>>,
}

impl LlmGateway {
    /// Create a gateway over a provider.
    pub fn new(provider: Arc<dyn LlmProvider>, config: GatewayConfig) -> Self {
        Self {
            provider,
            config,
            consecutive_failures: AtomicU32::new(0),
            fallback_engaged: AtomicBool::new(false),
            recorder: None,
        }
    }

    /// Attach a usage recorder.
    pub fn with_recorder(mut self, recorder: Arc<dyn UsageRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// The model the next call will use.
    pub fn active_model(&self) -> &str {
        if self.fallback_engaged.load(Ordering::Relaxed) {
            &self.config.fallback_model
        } else {
            &self.config.primary_model
        }
    }

    fn note_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= self.config.fallback_after
            && !self.fallback_engaged.swap(true, Ordering::Relaxed)
        {
            warn!(
                failures,
                fallback = %self.config.fallback_model,
                "Primary model keeps failing, switching to fallback model"
            );
        }
    }

    async fn record_usage(&self, response: &CompletionResponse, agent_type: &str) {
        if let Some(recorder) = &self.recorder {
            recorder
                .record(
                    &response.model,
                    response.prompt_tokens,
                    response.completion_tokens,
                    agent_type,
                )
                .await;
        }
    }

    /// Run one prompt with retry and fallback; returns the raw
    /// completion.
    pub async fn complete(
        &self,
        prompt: &str,
        system: Option<&str>,
        agent_type: &str,
    ) -> Result<CompletionResponse, ProviderError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let model = self.active_model().to_string();
            let request = CompletionRequest {
                model: model.clone(),
                prompt: prompt.to_string(),
                system: system.map(str::to_string),
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };

            debug!(model = %model, attempt, agent_type, "Calling model endpoint");

            match self.provider.complete(request).await {
                Ok(response) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    self.record_usage(&response, agent_type).await;
                    return Ok(response);
                }
                Err(err) if err.is_transient() && attempt < self.config.max_attempts => {
                    self.note_failure();
                    warn!(
                        model = %model,
                        attempt,
                        error = %err,
                        delay_ms = self.config.retry_delay.as_millis() as u64,
                        "Transient model failure, retrying after fixed delay"
                    );
                    tokio::time::sleep(self.config.retry_delay).await;
                }
                Err(err) => {
                    self.note_failure();
                    return Err(err);
                }
            }
        }
    }

    /// Run a prompt expecting the declared schema.
    ///
    /// On a parse failure the call is re-prompted once with a strict
    /// shape reminder; if the second response still does not parse,
    /// the schema's default object is returned so downstream decides.
    pub async fn complete_structured(
        &self,
        prompt: &str,
        system: Option<&str>,
        schema: &OutputFormat,
        agent_type: &str,
    ) -> Result<Value, ProviderError> {
        let typed_prompt = format!("{}{}", prompt, extract::schema_instruction(schema));
        let response = self.complete(&typed_prompt, system, agent_type).await?;

        if let Some(parsed) = extract::parse_structured(&response.text, schema) {
            return Ok(parsed);
        }

        debug!(agent_type, "Structured parse failed, re-prompting with strict reminder");

        let reminder = format!(
            "{}\n\n{}",
            typed_prompt,
            extract::strict_reminder(schema)
        );
        let second = self.complete(&reminder, system, agent_type).await?;

        Ok(extract::parse_structured(&second.text, schema)
            .unwrap_or_else(|| schema.default_object()))
    }
}
