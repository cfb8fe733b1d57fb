// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Provider trait definitions.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// LLM provider trait. Only the gateway talks to implementations.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate a completion.
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, ProviderError>;

    /// Get provider name.
    fn name(&self) -> &str;
}

/// Completion request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model name.
    pub model: String,

    /// User prompt.
    pub prompt: String,

    /// System instruction (optional).
    pub system: Option<String>,

    /// Temperature (0.0 - 2.0).
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    pub max_tokens: Option<u32>,
}

impl CompletionRequest {
    /// A plain prompt against a model with everything else defaulted.
    pub fn new(model: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            prompt: prompt.into(),
            system: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Completion response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionResponse {
    /// Generated text.
    pub text: String,

    /// Model that served the call.
    pub model: String,

    /// Prompt tokens consumed.
    pub prompt_tokens: u64,

    /// Completion tokens produced.
    pub completion_tokens: u64,
}

/// Provider error.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// HTTP request error.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// Authentication error.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The model endpoint is temporarily unavailable or overloaded.
    #[error("Model unavailable: {0}")]
    Unavailable(String),

    /// Invalid request.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Request timed out.
    #[error("Request timed out")]
    Timeout,

    /// Provider-specific API error.
    #[error("API error: {0}")]
    Api(String),
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl ProviderError {
    /// Whether the gateway may retry the call after a fixed delay.
    ///
    /// Besides the structurally transient variants, message bodies are
    /// matched for the upstream markers `UNAVAILABLE`, `overloaded`
    /// and `503`.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited | Self::Unavailable(_) | Self::Timeout => true,
            Self::Http(msg) | Self::Api(msg) => {
                msg.contains("UNAVAILABLE") || msg.contains("overloaded") || msg.contains("503")
            }
            _ => false,
        }
    }
}
