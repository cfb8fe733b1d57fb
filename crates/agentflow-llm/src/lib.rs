// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! LLM provider integration for the agentflow workflow engine.
//!
//! The gateway is the only component that talks to the model endpoint:
//! it applies the fixed-delay retry policy, switches to a lighter
//! fallback model after repeated failures, performs schema-typed
//! extraction and reports usage to the token limiter.

pub mod extract;
pub mod gateway;
pub mod gemini;
pub mod provider;

pub use gateway::{GatewayConfig, LlmGateway, UsageRecorder};
pub use gemini::GeminiProvider;
pub use provider::{CompletionRequest, CompletionResponse, LlmProvider, ProviderError};
