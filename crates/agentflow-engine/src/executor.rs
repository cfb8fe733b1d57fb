// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Step execution with per-step recovery.
//!
//! One executor instance serves one workflow run: it carries the
//! request-scoped invocation context injected into every tool call and
//! the per-run bookkeeping for token warnings and salvage passes.

use crate::backoff::{RetryExecutor, RetryPolicy};
use crate::config::EngineConfig;
use crate::limits::{self, TokenLimiter};
use crate::metrics;
use crate::variants::VariantGenerator;
use agentflow_core::error::EngineError;
use agentflow_core::template::resolve_value;
use agentflow_core::workflow::{Step, StepType};
use agentflow_core::{ExecutionContext, UsageWindow};
use agentflow_llm::LlmGateway;
use agentflow_state::StatusStream;
use agentflow_tools::{InvocationContext, ToolRegistry};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Pseudo-tool handled inside the executor; not required to be in the
/// registry.
pub const VARIANT_PSEUDO_TOOL: &str = "generate_search_variants";

/// System instruction for analysis and decision prompts.
const ANALYSIS_SYSTEM_PROMPT: &str =
    "You are the analysis engine of a workflow agent. Work only with the information provided in the task; do not invent data.";

/// Result of dispatching one step, branched on by the orchestrator.
#[derive(Debug)]
pub enum StepOutcome {
    /// The step produced a result.
    Done(Value),

    /// The step was bypassed; carries the reason and the result to
    /// store so downstream placeholders resolve.
    Skip {
        /// Why the step was bypassed.
        reason: String,
        /// Result recorded in place of execution.
        result: Value,
    },

    /// The step failed after exhausting its recovery options.
    Fail(EngineError),
}

/// Dispatches one step by type, with bounded retries and empty-result
/// salvage.
pub struct StepExecutor {
    registry: Arc<ToolRegistry>,
    gateway: Arc<LlmGateway>,
    limiter: Arc<TokenLimiter>,
    status: Arc<StatusStream>,
    config: EngineConfig,
    invocation: InvocationContext,
    warned_windows: parking_lot::Mutex<HashSet<UsageWindow>>,
}

impl StepExecutor {
    /// Create an executor for one workflow run.
    pub fn new(
        registry: Arc<ToolRegistry>,
        gateway: Arc<LlmGateway>,
        limiter: Arc<TokenLimiter>,
        status: Arc<StatusStream>,
        config: EngineConfig,
        invocation: InvocationContext,
    ) -> Self {
        Self {
            registry,
            gateway,
            limiter,
            status,
            config,
            invocation,
            warned_windows: parking_lot::Mutex::new(HashSet::new()),
        }
    }

    /// Execute one step against the context.
    pub async fn execute(&self, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
        info!(
            session = %self.invocation.session_id,
            step = step.step_number,
            step_type = step.step_type.as_str(),
            "Executing step"
        );
        metrics::STEPS_EXECUTED
            .with_label_values(&[step.step_type.as_str()])
            .inc();

        match step.step_type {
            StepType::ToolCall => self.execute_tool_call(step, ctx).await,
            StepType::Analysis | StepType::Decision => self.execute_analysis(step, ctx).await,
            StepType::Notification => self.execute_notification(step, ctx).await,
        }
    }

    async fn execute_tool_call(&self, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
        let resolved = resolve_value(&step.parameters, ctx);
        if !resolved.unresolved.is_empty() {
            return StepOutcome::Fail(EngineError::UnresolvedPlaceholders {
                refs: resolved.unresolved,
                available: ctx.keys(),
            });
        }

        let tool_name = step.tool.as_deref().unwrap_or_default();

        if tool_name == VARIANT_PSEUDO_TOOL {
            return self.generate_variants(&resolved.value, ctx);
        }

        let Some(tool) = self.registry.get(tool_name) else {
            return StepOutcome::Fail(EngineError::ToolNotFound(tool_name.to_string()));
        };

        let policy = RetryPolicy::linear(self.config.step_max_retries, self.config.step_retry_delay);
        let retry = RetryExecutor::new(policy);

        let params = resolved.value;
        let result = retry
            .execute(|| {
                let tool = tool.clone();
                let params = params.clone();
                async move {
                    match timeout(self.config.tool_timeout, tool.execute(params, &self.invocation))
                        .await
                    {
                        Ok(Ok(value)) => Ok(value),
                        Ok(Err(err)) => Err(EngineError::Tool {
                            tool: tool.name().to_string(),
                            message: err.to_string(),
                            retriable: err.is_transient(),
                        }),
                        Err(_) => Err(EngineError::Timeout {
                            seconds: self.config.tool_timeout.as_secs(),
                        }),
                    }
                }
            })
            .await;

        match result {
            Ok(value) => StepOutcome::Done(value),
            Err(err) => StepOutcome::Fail(err),
        }
    }

    /// The variant pseudo-tool writes straight into the context; the
    /// full list is also kept in the step result so re-attached runs
    /// can rehydrate it.
    fn generate_variants(&self, params: &Value, ctx: &ExecutionContext) -> StepOutcome {
        let title = first_string(params, &["base_title", "title", "what"]);
        let location = first_string(params, &["base_location", "location", "where"]);

        let Some(title) = title else {
            return StepOutcome::Fail(EngineError::validation(
                "generate_search_variants requires a base title",
            ));
        };
        let location = location.unwrap_or_default();

        let skills: Vec<String> = params
            .get("skills")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let count = VariantGenerator::apply(ctx, &title, &location, &skills);
        let list = ctx.get("search_variants_list").unwrap_or(json!([]));

        debug!(
            session = %self.invocation.session_id,
            count,
            "Generated search variants"
        );

        StepOutcome::Done(json!({
            "status": "success",
            "search_variants_count": count,
            "search_variants_list": list,
        }))
    }

    async fn execute_analysis(&self, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
        // The description may reference earlier results; it resolves
        // fail-open so a missing optional value does not kill the step.
        let prompt = resolve_value(&json!(step.description.clone()), ctx)
            .value
            .as_str()
            .unwrap_or(&step.description)
            .to_string();

        if let Err(err) = self.admit(&prompt).await {
            return StepOutcome::Fail(err);
        }

        let Some(schema) = &step.output_format else {
            return match self
                .gateway
                .complete(&prompt, Some(ANALYSIS_SYSTEM_PROMPT), "workflow")
                .await
            {
                Ok(response) => StepOutcome::Done(json!({ "text": response.text })),
                Err(err) => StepOutcome::Fail(EngineError::Provider(err.to_string())),
            };
        };

        let first = match self
            .gateway
            .complete_structured(&prompt, Some(ANALYSIS_SYSTEM_PROMPT), schema, "workflow")
            .await
        {
            Ok(value) => value,
            Err(err) => return StepOutcome::Fail(EngineError::Provider(err.to_string())),
        };

        if !schema.is_empty_result(&first) {
            return StepOutcome::Done(first);
        }

        // Empty-result salvage: one re-execution with a reinforced
        // description; the second result is kept even if still empty.
        warn!(
            session = %self.invocation.session_id,
            step = step.step_number,
            "Step returned only empty fields, re-executing with amended instruction"
        );

        let amended = format!(
            "{}\n\nThe previous extraction returned only empty fields. Extract concrete values from the available information; leave a field empty only if the information truly is not present.",
            prompt
        );

        if let Err(err) = self.admit(&amended).await {
            return StepOutcome::Fail(err);
        }

        match self
            .gateway
            .complete_structured(&amended, Some(ANALYSIS_SYSTEM_PROMPT), schema, "workflow")
            .await
        {
            Ok(second) => StepOutcome::Done(second),
            Err(err) => StepOutcome::Fail(EngineError::Provider(err.to_string())),
        }
    }

    async fn execute_notification(&self, step: &Step, ctx: &ExecutionContext) -> StepOutcome {
        let raw = step
            .parameters
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or(&step.description);

        let message = resolve_value(&json!(raw), ctx)
            .value
            .as_str()
            .unwrap_or(raw)
            .to_string();

        if let Err(err) = self.status.emit(&self.invocation.session_id, &message).await {
            return StepOutcome::Fail(EngineError::state(err.to_string()));
        }

        StepOutcome::Done(json!({ "status": "success", "message": message }))
    }

    /// Token admission for a planned model call. Warning crossings are
    /// emitted once per window per workflow run.
    async fn admit(&self, prompt: &str) -> Result<(), EngineError> {
        let estimate = limits::estimate_tokens(prompt);
        let warnings = self.limiter.admit(&self.invocation.user_id, estimate).await?;

        let fresh: Vec<UsageWindow> = {
            let mut warned = self.warned_windows.lock();
            warnings
                .into_iter()
                .filter(|w| warned.insert(*w))
                .collect()
        };

        for window in fresh {
            let _ = self
                .status
                .emit(
                    &self.invocation.session_id,
                    format!(
                        "Token usage in the {} window has crossed the warning threshold",
                        window.as_str()
                    ),
                )
                .await;
        }

        Ok(())
    }
}

fn first_string(params: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        params
            .get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.trim().is_empty())
            .map(str::to_string)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, ScriptedProvider, StaticTool};
    use agentflow_core::schema::{FieldType, OutputFormat};
    use agentflow_core::tokens::{TokenSettings, UsageRecord, WindowLimit};
    use agentflow_llm::{GatewayConfig, ProviderError};
    use agentflow_state::{MemoryStore, StatusStore, UsageStore};
    use agentflow_tools::ToolError;
    use std::time::Duration;

    struct Fixture {
        registry: Arc<ToolRegistry>,
        store: Arc<MemoryStore>,
        provider: Arc<ScriptedProvider>,
        executor: StepExecutor,
    }

    fn fixture(responses: Vec<Result<agentflow_llm::CompletionResponse, ProviderError>>) -> Fixture {
        let registry = Arc::new(ToolRegistry::new());
        let store = Arc::new(MemoryStore::new());
        let provider = Arc::new(ScriptedProvider::new(responses));

        let gateway_config = GatewayConfig {
            retry_delay: Duration::from_millis(1),
            ..GatewayConfig::default()
        };
        let gateway = Arc::new(agentflow_llm::LlmGateway::new(
            provider.clone(),
            gateway_config,
        ));
        let limiter = Arc::new(TokenLimiter::new(store.clone()));
        let status = Arc::new(StatusStream::new(store.clone()));

        let executor = StepExecutor::new(
            registry.clone(),
            gateway,
            limiter,
            status,
            EngineConfig::for_tests(),
            InvocationContext::new("u-1", "s-1", "wf-1"),
        );

        Fixture {
            registry,
            store,
            provider,
            executor,
        }
    }

    #[tokio::test]
    async fn test_unresolved_placeholders_abort_with_listing() {
        let fx = fixture(vec![]);
        let ctx = ExecutionContext::new();
        ctx.record_step_result(1, json!({"ok": true}));

        let step = Step::new(2, StepType::ToolCall, "Suche")
            .with_tool("job_search")
            .with_parameters(json!({"what": "{{step_1.result.missing.title}}", "where": "{{nowhere}}"}));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Fail(EngineError::UnresolvedPlaceholders { refs, available }) => {
                assert_eq!(refs.len(), 2);
                assert_eq!(available, vec!["step_1"]);
            }
            other => panic!("Expected unresolved failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_tool_fails_deterministically() {
        let fx = fixture(vec![]);
        let ctx = ExecutionContext::new();

        let step = Step::new(1, StepType::ToolCall, "Suche")
            .with_tool("job_search")
            .with_parameters(json!({"what": "Entwickler"}));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Fail(EngineError::ToolNotFound(name)) => assert_eq!(name, "job_search"),
            other => panic!("Expected ToolNotFound, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_tool_transient_failures_are_retried() {
        let fx = fixture(vec![]);
        let tool = StaticTool::new(
            "job_search",
            vec![
                Err(ToolError::Http("connection reset".to_string())),
                Ok(json!({"status": "success", "jobs": [{"title": "Dev"}]})),
            ],
        );
        fx.registry.register(tool.clone());

        let ctx = ExecutionContext::new();
        let step = Step::new(1, StepType::ToolCall, "Suche")
            .with_tool("job_search")
            .with_parameters(json!({"what": "Entwickler"}));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Done(value) => {
                assert_eq!(value["jobs"][0]["title"], json!("Dev"));
            }
            other => panic!("Expected success after retry, got {:?}", other),
        }
        assert_eq!(tool.invocations(), 2);
    }

    #[tokio::test]
    async fn test_tool_permanent_failure_is_not_retried() {
        let fx = fixture(vec![]);
        let tool = StaticTool::new(
            "job_search",
            vec![Err(ToolError::Execution {
                message: "unknown field".to_string(),
                retriable: false,
            })],
        );
        fx.registry.register(tool.clone());

        let ctx = ExecutionContext::new();
        let step = Step::new(1, StepType::ToolCall, "Suche")
            .with_tool("job_search")
            .with_parameters(json!({"what": "x"}));

        assert!(matches!(
            fx.executor.execute(&step, &ctx).await,
            StepOutcome::Fail(EngineError::Tool { .. })
        ));
        assert_eq!(tool.invocations(), 1);
    }

    #[tokio::test]
    async fn test_variant_pseudo_tool_writes_context() {
        let fx = fixture(vec![]);
        let ctx = ExecutionContext::new();

        let step = Step::new(1, StepType::ToolCall, "Erzeuge Suchvarianten")
            .with_tool(VARIANT_PSEUDO_TOOL)
            .with_parameters(json!({
                "base_title": "Geschäftsführer",
                "base_location": "Sereetz",
                "skills": ["PHP"]
            }));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Done(value) => {
                let count = value["search_variants_count"].as_u64().unwrap();
                assert!(count >= 5);
                assert_eq!(ctx.get("search_variants_count").unwrap(), json!(count));
                let list = ctx.get("search_variants_list").unwrap();
                assert_eq!(list[0]["priority"], json!(0));
            }
            other => panic!("Expected variants, got {:?}", other),
        }
    }

    // An all-empty extraction gets exactly one amended re-run.
    #[tokio::test]
    async fn test_empty_analysis_is_salvaged_once() {
        let fx = fixture(vec![
            Ok(ok_response("{\"job_title\": \"\", \"job_location\": \"\"}")),
            Ok(ok_response(
                "{\"job_title\": \"Engineer\", \"job_location\": \"Berlin\"}",
            )),
        ]);

        let ctx = ExecutionContext::new();
        let step = Step::new(1, StepType::Analysis, "Extrahiere Jobtitel und Ort")
            .with_output_format(OutputFormat::from_fields([
                ("job_title", FieldType::String),
                ("job_location", FieldType::String),
            ]));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Done(value) => {
                assert_eq!(value["job_title"], json!("Engineer"));
                assert_eq!(value["job_location"], json!("Berlin"));
            }
            other => panic!("Expected salvaged result, got {:?}", other),
        }
        assert_eq!(fx.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_persistently_empty_result_is_kept() {
        let fx = fixture(vec![
            Ok(ok_response("{\"job_title\": \"\"}")),
            Ok(ok_response("{\"job_title\": \"\"}")),
        ]);

        let ctx = ExecutionContext::new();
        let step = Step::new(1, StepType::Analysis, "Extrahiere")
            .with_output_format(OutputFormat::from_fields([("job_title", FieldType::String)]));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Done(value) => assert_eq!(value["job_title"], json!("")),
            other => panic!("Expected kept empty result, got {:?}", other),
        }
        assert_eq!(fx.provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_admission_rejection_fails_step() {
        let fx = fixture(vec![Ok(ok_response("{}"))]);

        let mut settings = TokenSettings::default();
        settings.day = WindowLimit::enabled(100);
        settings.month = WindowLimit::disabled();
        fx.store.put_settings("u-1", &settings).await.unwrap();
        let record = UsageRecord::new("u-1", "gemini-2.5-flash", "workflow", 90, 0, 0);
        fx.store.record_usage(&record).await.unwrap();

        let ctx = ExecutionContext::new();
        let step = Step::new(1, StepType::Analysis, "Analyse")
            .with_output_format(OutputFormat::from_fields([("x", FieldType::String)]));

        assert!(matches!(
            fx.executor.execute(&step, &ctx).await,
            StepOutcome::Fail(EngineError::TokenLimitExceeded { .. })
        ));
        assert_eq!(fx.provider.calls(), 0);
    }

    #[tokio::test]
    async fn test_warning_event_emitted_once_per_window() {
        let fx = fixture(vec![
            Ok(ok_response("{\"x\": \"a\"}")),
            Ok(ok_response("{\"x\": \"b\"}")),
        ]);

        let mut settings = TokenSettings::default();
        settings.day = WindowLimit::enabled(100_000);
        settings.month = WindowLimit::disabled();
        settings.warning_threshold_percent = 1;
        fx.store.put_settings("u-1", &settings).await.unwrap();

        let ctx = ExecutionContext::new();
        let schema = OutputFormat::from_fields([("x", FieldType::String)]);
        let first = Step::new(1, StepType::Analysis, "Analyse 1").with_output_format(schema.clone());
        let second = Step::new(2, StepType::Analysis, "Analyse 2").with_output_format(schema);

        fx.executor.execute(&first, &ctx).await;
        fx.executor.execute(&second, &ctx).await;

        let events = fx.store.events_since("s-1", None).await.unwrap();
        let warnings: Vec<_> = events
            .iter()
            .filter(|e| e.message.contains("warning threshold"))
            .collect();
        assert_eq!(warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_notification_renders_into_status_stream() {
        let fx = fixture(vec![]);
        let ctx = ExecutionContext::new();
        ctx.record_step_result(1, json!({"count": 4}));

        let step = Step::new(2, StepType::Notification, "Benachrichtigung")
            .with_parameters(json!({"message": "Gefunden: {{step_1.result.count}} Jobs"}));

        match fx.executor.execute(&step, &ctx).await {
            StepOutcome::Done(value) => {
                assert_eq!(value["message"], json!("Gefunden: 4 Jobs"));
            }
            other => panic!("Expected notification success, got {:?}", other),
        }

        let events = fx.store.events_since("s-1", None).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "Gefunden: 4 Jobs");
    }
}
