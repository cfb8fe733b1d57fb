// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Planner: one-shot intent → step list, validated against the tool
//! catalog.

use crate::executor::VARIANT_PSEUDO_TOOL;
use agentflow_core::error::{EngineError, Result};
use agentflow_core::schema::{FieldType, OutputFormat};
use agentflow_core::workflow::{Step, StepType, Workflow};
use agentflow_llm::{extract, LlmGateway};
use agentflow_tools::ToolRegistry;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

const PLANNER_SYSTEM_PROMPT: &str = "You are the planner of a workflow agent. You turn a user's intent into an executable plan of discrete, typed steps. Use only the tools from the catalog. Respond with a single JSON object and no other text.";

/// Wire format of a planned step, as produced by the model.
#[derive(Debug, Deserialize)]
struct PlannedStep {
    step_number: u32,
    step_type: StepType,
    description: String,
    #[serde(default)]
    tool: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
    #[serde(default)]
    output_format: Option<PlannedOutputFormat>,
    #[serde(default)]
    skip_if: Option<String>,
    #[serde(default)]
    requires_confirmation: bool,
}

/// `{"type": "object", "fields": {...}}` as declared in the plan schema.
#[derive(Debug, Deserialize)]
struct PlannedOutputFormat {
    #[serde(rename = "type", default)]
    #[allow(dead_code)]
    format_type: String,
    fields: BTreeMap<String, FieldType>,
}

#[derive(Debug, Deserialize)]
struct PlannedSteps {
    steps: Vec<PlannedStep>,
}

/// Turns user intent plus the current tool catalog into a validated
/// workflow. An invalid plan gets exactly one repair round-trip.
pub struct Planner {
    gateway: Arc<LlmGateway>,
    registry: Arc<ToolRegistry>,
}

impl Planner {
    /// Create a planner over a gateway and the tool registry.
    pub fn new(gateway: Arc<LlmGateway>, registry: Arc<ToolRegistry>) -> Self {
        Self { gateway, registry }
    }

    /// Produce a validated plan for an intent.
    pub async fn plan(&self, intent: &str, session_id: &str) -> Result<Workflow> {
        let prompt = self.build_prompt(intent);

        let first = self
            .gateway
            .complete(&prompt, Some(PLANNER_SYSTEM_PROMPT), "planner")
            .await
            .map_err(|e| EngineError::Provider(e.to_string()))?;

        match self.parse_and_validate(intent, session_id, &first.text) {
            Ok(workflow) => Ok(workflow),
            Err(problems) => {
                warn!(
                    session = %session_id,
                    problems = problems.join("; "),
                    "Plan rejected, requesting one repair"
                );

                let repair_prompt = format!(
                    "{}\n\nYour previous plan was rejected for these reasons:\n{}\n\nReturn a corrected plan as a single JSON object.",
                    prompt,
                    problems
                        .iter()
                        .map(|p| format!("- {}", p))
                        .collect::<Vec<_>>()
                        .join("\n")
                );

                let second = self
                    .gateway
                    .complete(&repair_prompt, Some(PLANNER_SYSTEM_PROMPT), "planner")
                    .await
                    .map_err(|e| EngineError::Provider(e.to_string()))?;

                self.parse_and_validate(intent, session_id, &second.text)
                    .map_err(|problems| EngineError::PlanRejected(problems.join("; ")))
            }
        }
    }

    fn build_prompt(&self, intent: &str) -> String {
        let catalog = self
            .registry
            .catalog()
            .into_iter()
            .map(|entry| {
                let params: Vec<String> = entry
                    .schema
                    .parameters
                    .iter()
                    .map(|(name, spec)| {
                        if spec.required {
                            format!("{} (required)", name)
                        } else {
                            name.clone()
                        }
                    })
                    .collect();
                format!("- {}: {} [params: {}]", entry.name, entry.description, params.join(", "))
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            r#"User intent: {intent}

Available tools:
{catalog}
- {pseudo}: derive a prioritized list of widened search variants from a base title, location and skills [params: base_title (required), base_location, skills]

Produce a plan as JSON:
{{"steps": [{{"step_number": 1, "step_type": "tool_call"|"analysis"|"decision"|"notification", "description": "...", "tool": "...", "parameters": {{...}}, "output_format": {{"type": "object", "fields": {{"name": "string"|"integer"|"number"|"boolean"|"array"}}}}, "skip_if": "...", "requires_confirmation": false}}]}}

Rules:
- Step numbers start at 1 and are dense.
- tool_call steps name a tool from the catalog; analysis and decision steps declare an output_format.
- Parameters may reference earlier results with placeholders like {{{{step_2.result.jobs[0].title}}}} or fallback chains {{{{a||b||"literal"}}}}; never reference the current or a later step.
- When the task depends on user documents, begin with an idempotent listing step.
- Use retry steps ("Versuch 2", "Versuch 3") plus a decision step between attempts for searches that may come back empty, and finish with a decision selecting the best result from all attempts."#,
            intent = intent,
            catalog = catalog,
            pseudo = VARIANT_PSEUDO_TOOL,
        )
    }

    fn parse_and_validate(
        &self,
        intent: &str,
        session_id: &str,
        response: &str,
    ) -> std::result::Result<Workflow, Vec<String>> {
        let Some(raw) = extract::find_json_object(response) else {
            return Err(vec!["response did not contain a JSON plan".to_string()]);
        };

        let planned: PlannedSteps = serde_json::from_value(raw)
            .map_err(|e| vec![format!("plan did not match the step schema: {}", e)])?;

        let steps: Vec<Step> = planned
            .steps
            .into_iter()
            .map(|p| Step {
                step_number: p.step_number,
                step_type: p.step_type,
                description: p.description,
                tool: p.tool,
                parameters: p.parameters.unwrap_or(Value::Null),
                output_format: p.output_format.map(|f| OutputFormat { fields: f.fields }),
                skip_if: p.skip_if,
                requires_confirmation: p.requires_confirmation,
                ..Step::new(0, StepType::Notification, "")
            })
            .collect();

        let workflow = Workflow::new(session_id, intent, steps);

        let mut problems = Vec::new();

        if let Err(err) = workflow.validate() {
            problems.push(err.to_string());
        }

        for step in &workflow.steps {
            match step.step_type {
                StepType::ToolCall => {
                    if let Some(tool) = step.tool.as_deref() {
                        if tool != VARIANT_PSEUDO_TOOL && !self.registry.contains(tool) {
                            problems.push(format!("unknown tool '{}'", tool));
                        }
                    }
                }
                StepType::Analysis | StepType::Decision => {
                    if step.output_format.is_none() {
                        problems.push(format!(
                            "step {} ({}) declares no output_format",
                            step.step_number,
                            step.step_type.as_str()
                        ));
                    }
                }
                StepType::Notification => {}
            }
        }

        if problems.is_empty() {
            debug!(
                session = %session_id,
                steps = workflow.steps.len(),
                "Plan accepted"
            );
            Ok(workflow)
        } else {
            Err(problems)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ok_response, ScriptedProvider, StaticTool};
    use agentflow_core::workflow::WorkflowStatus;
    use agentflow_llm::{GatewayConfig, ProviderError};
    use std::time::Duration;

    fn planner(
        responses: Vec<std::result::Result<agentflow_llm::CompletionResponse, ProviderError>>,
    ) -> (Planner, Arc<ScriptedProvider>) {
        let registry = Arc::new(ToolRegistry::new());
        registry.register(StaticTool::new("job_search", vec![]));
        registry.register(StaticTool::new("list_documents", vec![]));

        let provider = Arc::new(ScriptedProvider::new(responses));
        let gateway = Arc::new(LlmGateway::new(
            provider.clone(),
            GatewayConfig {
                retry_delay: Duration::from_millis(1),
                ..GatewayConfig::default()
            },
        ));

        (Planner::new(gateway, registry), provider)
    }

    const VALID_PLAN: &str = r#"{
        "steps": [
            {"step_number": 1, "step_type": "tool_call", "description": "Liste Dokumente", "tool": "list_documents", "parameters": {}},
            {"step_number": 2, "step_type": "tool_call", "description": "Suche nach Jobs", "tool": "job_search", "parameters": {"what": "Entwickler", "where": "Berlin"}},
            {"step_number": 3, "step_type": "analysis", "description": "Fasse {{step_2.result.jobs}} zusammen", "output_format": {"type": "object", "fields": {"summary": "string", "count": "integer"}}},
            {"step_number": 4, "step_type": "notification", "description": "Melde Ergebnis", "parameters": {"message": "{{step_3.result.summary}}"}}
        ]
    }"#;

    #[tokio::test]
    async fn test_valid_plan_is_accepted() {
        let (planner, provider) = planner(vec![Ok(ok_response(VALID_PLAN))]);

        let workflow = planner.plan("Finde Jobs in Berlin", "s-1").await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(workflow.status, WorkflowStatus::Planning);
        assert_eq!(workflow.steps.len(), 4);
        assert_eq!(workflow.steps[2].step_type, StepType::Analysis);

        let schema = workflow.steps[2].output_format.as_ref().unwrap();
        assert_eq!(schema.fields.get("count"), Some(&FieldType::Integer));
    }

    #[tokio::test]
    async fn test_fenced_plan_is_accepted() {
        let fenced = format!("```json\n{}\n```", VALID_PLAN);
        let (planner, _provider) = planner(vec![Ok(ok_response(&fenced))]);

        let workflow = planner.plan("Finde Jobs", "s-1").await.unwrap();
        assert_eq!(workflow.steps.len(), 4);
    }

    #[tokio::test]
    async fn test_unknown_tool_triggers_repair() {
        let invalid = r#"{"steps": [
            {"step_number": 1, "step_type": "tool_call", "description": "Suche", "tool": "web_scraper", "parameters": {}}
        ]}"#;
        let valid = r#"{"steps": [
            {"step_number": 1, "step_type": "tool_call", "description": "Suche", "tool": "job_search", "parameters": {}}
        ]}"#;
        let (planner, provider) = planner(vec![Ok(ok_response(invalid)), Ok(ok_response(valid))]);

        let workflow = planner.plan("Finde Jobs", "s-1").await.unwrap();

        assert_eq!(provider.calls(), 2);
        assert_eq!(workflow.steps[0].tool.as_deref(), Some("job_search"));

        let repair = &provider.prompts()[1];
        assert!(repair.contains("unknown tool 'web_scraper'"));
    }

    #[tokio::test]
    async fn test_twice_invalid_plan_is_rejected() {
        let invalid = r#"{"steps": [
            {"step_number": 1, "step_type": "analysis", "description": "Analyse ohne Schema"}
        ]}"#;
        let (planner, provider) =
            planner(vec![Ok(ok_response(invalid)), Ok(ok_response(invalid))]);

        let err = planner.plan("Finde Jobs", "s-1").await.unwrap_err();
        assert_eq!(provider.calls(), 2);
        assert!(matches!(err, EngineError::PlanRejected(_)));
        assert!(err.to_string().contains("output_format"));
    }

    #[tokio::test]
    async fn test_forward_reference_is_rejected() {
        let forward = r#"{"steps": [
            {"step_number": 1, "step_type": "tool_call", "description": "Suche", "tool": "job_search", "parameters": {"what": "{{step_2.result.title}}"}}
        ]}"#;
        let (planner, _provider) =
            planner(vec![Ok(ok_response(forward)), Ok(ok_response(forward))]);

        let err = planner.plan("Finde Jobs", "s-1").await.unwrap_err();
        assert!(err.to_string().contains("forward"));
    }

    #[tokio::test]
    async fn test_pseudo_tool_needs_no_registration() {
        let plan = r#"{"steps": [
            {"step_number": 1, "step_type": "tool_call", "description": "Erzeuge Varianten", "tool": "generate_search_variants", "parameters": {"base_title": "Entwickler"}}
        ]}"#;
        let (planner, _provider) = planner(vec![Ok(ok_response(plan))]);

        let workflow = planner.plan("Finde Jobs", "s-1").await.unwrap();
        assert_eq!(workflow.steps[0].tool.as_deref(), Some("generate_search_variants"));
    }

    #[tokio::test]
    async fn test_prose_response_is_rejected_then_repaired() {
        let (planner, provider) = planner(vec![
            Ok(ok_response("I would suggest searching for jobs first.")),
            Ok(ok_response(VALID_PLAN)),
        ]);

        let workflow = planner.plan("Finde Jobs", "s-1").await.unwrap();
        assert_eq!(provider.calls(), 2);
        assert_eq!(workflow.steps.len(), 4);
    }
}
