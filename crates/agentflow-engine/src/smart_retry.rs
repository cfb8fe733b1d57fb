// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Smart-retry control: skip decisions and best-of-retries selection.
//!
//! The controller keeps no state of its own; every decision is derived
//! from the step history and the execution context.

use agentflow_core::workflow::{Step, StepStatus, StepType};
use agentflow_core::ExecutionContext;
use lazy_static::lazy_static;
use regex::Regex;
use serde_json::Value;

lazy_static! {
    /// A trailing number in a description marks a numbered attempt.
    static ref NUMERIC_SUFFIX: Regex = Regex::new(r"\d+\s*$").expect("static regex");

    /// Reference into the variant list inside raw step parameters.
    static ref VARIANT_REF: Regex =
        Regex::new(r"search_variants_list\[(\d+)\]").expect("static regex");
}

/// Stateless retry controller.
pub struct RetryController;

/// Number of result records inside a step result.
///
/// Objects count by their `jobs` array (or the first array field);
/// an object with only scalar content counts 1 when any field is
/// non-empty.
pub fn result_count(result: &Value) -> usize {
    match result {
        Value::Array(items) => items.len(),
        Value::Object(map) => {
            if let Some(jobs) = map.get("jobs").and_then(Value::as_array) {
                return jobs.len();
            }
            if let Some(first_array) = map.values().find_map(Value::as_array) {
                return first_array.len();
            }
            let has_content = map.iter().any(|(key, value)| {
                key != "status"
                    && match value {
                        Value::Null => false,
                        Value::String(s) => !s.trim().is_empty(),
                        Value::Bool(b) => *b,
                        _ => true,
                    }
            });
            usize::from(has_content)
        }
        Value::Null => 0,
        Value::String(s) => usize::from(!s.trim().is_empty()),
        _ => 1,
    }
}

impl RetryController {
    /// Whether a step is a further attempt of an earlier tool call.
    ///
    /// True iff it is a tool_call, its tool already ran in an earlier
    /// step and the description hints at another attempt ("versuch",
    /// "retry" or a trailing attempt number).
    pub fn is_retry_step(step: &Step, prior: &[Step]) -> bool {
        if step.step_type != StepType::ToolCall {
            return false;
        }

        let Some(tool) = step.tool.as_deref() else {
            return false;
        };

        let repeated = prior
            .iter()
            .any(|p| p.step_number < step.step_number && p.tool.as_deref() == Some(tool));
        if !repeated {
            return false;
        }

        let description = step.description.to_lowercase();
        description.contains("versuch")
            || description.contains("retry")
            || NUMERIC_SUFFIX.is_match(&description)
    }

    /// Whether a retry step should be skipped and, if so, the result to
    /// copy from the last successful attempt.
    ///
    /// A retry is skipped when any preceding attempt of the same tool
    /// produced at least one result record and the latest decision step
    /// voted `should_retry = false`.
    pub fn skip_decision(step: &Step, prior: &[Step]) -> Option<Value> {
        let tool = step.tool.as_deref()?;

        let latest_vote = prior
            .iter()
            .rev()
            .filter(|p| p.step_type == StepType::Decision && p.status == StepStatus::Completed)
            .find_map(|p| p.result.as_ref()?.get("should_retry")?.as_bool());

        if latest_vote != Some(false) {
            return None;
        }

        prior
            .iter()
            .rev()
            .filter(|p| {
                p.status == StepStatus::Completed
                    && p.tool.as_deref() == Some(tool)
                    && p.result.as_ref().map(result_count).unwrap_or(0) >= 1
            })
            .find_map(|p| p.result.clone())
    }

    /// Whether a decision step is a terminal selection: it picks the
    /// best result from previous attempts instead of calling the model.
    pub fn is_terminal_selection(step: &Step) -> bool {
        if step.step_type != StepType::Decision {
            return false;
        }

        let description = step.description.to_lowercase();
        description.contains("finale")
            || description.contains("wähle besten")
            || description.contains("aus allen versuchen")
    }

    /// Priority of the search variant a step's raw parameters reference.
    ///
    /// Steps that reference `search_variants_list[i]` inherit that
    /// variant's priority; steps without a reference ran the user's
    /// exact ask (priority 0).
    pub fn variant_priority(step: &Step, ctx: &ExecutionContext) -> i64 {
        let raw = step.parameters.to_string();

        let Some(captures) = VARIANT_REF.captures(&raw) else {
            return 0;
        };
        let Ok(index) = captures[1].parse::<usize>() else {
            return 0;
        };

        ctx.get("search_variants_list")
            .and_then(|list| list.get(index).cloned())
            .and_then(|variant| variant.get("priority").cloned())
            .and_then(|p| p.as_i64())
            .unwrap_or(i64::MAX)
    }

    /// Best-of-retries aggregation for a terminal-selection decision.
    ///
    /// Scans completed attempts of the retry family and picks the one
    /// with the highest result count; ties break by lowest originating
    /// variant priority, then by lowest step number. The winner is
    /// projected into the terminal step's declared schema.
    pub fn select_best(step: &Step, prior: &[Step], ctx: &ExecutionContext) -> Value {
        let family = prior
            .iter()
            .rev()
            .find(|p| p.step_type == StepType::ToolCall && p.tool.is_some())
            .and_then(|p| p.tool.clone());

        let mut best: Option<(usize, i64, u32, &Value)> = None;

        for candidate in prior.iter().filter(|p| {
            p.status == StepStatus::Completed
                && p.step_type == StepType::ToolCall
                && p.tool == family
        }) {
            let Some(result) = candidate.result.as_ref() else {
                continue;
            };

            let count = result_count(result);
            let priority = Self::variant_priority(candidate, ctx);
            let number = candidate.step_number;

            let better = match &best {
                None => true,
                Some((best_count, best_priority, best_number, _)) => {
                    count > *best_count
                        || (count == *best_count && priority < *best_priority)
                        || (count == *best_count && priority == *best_priority && number < *best_number)
                }
            };

            if better {
                best = Some((count, priority, number, result));
            }
        }

        let winner = best.map(|(_, _, _, result)| result.clone());

        match (&step.output_format, winner) {
            (Some(schema), Some(result)) => schema.project(&result),
            (Some(schema), None) => schema.default_object(),
            (None, Some(result)) => result,
            (None, None) => Value::Object(serde_json::Map::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::schema::{FieldType, OutputFormat};
    use serde_json::json;

    fn tool_step(number: u32, tool: &str, description: &str) -> Step {
        Step::new(number, StepType::ToolCall, description).with_tool(tool)
    }

    fn completed(mut step: Step, result: Value) -> Step {
        step.complete(result);
        step
    }

    #[test]
    fn test_retry_detection_by_keyword() {
        let prior = vec![completed(
            tool_step(6, "job_search", "Suche nach Jobs"),
            json!({"jobs": [1]}),
        )];

        let retry = tool_step(8, "job_search", "Zweiter Versuch mit erweitertem Radius");
        assert!(RetryController::is_retry_step(&retry, &prior));

        let retry_en = tool_step(8, "job_search", "Retry with wider radius");
        assert!(RetryController::is_retry_step(&retry_en, &prior));
    }

    #[test]
    fn test_retry_detection_by_numeric_suffix() {
        let prior = vec![completed(
            tool_step(6, "job_search", "Suche nach Jobs"),
            json!({"jobs": []}),
        )];

        let retry = tool_step(8, "job_search", "Suche Variante 2");
        assert!(RetryController::is_retry_step(&retry, &prior));
    }

    #[test]
    fn test_first_use_of_tool_is_not_a_retry() {
        let prior = vec![completed(
            tool_step(1, "list_documents", "Liste Dokumente"),
            json!({"documents": []}),
        )];

        let step = tool_step(2, "job_search", "Suche Versuch 1");
        assert!(!RetryController::is_retry_step(&step, &prior));
    }

    #[test]
    fn test_analysis_is_never_a_retry() {
        let prior = vec![completed(
            tool_step(1, "job_search", "Suche"),
            json!({"jobs": []}),
        )];

        let step = Step::new(2, StepType::Analysis, "Zweiter Versuch der Analyse");
        assert!(!RetryController::is_retry_step(&step, &prior));
    }

    // A non-empty attempt plus a negative vote skips the retry.
    #[test]
    fn test_skip_after_success_and_negative_vote() {
        let jobs = json!({"jobs": [{"t": 1}, {"t": 2}, {"t": 3}, {"t": 4}]});
        let mut decision = Step::new(7, StepType::Decision, "Brauchen wir einen weiteren Versuch?");
        decision.complete(json!({"should_retry": false, "has_results": true}));

        let prior = vec![
            completed(tool_step(6, "job_search", "Suche nach Jobs"), jobs.clone()),
            decision,
        ];

        let retry = tool_step(8, "job_search", "Suche Versuch 2");
        assert!(RetryController::is_retry_step(&retry, &prior));

        let copied = RetryController::skip_decision(&retry, &prior).unwrap();
        assert_eq!(copied, jobs);
    }

    #[test]
    fn test_no_skip_when_vote_requests_retry() {
        let mut decision = Step::new(7, StepType::Decision, "Weiter?");
        decision.complete(json!({"should_retry": true}));

        let prior = vec![
            completed(tool_step(6, "job_search", "Suche"), json!({"jobs": [1]})),
            decision,
        ];

        let retry = tool_step(8, "job_search", "Versuch 2");
        assert!(RetryController::skip_decision(&retry, &prior).is_none());
    }

    #[test]
    fn test_no_skip_when_all_attempts_empty() {
        let mut decision = Step::new(7, StepType::Decision, "Weiter?");
        decision.complete(json!({"should_retry": false}));

        let prior = vec![
            completed(tool_step(6, "job_search", "Suche"), json!({"jobs": []})),
            decision,
        ];

        let retry = tool_step(8, "job_search", "Versuch 2");
        assert!(RetryController::skip_decision(&retry, &prior).is_none());
    }

    #[test]
    fn test_terminal_selection_phrases() {
        let phrases = [
            "Finale Auswahl der Ergebnisse",
            "Wähle besten Treffer",
            "Beste Ergebnisse aus allen Versuchen",
        ];
        for phrase in phrases {
            let step = Step::new(9, StepType::Decision, phrase);
            assert!(RetryController::is_terminal_selection(&step), "{}", phrase);
        }

        let plain = Step::new(9, StepType::Decision, "Bewerte die Ergebnisse");
        assert!(!RetryController::is_terminal_selection(&plain));
    }

    #[test]
    fn test_result_count_variants() {
        assert_eq!(result_count(&json!({"jobs": [1, 2, 3]})), 3);
        assert_eq!(result_count(&json!({"entries": [1]})), 1);
        assert_eq!(result_count(&json!([1, 2])), 2);
        assert_eq!(result_count(&json!({"jobs": []})), 0);
        assert_eq!(result_count(&json!({"status": "success"})), 0);
        assert_eq!(result_count(&json!({"status": "success", "note": "found"})), 1);
        assert_eq!(result_count(&Value::Null), 0);
    }

    fn ctx_with_variants() -> ExecutionContext {
        let ctx = ExecutionContext::new();
        ctx.set(
            "search_variants_list",
            json!([
                {"priority": 0, "what": "Geschäftsführer"},
                {"priority": 1, "what": "Geschäftsführer"},
                {"priority": 10, "what": "Niederlassungsleiter"},
            ]),
        );
        ctx
    }

    #[test]
    fn test_variant_priority_extraction() {
        let ctx = ctx_with_variants();

        let step = tool_step(4, "job_search", "Versuch 2").with_parameters(json!({
            "what": "{{search_variants_list[2].what}}",
            "where": "{{search_variants_list[2].where}}"
        }));
        assert_eq!(RetryController::variant_priority(&step, &ctx), 10);

        let exact = tool_step(2, "job_search", "Suche").with_parameters(json!({"what": "x"}));
        assert_eq!(RetryController::variant_priority(&exact, &ctx), 0);
    }

    // Ranking: count, then variant priority, then step number.
    #[test]
    fn test_select_best_by_count_then_priority_then_number() {
        let ctx = ctx_with_variants();

        let first = completed(
            tool_step(2, "job_search", "Suche").with_parameters(json!({"what": "a"})),
            json!({"jobs": [1, 2]}),
        );
        let second = completed(
            tool_step(4, "job_search", "Versuch 2").with_parameters(json!({
                "what": "{{search_variants_list[1].what}}"
            })),
            json!({"jobs": [1, 2, 3]}),
        );
        let third = completed(
            tool_step(6, "job_search", "Versuch 3").with_parameters(json!({
                "what": "{{search_variants_list[2].what}}"
            })),
            json!({"jobs": [4, 5, 6]}),
        );
        let prior = vec![first, second, third];

        let terminal = Step::new(9, StepType::Decision, "Finale Auswahl").with_output_format(
            OutputFormat::from_fields([("jobs", FieldType::Array)]),
        );

        // Steps 4 and 6 tie on count (3); step 4's variant priority 1
        // beats step 6's priority 10.
        let selected = RetryController::select_best(&terminal, &prior, &ctx);
        assert_eq!(selected, json!({"jobs": [1, 2, 3]}));
    }

    #[test]
    fn test_select_best_tie_breaks_by_step_number() {
        let ctx = ExecutionContext::new();

        let early = completed(
            tool_step(2, "job_search", "Suche").with_parameters(json!({"what": "a"})),
            json!({"jobs": [1]}),
        );
        let late = completed(
            tool_step(4, "job_search", "Versuch 2").with_parameters(json!({"what": "a"})),
            json!({"jobs": [2]}),
        );
        let prior = vec![early, late];

        let terminal = Step::new(5, StepType::Decision, "Wähle besten");
        let selected = RetryController::select_best(&terminal, &prior, &ctx);
        assert_eq!(selected, json!({"jobs": [1]}));
    }

    #[test]
    fn test_select_best_with_no_candidates_yields_defaults() {
        let ctx = ExecutionContext::new();
        let terminal = Step::new(3, StepType::Decision, "Finale Auswahl").with_output_format(
            OutputFormat::from_fields([("jobs", FieldType::Array), ("note", FieldType::String)]),
        );

        let selected = RetryController::select_best(&terminal, &[], &ctx);
        assert_eq!(selected, json!({"jobs": [], "note": ""}));
    }
}
