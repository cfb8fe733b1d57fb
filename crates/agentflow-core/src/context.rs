// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Execution context built up while a workflow runs.

use dashmap::DashMap;
use serde_json::{json, Map, Value};

/// Transient mapping of previously-produced step results and
/// auxiliaries available to placeholder resolution.
///
/// Keys are either `step_<N>` entries of shape `{"result": <value>}` or
/// free-form auxiliaries written by steps that own them (e.g.
/// `search_variants_list`). The context lives for one workflow
/// execution; durable data lives in step results.
#[derive(Debug, Default)]
pub struct ExecutionContext {
    entries: DashMap<String, Value>,
}

impl ExecutionContext {
    /// Create an empty context.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Store a step result under `step_<N>` as `{"result": value}`.
    pub fn record_step_result(&self, step_number: u32, result: Value) {
        let key = format!("step_{}", step_number);
        if self.entries.contains_key(&key) {
            tracing::debug!(key = %key, "Overwriting existing context entry");
        }
        self.entries.insert(key, json!({ "result": result }));
    }

    /// Store an auxiliary value under a free-form key.
    pub fn set(&self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    /// Fetch a top-level entry by key.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|entry| entry.value().clone())
    }

    /// Whether a top-level key exists.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Sorted top-level keys, for deterministic error listings.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Snapshot of the whole context as a JSON object.
    pub fn snapshot(&self) -> Value {
        let map: Map<String, Value> = self
            .entries
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        Value::Object(map)
    }
}
