// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Tool registry: stable name → contract.

use crate::tool::{Tool, ToolSchema};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;

/// Catalog entry handed to the planner for capability checks.
#[derive(Debug, Clone, Serialize)]
pub struct CatalogEntry {
    /// Stable tool name.
    pub name: String,

    /// Human description.
    pub description: String,

    /// Parameter schema.
    pub schema: ToolSchema,

    /// Whether the orchestrator may skip this tool on failure.
    pub optional: bool,
}

/// Maps stable tool names to their contracts.
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            tools: DashMap::new(),
        }
    }

    /// Register a tool under its own name. A re-registration replaces
    /// the previous contract.
    pub fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|entry| entry.value().clone())
    }

    /// Whether a tool is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Number of registered tools.
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Sorted catalog of every registered tool, for planner prompts.
    pub fn catalog(&self) -> Vec<CatalogEntry> {
        let mut entries: Vec<CatalogEntry> = self
            .tools
            .iter()
            .map(|entry| {
                let tool = entry.value();
                CatalogEntry {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    schema: tool.schema(),
                    optional: tool.optional(),
                }
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        entries
    }
}
