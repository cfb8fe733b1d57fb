// Copyright (c) 2025 LLM DevOps
// SPDX-License-Identifier: Apache-2.0

//! Tool contract and registry for the agentflow workflow engine.
//!
//! Tools are external collaborators: this crate only defines the
//! contract the step executor invokes (name, description, parameter
//! schema, optional capability flag) and a registry for capability
//! checks, plus a generic HTTP tool.

pub mod http;
pub mod registry;
pub mod tool;

pub use http::HttpRequestTool;
pub use registry::{CatalogEntry, ToolRegistry};
pub use tool::{
    success_result, InvocationContext, ParameterType, Tool, ToolError, ToolParameter, ToolSchema,
};
