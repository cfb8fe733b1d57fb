//! State persistence and status streaming for the agentflow workflow
//! engine.
//!
//! Three narrow traits ([`StateStore`], [`StatusStore`], [`UsageStore`])
//! decouple the orchestrator from storage. [`MemoryStore`] backs tests
//! and local runs; [`SqliteStore`] (feature `sqlite`, on by default)
//! provides the durable layout: `workflows`, `workflow_steps`,
//! `agent_status` and `token_usage_records`.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;
pub mod status;
pub mod store;

pub use memory::MemoryStore;
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;
pub use status::StatusStream;
pub use store::{
    Result, StateError, StateStore, StateStoreRef, StatusEvent, StatusStore, StatusStoreRef,
    UsageStore, UsageStoreRef,
};
