//! Core domain types
//!
//! Task nodes, pipeline runs, agent definitions, and inter-agent messages.
//! These are plain data; the transitions live in [`crate::graph`] and the
//! lifecycle in [`crate::pipeline`].

mod agent;
mod message;
mod run;
mod task;

pub use agent::{AgentCatalog, AgentDefinition, AgentRole, CAP_FILE_ACCESS, CAP_SHELL_ACCESS};
pub use message::{AgentMessage, MessageKind};
pub use run::{PipelineRun, RunStatus, StepSummary};
pub use task::{TaskChanges, TaskNode, TaskSpec, TaskStatus};
