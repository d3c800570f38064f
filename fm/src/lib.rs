//! Foreman - PM-driven multi-agent task-graph orchestrator
//!
//! A supervisor ("PM") agent inspects the current task graph at each
//! decision point and returns a structured decision; foreman applies it,
//! launches bounded-concurrency agent executions against pluggable
//! providers, watches their output for inter-agent messages and opinion
//! conflicts, checkpoints progress for resume, and terminates when the PM
//! declares completion or a guard fires.
//!
//! # Core Concepts
//!
//! - **One decision at a time**: a trigger (completion, user message, idle)
//!   arms exactly one PM consultation; actions apply in order
//! - **Pure graph transitions**: the task graph is immutable; every
//!   mutation returns a new graph and invariants hold after each one
//! - **Files as gates**: the worker and the front end rendezvous through
//!   per-project files, so either side can restart without losing the other
//! - **Best-effort persistence**: only run lifecycle writes may fail the
//!   pipeline; everything else logs and moves on
//!
//! # Modules
//!
//! - [`pipeline`] - the decision loop, triggers, health-checked waiting
//! - [`graph`] - pure task-graph transitions
//! - [`runner`] - per-task execution with retry and provider fallback
//! - [`providers`] - adapter registry over CLI and HTTP backends
//! - [`gates`] - cross-process plan/question/message/abort files
//! - [`pm`] - decision schema, tolerant parsing, prompt composition
//! - [`persist`] - the repository contract and a JSONL implementation

pub mod cli;
pub mod config;
pub mod conflict;
pub mod domain;
pub mod gates;
pub mod graph;
pub mod persist;
pub mod pipeline;
pub mod pm;
pub mod providers;
pub mod router;
pub mod runner;
pub mod worker;

// Re-export commonly used types
pub use config::Config;
pub use conflict::{MemorySink, NoopSink};
pub use domain::{
    AgentCatalog, AgentDefinition, AgentMessage, MessageKind, PipelineRun, RunStatus, StepSummary, TaskNode, TaskSpec,
    TaskStatus,
};
pub use gates::{AbortFlag, LiveLog, PlanDecision, PlanGate, ProjectDir, QuestionGate, UserInbox};
pub use graph::TaskGraph;
pub use persist::{JsonlRepository, Repository};
pub use pipeline::{EngineConfig, EngineDeps, PipelineEngine, PipelineOutcome, Trigger};
pub use pm::{PmAction, PmClient, PmDecision, RegistryPm, ScriptedPm, parse_decision};
pub use providers::{
    Capabilities, ErrorKind, ExecutionContext, ExecutionResult, ProviderAdapter, ProviderRegistry, global_registry,
};
pub use router::{MessageRouter, extract_messages};
pub use runner::{AgentRunner, RunnerConfig, TaskOutcome};
pub use worker::Worker;
