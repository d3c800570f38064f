//! PM decision layer
//!
//! The PM is an LLM invoked once per decision point with a composed prompt;
//! it replies with a `[PM_DECISION] { ... } [/PM_DECISION]` envelope that
//! parses into a [`PmDecision`]. Parsing is deliberately tolerant: the
//! strict envelope is tried first, then a looser JSON-extraction heuristic.

pub mod client;
pub mod decision;
pub mod parse;
pub mod prompt;

pub use client::{PmClient, RegistryPm, ScriptedPm};
pub use decision::{PmAction, PmDecision};
pub use parse::parse_decision;
pub use prompt::{BudgetView, DecisionContext, compose_prompt};
