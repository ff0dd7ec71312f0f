mod decompose;
mod models;
mod runner;
mod state;

#[cfg(test)]
mod tests;

pub use decompose::{extract_json, parse_directive, parse_subtasks, Directive};
pub use models::{AgentContext, AgentOutcome, AgentStep, RunFailure, StepKind};
pub use runner::{AgentHandle, AgentOptions, AgentRunner};
pub use state::{transition, AgentEvent, AgentState, Signal, StateError};
