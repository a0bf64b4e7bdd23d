// Workflow Automation
//
// Event-driven lead automation: triggers match domain events and elapsed
// time, conditions gate them, and actions run through durable executions.

pub mod actions;
pub mod conditions;
pub mod engine;
pub mod executor;
pub mod triggers;

pub use actions::{ActionExecutor, ActionResult};
pub use conditions::{evaluate_group, FieldValue, LeadFacts};
pub use engine::{EventReport, ExecutionPage, LeadAutomation, MergeReport, ScoreRefreshReport};
pub use executor::{ClaimOutcome, ExecutionReport, WorkflowExecutor};
pub use triggers::{DomainEvent, EventKind, WorkflowTriggerEvaluator};
