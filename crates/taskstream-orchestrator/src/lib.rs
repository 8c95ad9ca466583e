mod activities;
mod engine;
mod memory;
mod recovery;
mod service;
mod workflow;

pub use activities::{Activities, RetryPolicy};
pub use engine::{EngineError, WorkflowDescription, WorkflowEngine, WorkflowPhase};
pub use memory::InMemoryEngine;
pub use recovery::{LatestSnapshot, RecoveryOutcome, RecoveryReport, RecoveryService, UpdatesSince};
pub use service::{StartDisposition, StartedWorkflow, TaskService};
pub use workflow::{
    SharedState, SignalGate, SignalInbox, TaskWorkflow, WorkflowInput, WorkflowOutcome,
    WorkflowSignal,
};
