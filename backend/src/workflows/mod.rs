// Workflow automation engine.
//
// Pipeline: business event -> TriggerEvaluator -> EnrollmentManager ->
// persisted execution -> ExecutionScheduler claims due rows ->
// StepInterpreter advances -> logs + state written back, until terminal.

pub mod collaborators;
pub mod conditions;
pub mod enrollment;
pub mod error;
pub mod interpreter;
pub mod model;
pub mod scheduler;
pub mod store;
pub mod template;
pub mod triggers;

pub use collaborators::Collaborators;
pub use enrollment::EnrollmentManager;
pub use error::EngineError;
pub use interpreter::StepInterpreter;
pub use scheduler::{ExecutionScheduler, SchedulerConfig};
pub use store::WorkflowStore;
pub use triggers::{TriggerEvaluator, TriggerEvent};
