//! Workflow engine
//!
//! Declarative workflow documents (model), expression templating
//! (expr), checkpointable run state (state), the DAG executor
//! (executor), and the pane-backed step runner (runner).

pub mod executor;
pub mod expr;
pub mod model;
pub mod runner;
pub mod state;

pub use executor::{
    DryRunRunner, ExecutorOptions, ProgressEvent, ProgressKind, StepRunner, WorkflowExecutor,
};
pub use model::Workflow;
pub use state::{ExecutionState, RunStatus};
