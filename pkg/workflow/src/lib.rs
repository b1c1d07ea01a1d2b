//! Step-based workflow runner
//!
//! A [`Workflow`] owns a registry of named steps and drives them over a
//! [`WorkflowContext`] on a fixed interval. Each agent builds its own
//! workflow and context; nothing in this crate is global.

pub mod context;
pub mod engine;
pub mod metrics;
pub mod step;

pub use context::{ContextMetrics, IterationTiming, WorkflowContext, WorkflowState, WorkflowStatus};
pub use engine::{Workflow, WorkflowError};
pub use metrics::{MetricsHandle, StepStats, WorkflowMetrics};
pub use step::{FnStep, Step, StepError, StepName, StepResult};
