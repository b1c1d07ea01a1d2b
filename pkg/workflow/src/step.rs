//! Step trait and per-invocation results

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::context::WorkflowContext;

/// Closed set of step names a workflow can register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepName {
    Monitor,
    Decide,
    Execute,
    Validate,
}

impl StepName {
    pub const ALL: [StepName; 4] = [
        StepName::Monitor,
        StepName::Decide,
        StepName::Execute,
        StepName::Validate,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StepName::Monitor => "monitor",
            StepName::Decide => "decide",
            StepName::Execute => "execute",
            StepName::Validate => "validate",
        }
    }
}

impl fmt::Display for StepName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure reported by a step body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct StepError {
    pub message: String,
}

impl StepError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Prefix an underlying error with what the step was doing
    pub fn wrap(context: &str, err: impl fmt::Display) -> Self {
        Self::new(format!("{context}: {err}"))
    }
}

/// Outcome of one step invocation
#[derive(Debug, Clone, Serialize)]
pub struct StepResult {
    pub step_name: StepName,
    pub success: bool,
    pub output: Value,
    pub error: Option<String>,
    pub execution_time: Duration,
    pub timestamp: DateTime<Utc>,
}

impl StepResult {
    pub fn duration_ms(&self) -> f64 {
        self.execution_time.as_secs_f64() * 1000.0
    }
}

/// A unit of work run against the shared context
///
/// Steps may write `ctx.state` and `ctx.metrics`; configuration is only
/// reachable read-only.
#[async_trait]
pub trait Step<C, S>: Send + Sync {
    async fn run(&self, ctx: &mut WorkflowContext<C, S>) -> Result<Value, StepError>;
}

/// Adapts a synchronous closure into a [`Step`]
pub struct FnStep<F>(pub F);

#[async_trait]
impl<C, S, F> Step<C, S> for FnStep<F>
where
    C: Send + Sync,
    S: Send,
    F: Fn(&mut WorkflowContext<C, S>) -> Result<Value, StepError> + Send + Sync,
{
    async fn run(&self, ctx: &mut WorkflowContext<C, S>) -> Result<Value, StepError> {
        (self.0)(ctx)
    }
}
