//! Per-agent run context

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use crate::step::{StepName, StepResult};

/// Most recent entries kept per timing series
pub const METRICS_HISTORY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowStatus {
    #[default]
    Initializing,
    Running,
    Stopped,
}

/// Mutable scratch space shared by the steps of one agent
///
/// `data` holds the workflow-specific part of the state.
#[derive(Debug, Clone, Default)]
pub struct WorkflowState<S> {
    pub current_step: Option<StepName>,
    pub iteration_count: u64,
    pub status: WorkflowStatus,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub data: S,
}

#[derive(Debug, Clone, Serialize)]
pub struct IterationTiming {
    pub iteration: u64,
    pub success: bool,
    pub duration: Duration,
    pub timestamp: DateTime<Utc>,
}

/// Ordered step and iteration timings, oldest first
#[derive(Debug, Clone, Default)]
pub struct ContextMetrics {
    step_timings: VecDeque<StepResult>,
    iteration_timings: VecDeque<IterationTiming>,
}

impl ContextMetrics {
    pub fn push_step(&mut self, result: StepResult) {
        if self.step_timings.len() == METRICS_HISTORY {
            self.step_timings.pop_front();
        }
        self.step_timings.push_back(result);
    }

    pub fn push_iteration(&mut self, timing: IterationTiming) {
        if self.iteration_timings.len() == METRICS_HISTORY {
            self.iteration_timings.pop_front();
        }
        self.iteration_timings.push_back(timing);
    }

    pub fn step_timings(&self) -> &VecDeque<StepResult> {
        &self.step_timings
    }

    pub fn iteration_timings(&self) -> &VecDeque<IterationTiming> {
        &self.iteration_timings
    }

    pub fn last_step(&self, name: StepName) -> Option<&StepResult> {
        self.step_timings.iter().rev().find(|r| r.step_name == name)
    }
}

/// Everything a step can see while it runs
///
/// The configuration is fixed at construction and only handed out by shared
/// reference.
#[derive(Debug)]
pub struct WorkflowContext<C, S> {
    config: Arc<C>,
    pub state: WorkflowState<S>,
    pub metrics: ContextMetrics,
}

impl<C, S> WorkflowContext<C, S> {
    pub fn new(config: C, data: S) -> Self {
        Self::with_shared_config(Arc::new(config), data)
    }

    pub fn with_shared_config(config: Arc<C>, data: S) -> Self {
        Self {
            config,
            state: WorkflowState {
                current_step: None,
                iteration_count: 0,
                status: WorkflowStatus::Initializing,
                error_count: 0,
                last_error: None,
                data,
            },
            metrics: ContextMetrics::default(),
        }
    }

    pub fn config(&self) -> &C {
        &self.config
    }

    /// Owned handle on the configuration, for work that outlives a borrow
    pub fn shared_config(&self) -> Arc<C> {
        Arc::clone(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;

    fn result(step_name: StepName) -> StepResult {
        StepResult {
            step_name,
            success: true,
            output: Value::Null,
            error: None,
            execution_time: Duration::from_millis(1),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_new_context() {
        let ctx = WorkflowContext::new("config".to_string(), 0u8);
        assert_eq!(ctx.config(), "config");
        assert_eq!(ctx.state.status, WorkflowStatus::Initializing);
        assert_eq!(ctx.state.iteration_count, 0);
        assert!(ctx.state.current_step.is_none());
        assert!(ctx.metrics.step_timings().is_empty());
    }

    #[test]
    fn test_step_history_is_bounded() {
        let mut metrics = ContextMetrics::default();
        for _ in 0..METRICS_HISTORY {
            metrics.push_step(result(StepName::Monitor));
        }
        metrics.push_step(result(StepName::Validate));

        assert_eq!(metrics.step_timings().len(), METRICS_HISTORY);
        assert_eq!(
            metrics.step_timings().back().unwrap().step_name,
            StepName::Validate
        );
        assert_eq!(
            metrics.last_step(StepName::Monitor).unwrap().step_name,
            StepName::Monitor
        );
        assert!(metrics.last_step(StepName::Execute).is_none());
    }
}
