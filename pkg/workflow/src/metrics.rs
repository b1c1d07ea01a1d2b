//! Aggregate counters published for tests and health introspection

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::step::{StepName, StepResult};

#[derive(Debug, Clone, Default, Serialize)]
pub struct StepStats {
    pub executions: u64,
    pub failures: u64,
    pub average_duration_ms: f64,
    #[serde(skip)]
    total_duration: Duration,
}

impl StepStats {
    fn record(&mut self, result: &StepResult) {
        self.executions += 1;
        if !result.success {
            self.failures += 1;
        }
        self.total_duration += result.execution_time;
        #[allow(clippy::cast_precision_loss)]
        let average = self.total_duration.as_secs_f64() * 1000.0 / self.executions as f64;
        self.average_duration_ms = average;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowMetrics {
    pub workflow: String,
    pub total_iterations: u64,
    pub succeeded_iterations: u64,
    pub failed_iterations: u64,
    pub steps: BTreeMap<StepName, StepStats>,
    pub started_at: DateTime<Utc>,
    /// Filled in when a snapshot is taken
    pub uptime_seconds: i64,
    pub last_iteration_at: Option<DateTime<Utc>>,
    pub last_iteration_duration_ms: Option<f64>,
}

impl WorkflowMetrics {
    fn new(workflow: &str, started_at: DateTime<Utc>) -> Self {
        Self {
            workflow: workflow.to_string(),
            total_iterations: 0,
            succeeded_iterations: 0,
            failed_iterations: 0,
            steps: BTreeMap::new(),
            started_at,
            uptime_seconds: 0,
            last_iteration_at: None,
            last_iteration_duration_ms: None,
        }
    }
}

/// Shared, cheaply cloned view of a workflow's counters
#[derive(Debug, Clone)]
pub struct MetricsHandle {
    inner: Arc<RwLock<WorkflowMetrics>>,
}

impl MetricsHandle {
    pub fn new(workflow: &str) -> Self {
        Self {
            inner: Arc::new(RwLock::new(WorkflowMetrics::new(workflow, Utc::now()))),
        }
    }

    pub async fn snapshot(&self) -> WorkflowMetrics {
        let mut metrics = self.inner.read().await.clone();
        metrics.uptime_seconds = (Utc::now() - metrics.started_at).num_seconds();
        metrics
    }

    pub async fn record_step(&self, result: &StepResult) {
        let mut metrics = self.inner.write().await;
        metrics.steps.entry(result.step_name).or_default().record(result);
    }

    pub async fn record_iteration(&self, success: bool, duration: Duration) {
        let mut metrics = self.inner.write().await;
        metrics.total_iterations += 1;
        if success {
            metrics.succeeded_iterations += 1;
        } else {
            metrics.failed_iterations += 1;
        }
        metrics.last_iteration_at = Some(Utc::now());
        metrics.last_iteration_duration_ms = Some(duration.as_secs_f64() * 1000.0);
    }

    /// Clear every counter; the uptime origin is kept
    pub async fn reset(&self) {
        let mut metrics = self.inner.write().await;
        let fresh = WorkflowMetrics::new(&metrics.workflow, metrics.started_at);
        *metrics = fresh;
    }
}
