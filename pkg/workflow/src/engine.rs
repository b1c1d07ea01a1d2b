//! Step registry and run loop

use chrono::Utc;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::context::{IterationTiming, WorkflowContext, WorkflowStatus};
use crate::metrics::{MetricsHandle, WorkflowMetrics};
use crate::step::{FnStep, Step, StepError, StepName, StepResult};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    #[error("Step not registered: {0}")]
    StepNotFound(StepName),
    #[error("Step {step} failed: {message}")]
    StepFailed { step: StepName, message: String },
}

struct RegisteredStep<C, S> {
    step: Box<dyn Step<C, S>>,
    continue_on_error: bool,
}

/// Named set of steps run in order against a [`WorkflowContext`]
pub struct Workflow<C, S> {
    name: String,
    steps: HashMap<StepName, RegisteredStep<C, S>>,
    metrics: MetricsHandle,
}

impl<C, S> Workflow<C, S>
where
    C: Send + Sync + 'static,
    S: Send + 'static,
{
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            metrics: MetricsHandle::new(&name),
            name,
            steps: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register `step` under `name`, replacing any previous registration
    ///
    /// With `continue_on_error` a failing step yields an unsuccessful
    /// [`StepResult`] instead of an error, so the iteration carries on.
    pub fn register(
        &mut self,
        name: StepName,
        step: impl Step<C, S> + 'static,
        continue_on_error: bool,
    ) {
        let registered = RegisteredStep {
            step: Box::new(step),
            continue_on_error,
        };
        if self.steps.insert(name, registered).is_some() {
            warn!(workflow = %self.name, step = %name, "Step re-registered, replacing previous");
        } else {
            debug!(workflow = %self.name, step = %name, continue_on_error, "Registered step");
        }
    }

    pub fn register_fn<F>(&mut self, name: StepName, f: F, continue_on_error: bool)
    where
        F: Fn(&mut WorkflowContext<C, S>) -> Result<Value, StepError> + Send + Sync + 'static,
    {
        self.register(name, FnStep(f), continue_on_error);
    }

    pub fn is_registered(&self, name: StepName) -> bool {
        self.steps.contains_key(&name)
    }

    /// Run one registered step and record its outcome on the context
    pub async fn invoke(
        &self,
        name: StepName,
        ctx: &mut WorkflowContext<C, S>,
    ) -> Result<StepResult, WorkflowError> {
        let registered = self
            .steps
            .get(&name)
            .ok_or(WorkflowError::StepNotFound(name))?;

        ctx.state.current_step = Some(name);
        let start = Instant::now();
        let outcome = registered.step.run(ctx).await;
        let execution_time = start.elapsed();

        let result = match outcome {
            Ok(output) => StepResult {
                step_name: name,
                success: true,
                output,
                error: None,
                execution_time,
                timestamp: Utc::now(),
            },
            Err(e) => {
                ctx.state.error_count += 1;
                ctx.state.last_error = Some(format!("{name}: {e}"));
                StepResult {
                    step_name: name,
                    success: false,
                    output: Value::Null,
                    error: Some(e.message),
                    execution_time,
                    timestamp: Utc::now(),
                }
            }
        };

        ctx.metrics.push_step(result.clone());
        self.metrics.record_step(&result).await;

        if result.success {
            debug!(
                workflow = %self.name,
                step = %name,
                duration_ms = result.duration_ms(),
                "Step completed"
            );
            return Ok(result);
        }

        let message = result.error.clone().unwrap_or_default();
        warn!(
            workflow = %self.name,
            step = %name,
            duration_ms = result.duration_ms(),
            error = %message,
            continue_on_error = registered.continue_on_error,
            "Step failed"
        );

        if registered.continue_on_error {
            Ok(result)
        } else {
            Err(WorkflowError::StepFailed {
                step: name,
                message,
            })
        }
    }

    /// Run `steps` in order every `interval` until `max_iterations` passes
    /// have completed; `0` runs forever
    pub async fn run_loop(
        &self,
        ctx: &mut WorkflowContext<C, S>,
        steps: &[StepName],
        max_iterations: u64,
        interval: Duration,
    ) {
        let (_keep_open, shutdown) = watch::channel(false);
        self.run_loop_until(ctx, steps, max_iterations, interval, shutdown)
            .await;
    }

    /// Like [`Workflow::run_loop`], also stopping once `shutdown` turns true
    ///
    /// The signal is only observed between iterations; a running iteration
    /// always finishes.
    pub async fn run_loop_until(
        &self,
        ctx: &mut WorkflowContext<C, S>,
        steps: &[StepName],
        max_iterations: u64,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        ctx.state.status = WorkflowStatus::Running;
        info!(
            workflow = %self.name,
            max_iterations,
            interval_secs = interval.as_secs(),
            "Workflow started"
        );

        let mut completed: u64 = 0;
        loop {
            if *shutdown.borrow() {
                break;
            }

            ctx.state.iteration_count += 1;
            let iteration = ctx.state.iteration_count;
            let start = Instant::now();
            let mut success = true;

            for &step in steps {
                match self.invoke(step, ctx).await {
                    Ok(result) => success &= result.success,
                    Err(e) => {
                        error!(
                            workflow = %self.name,
                            iteration,
                            error = %e,
                            "Iteration aborted"
                        );
                        success = false;
                        break;
                    }
                }
            }

            let duration = start.elapsed();
            ctx.metrics.push_iteration(IterationTiming {
                iteration,
                success,
                duration,
                timestamp: Utc::now(),
            });
            self.metrics.record_iteration(success, duration).await;
            info!(
                workflow = %self.name,
                iteration,
                success,
                duration_ms = duration.as_secs_f64() * 1000.0,
                "Iteration finished"
            );

            completed += 1;
            if max_iterations != 0 && completed >= max_iterations {
                break;
            }

            tokio::select! {
                () = tokio::time::sleep(interval) => {}
                () = shutdown_requested(&mut shutdown) => {
                    info!(workflow = %self.name, "Shutdown requested");
                    break;
                }
            }
        }

        ctx.state.status = WorkflowStatus::Stopped;
        info!(workflow = %self.name, iterations = completed, "Workflow stopped");
    }

    pub async fn get_metrics(&self) -> WorkflowMetrics {
        self.metrics.snapshot().await
    }

    pub async fn reset(&self) {
        self.metrics.reset().await;
    }

    /// Handle that stays valid while the workflow runs elsewhere
    pub fn metrics_handle(&self) -> MetricsHandle {
        self.metrics.clone()
    }
}

/// Resolves once the flag is set or every sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    type Ctx = WorkflowContext<(), Vec<StepName>>;

    fn recording(name: StepName) -> impl Fn(&mut Ctx) -> Result<Value, StepError> {
        move |ctx: &mut Ctx| {
            ctx.state.data.push(name);
            Ok(Value::from(name.as_str()))
        }
    }

    fn failing(name: StepName) -> impl Fn(&mut Ctx) -> Result<Value, StepError> {
        move |ctx: &mut Ctx| {
            ctx.state.data.push(name);
            Err(StepError::new("boom"))
        }
    }

    struct SlowStep(Duration);

    #[async_trait]
    impl Step<(), Vec<StepName>> for SlowStep {
        async fn run(&self, ctx: &mut Ctx) -> Result<Value, StepError> {
            tokio::time::sleep(self.0).await;
            ctx.state.data.push(StepName::Execute);
            Ok(Value::Null)
        }
    }

    fn all_recording() -> Workflow<(), Vec<StepName>> {
        let mut workflow = Workflow::new("test");
        for name in StepName::ALL {
            workflow.register_fn(name, recording(name), false);
        }
        workflow
    }

    #[tokio::test]
    async fn test_invoke_records_result() {
        let workflow = all_recording();
        let mut ctx = Ctx::new((), Vec::new());

        let result = workflow.invoke(StepName::Decide, &mut ctx).await.unwrap();

        assert!(result.success);
        assert_eq!(result.step_name, StepName::Decide);
        assert_eq!(result.output, Value::from("decide"));
        assert_eq!(ctx.state.current_step, Some(StepName::Decide));
        assert_eq!(ctx.metrics.step_timings().len(), 1);
        assert_eq!(ctx.state.error_count, 0);
    }

    #[tokio::test]
    async fn test_unregistered_step() {
        let workflow: Workflow<(), Vec<StepName>> = Workflow::new("empty");
        let mut ctx = Ctx::new((), Vec::new());

        let err = workflow.invoke(StepName::Monitor, &mut ctx).await.unwrap_err();
        assert_eq!(err, WorkflowError::StepNotFound(StepName::Monitor));
        assert!(ctx.metrics.step_timings().is_empty());
    }

    #[tokio::test]
    async fn test_continue_on_error_returns_failed_result() {
        let mut workflow = all_recording();
        workflow.register_fn(StepName::Execute, failing(StepName::Execute), true);
        let mut ctx = Ctx::new((), Vec::new());

        let result = workflow.invoke(StepName::Execute, &mut ctx).await.unwrap();

        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("boom"));
        assert_eq!(ctx.state.error_count, 1);
        assert_eq!(ctx.state.last_error.as_deref(), Some("execute: boom"));
        assert!(!ctx.metrics.step_timings()[0].success);
    }

    #[tokio::test]
    async fn test_failure_propagates_without_continue_on_error() {
        let mut workflow = all_recording();
        workflow.register_fn(StepName::Monitor, failing(StepName::Monitor), false);
        let mut ctx = Ctx::new((), Vec::new());

        let err = workflow.invoke(StepName::Monitor, &mut ctx).await.unwrap_err();

        assert_eq!(
            err,
            WorkflowError::StepFailed {
                step: StepName::Monitor,
                message: "boom".to_string()
            }
        );
        assert_eq!(ctx.state.error_count, 1);
        assert_eq!(ctx.metrics.step_timings().len(), 1);
    }

    #[tokio::test]
    async fn test_reregister_replaces_step() {
        let mut workflow = all_recording();
        workflow.register_fn(StepName::Validate, failing(StepName::Validate), true);
        let mut ctx = Ctx::new((), Vec::new());

        let result = workflow.invoke(StepName::Validate, &mut ctx).await.unwrap();
        assert!(!result.success);
    }

    #[tokio::test]
    async fn test_run_loop_runs_steps_in_order() {
        let workflow = all_recording();
        let mut ctx = Ctx::new((), Vec::new());

        workflow
            .run_loop(&mut ctx, &StepName::ALL, 3, Duration::from_millis(5))
            .await;

        let expected: Vec<StepName> = StepName::ALL.repeat(3);
        assert_eq!(ctx.state.data, expected);
        assert_eq!(ctx.state.iteration_count, 3);
        assert_eq!(ctx.state.status, WorkflowStatus::Stopped);
        assert_eq!(ctx.metrics.iteration_timings().len(), 3);

        let metrics = workflow.get_metrics().await;
        assert_eq!(metrics.total_iterations, 3);
        assert_eq!(metrics.succeeded_iterations, 3);
        assert_eq!(metrics.steps[&StepName::Monitor].executions, 3);
    }

    #[tokio::test]
    async fn test_failing_step_aborts_iteration_but_not_loop() {
        let mut workflow = all_recording();
        workflow.register_fn(StepName::Decide, failing(StepName::Decide), false);
        let mut ctx = Ctx::new((), Vec::new());

        workflow
            .run_loop(&mut ctx, &StepName::ALL, 2, Duration::from_millis(5))
            .await;

        assert_eq!(
            ctx.state.data,
            vec![
                StepName::Monitor,
                StepName::Decide,
                StepName::Monitor,
                StepName::Decide
            ]
        );
        assert_eq!(ctx.state.error_count, 2);
        assert_eq!(ctx.state.status, WorkflowStatus::Stopped);

        let metrics = workflow.get_metrics().await;
        assert_eq!(metrics.failed_iterations, 2);
        assert!(metrics.steps.get(&StepName::Execute).is_none());
    }

    #[tokio::test]
    async fn test_continue_on_error_keeps_iteration_going() {
        let mut workflow = all_recording();
        workflow.register_fn(StepName::Execute, failing(StepName::Execute), true);
        let mut ctx = Ctx::new((), Vec::new());

        workflow
            .run_loop(&mut ctx, &StepName::ALL, 1, Duration::from_millis(5))
            .await;

        assert_eq!(ctx.state.data, StepName::ALL.to_vec());
        assert!(!ctx.metrics.iteration_timings()[0].success);
    }

    #[tokio::test]
    async fn test_no_sleep_after_final_iteration() {
        let workflow = all_recording();
        let mut ctx = Ctx::new((), Vec::new());

        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            workflow.run_loop(&mut ctx, &StepName::ALL, 1, Duration::from_secs(60)),
        )
        .await;

        assert!(finished.is_ok());
        assert_eq!(ctx.state.iteration_count, 1);
    }

    #[tokio::test]
    async fn test_shutdown_between_iterations() {
        let mut workflow = all_recording();
        workflow.register(StepName::Execute, SlowStep(Duration::from_millis(50)), false);
        let mut ctx = Ctx::new((), Vec::new());
        let (tx, rx) = watch::channel(false);

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            let _ = tx.send(true);
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let finished = tokio::time::timeout(
            Duration::from_secs(2),
            workflow.run_loop_until(&mut ctx, &StepName::ALL, 0, Duration::from_secs(60), rx),
        )
        .await;

        // The in-flight iteration, including the slow step, still completed.
        assert!(finished.is_ok());
        assert_eq!(ctx.state.iteration_count, 1);
        assert_eq!(ctx.state.data, StepName::ALL.to_vec());
        assert_eq!(ctx.state.status, WorkflowStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reset_clears_counters() {
        let workflow = all_recording();
        let mut ctx = Ctx::new((), Vec::new());
        workflow
            .run_loop(&mut ctx, &StepName::ALL, 1, Duration::from_millis(1))
            .await;

        workflow.reset().await;
        let metrics = workflow.get_metrics().await;
        assert_eq!(metrics.total_iterations, 0);
        assert!(metrics.steps.is_empty());
    }
}
