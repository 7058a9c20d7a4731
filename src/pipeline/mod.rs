//! Sequential step pipeline.
//!
//! Steps run strictly one after another against a shared
//! [`ProcessingContext`]. The dataset is snapshotted before each step and
//! restored if the step fails, so a failure never leaves partial output
//! behind.

mod context;
mod step;

pub use context::{ContextMetadata, ContextSummary, HistoryEntry, ProcessingContext};
pub use step::{run_step, Step, StepResult, StepStatus};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Result};
use futures::FutureExt;
use tracing::{error, info, warn};

use crate::metrics::{EngineMetrics, METRICS};

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone)]
pub struct PipelineResult {
    pub pipeline: String,
    pub success: bool,
    /// One result per step that ran, in order.
    pub results: Vec<StepResult>,
    pub duration: Duration,
    /// The context error trail at the end of the run.
    pub errors: Vec<String>,
}

impl PipelineResult {
    pub fn first_failure(&self) -> Option<&StepResult> {
        self.results.iter().find(|r| r.is_failed())
    }

    pub fn result(&self, step: &str) -> Option<&StepResult> {
        self.results.iter().find(|r| r.step_name == step)
    }
}

pub struct Pipeline {
    name: String,
    description: String,
    stop_on_error: bool,
    steps: Vec<Arc<dyn Step>>,
    metrics: Arc<EngineMetrics>,
}

impl Pipeline {
    pub fn builder(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn execute(&self, ctx: &mut ProcessingContext) -> PipelineResult {
        let started = Instant::now();
        info!(pipeline = %self.name, steps = self.steps.len(), "Pipeline started");

        let mut results: Vec<StepResult> = Vec::with_capacity(self.steps.len());
        let mut completed: Vec<&Arc<dyn Step>> = Vec::new();
        let mut success = true;

        for step in &self.steps {
            let result = self.run_one(step.as_ref(), ctx).await;
            self.metrics.record_step(
                step.name(),
                result.status,
                result.duration.as_secs_f64(),
            );
            ctx.record_step(step.name(), result.status);

            match result.status {
                StepStatus::Failed => {
                    success = false;
                    let reason = result.error.clone().unwrap_or_else(|| result.message.clone());
                    error!(pipeline = %self.name, step = step.name(), error = %reason, "Step failed");
                    results.push(result);

                    if self.stop_on_error {
                        step.rollback(ctx, &reason).await;
                        for done in completed.iter().rev() {
                            done.rollback(ctx, &reason).await;
                        }
                        warn!(pipeline = %self.name, step = step.name(), "Pipeline stopped");
                        break;
                    }
                }
                StepStatus::Success => {
                    info!(pipeline = %self.name, step = step.name(), message = %result.message, "Step succeeded");
                    completed.push(step);
                    results.push(result);
                }
                _ => {
                    info!(pipeline = %self.name, step = step.name(), message = %result.message, "Step skipped");
                    results.push(result);
                }
            }
        }

        let duration = started.elapsed();
        info!(
            pipeline = %self.name,
            success,
            steps_run = results.len(),
            elapsed_ms = duration.as_millis() as u64,
            "Pipeline finished"
        );

        PipelineResult {
            pipeline: self.name.clone(),
            success,
            results,
            duration,
            errors: ctx.errors().to_vec(),
        }
    }

    async fn run_one(&self, step: &dyn Step, ctx: &mut ProcessingContext) -> StepResult {
        if !step.validate_input(ctx) {
            let message = format!("Input validation failed for step '{}'", step.name());
            ctx.add_error(message.clone());
            return if step.required() {
                StepResult::failed(step.name(), &anyhow!(message))
            } else {
                StepResult::skipped(step.name(), message)
            };
        }

        let snapshot = ctx.data().clone();
        let started = Instant::now();
        let result = match AssertUnwindSafe(step.execute(ctx)).catch_unwind().await {
            Ok(result) => result,
            Err(payload) => {
                let reason = panic_message(payload.as_ref());
                error!(pipeline = %self.name, step = step.name(), panic = %reason, "Step panicked");
                StepResult::failed(step.name(), &anyhow!("step panicked: {reason}"))
                    .with_duration(started.elapsed())
            }
        };
        if result.is_failed() {
            ctx.update_data(snapshot);
            ctx.add_error(format!("Step '{}' failed: {}", step.name(), result.message));
        }
        result
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

pub struct PipelineBuilder {
    name: String,
    description: String,
    stop_on_error: bool,
    steps: Vec<Arc<dyn Step>>,
    metrics: Arc<EngineMetrics>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            stop_on_error: true,
            steps: Vec::new(),
            metrics: Arc::clone(&METRICS),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_stop_on_error(mut self, stop: bool) -> Self {
        self.stop_on_error = stop;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn add_step(mut self, step: Arc<dyn Step>) -> Self {
        self.steps.push(step);
        self
    }

    pub fn add_steps(mut self, steps: impl IntoIterator<Item = Arc<dyn Step>>) -> Self {
        self.steps.extend(steps);
        self
    }

    pub fn build(self) -> Result<Pipeline> {
        if self.steps.is_empty() {
            bail!("Pipeline '{}' has no steps", self.name);
        }
        Ok(Pipeline {
            name: self.name,
            description: self.description,
            stop_on_error: self.stop_on_error,
            steps: self.steps,
            metrics: self.metrics,
        })
    }
}
