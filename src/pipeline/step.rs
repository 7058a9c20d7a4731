use std::fmt;
use std::time::{Duration, Instant};

use anyhow::Result;
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::pipeline::ProcessingContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        };
        f.write_str(s)
    }
}

/// Outcome of one step.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub data: Option<RecordBatch>,
    pub message: String,
    pub duration: Duration,
    pub metadata: Map<String, Value>,
    /// Rendered error chain of a failed step.
    pub error: Option<String>,
}

impl StepResult {
    fn new(step_name: &str, status: StepStatus, message: impl Into<String>) -> Self {
        Self {
            step_name: step_name.to_string(),
            status,
            data: None,
            message: message.into(),
            duration: Duration::ZERO,
            metadata: Map::new(),
            error: None,
        }
    }

    pub fn success(step_name: &str, message: impl Into<String>) -> Self {
        Self::new(step_name, StepStatus::Success, message)
    }

    pub fn skipped(step_name: &str, message: impl Into<String>) -> Self {
        Self::new(step_name, StepStatus::Skipped, message)
    }

    pub fn failed(step_name: &str, error: &anyhow::Error) -> Self {
        let mut result = Self::new(step_name, StepStatus::Failed, error.to_string());
        result.error = Some(format!("{error:#}"));
        result
    }

    pub fn with_data(mut self, data: RecordBatch) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }

    pub fn is_failed(&self) -> bool {
        self.status == StepStatus::Failed
    }
}

/// A unit of work in a [`Pipeline`](crate::pipeline::Pipeline).
#[async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Required steps fail the run when their preconditions do not hold;
    /// optional ones are skipped.
    fn required(&self) -> bool {
        true
    }

    /// Cheap precondition check run before `execute`.
    fn validate_input(&self, ctx: &ProcessingContext) -> bool;

    /// Does the work. Errors are reported through the result, never
    /// propagated.
    async fn execute(&self, ctx: &mut ProcessingContext) -> StepResult;

    /// Compensation after a failure. Does nothing by default.
    async fn rollback(&self, ctx: &mut ProcessingContext, error: &str) {
        let _ = ctx;
        debug!(step = self.name(), error, "No rollback action");
    }
}

/// Runs a fallible step body and converts the outcome into a [`StepResult`]
/// with its duration filled in.
pub async fn run_step<F, Fut>(name: &str, body: F) -> StepResult
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<StepResult>>,
{
    let started = Instant::now();
    let result = match body().await {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(step = name, error = %format!("{e:#}"), "Step failed");
            StepResult::failed(name, &e)
        }
    };
    result.with_duration(started.elapsed())
}
