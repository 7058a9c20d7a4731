use std::sync::Arc;

use anyhow::{anyhow, Result};
use arrow::record_batch::RecordBatch;
use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::pipeline::{run_step, ProcessingContext, Step, StepResult};

/// Produces one named auxiliary dataset.
#[async_trait]
pub trait AuxiliarySource: Send + Sync {
    fn name(&self) -> &str;
    async fn load(&self) -> Result<RecordBatch>;
}

/// A dataset already in memory.
pub struct StaticSource {
    name: String,
    batch: RecordBatch,
}

impl StaticSource {
    pub fn new(name: impl Into<String>, batch: RecordBatch) -> Self {
        Self {
            name: name.into(),
            batch,
        }
    }
}

#[async_trait]
impl AuxiliarySource for StaticSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn load(&self) -> Result<RecordBatch> {
        Ok(self.batch.clone())
    }
}

/// Loads several auxiliary datasets concurrently. Either all of them land in
/// the context or none do.
pub struct AuxiliaryLoadStep {
    name: String,
    sources: Vec<Arc<dyn AuxiliarySource>>,
    required: bool,
}

impl AuxiliaryLoadStep {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sources: Vec::new(),
            required: true,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn AuxiliarySource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    async fn load_all(&self, ctx: &mut ProcessingContext) -> Result<StepResult> {
        let mut tasks = JoinSet::new();
        for source in &self.sources {
            let source = Arc::clone(source);
            tasks.spawn(async move {
                let name = source.name().to_string();
                let loaded = source.load().await;
                (name, loaded)
            });
        }

        let mut loaded = Vec::with_capacity(self.sources.len());
        let mut failures = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((name, Ok(batch))) => loaded.push((name, batch)),
                Ok((name, Err(e))) => failures.push(format!("{name}: {e:#}")),
                Err(e) => failures.push(format!("loader task aborted: {e}")),
            }
        }

        if !failures.is_empty() {
            failures.sort();
            for failure in &failures {
                warn!(step = %self.name, "Auxiliary load failed: {}", failure);
            }
            return Err(anyhow!(
                "{} of {} auxiliary datasets failed to load: {}",
                failures.len(),
                self.sources.len(),
                failures.join("; ")
            ));
        }

        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        let mut result = StepResult::success(
            &self.name,
            format!("Loaded {} auxiliary datasets", loaded.len()),
        );
        for (name, batch) in loaded {
            info!(step = %self.name, dataset = %name, rows = batch.num_rows(), "Auxiliary dataset loaded");
            result = result.with_metadata(&name, batch.num_rows());
            ctx.add_auxiliary_data(name, batch);
        }
        Ok(result)
    }
}

#[async_trait]
impl Step for AuxiliaryLoadStep {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Load auxiliary datasets"
    }

    fn required(&self) -> bool {
        self.required
    }

    fn validate_input(&self, _ctx: &ProcessingContext) -> bool {
        !self.sources.is_empty()
    }

    async fn execute(&self, ctx: &mut ProcessingContext) -> StepResult {
        run_step(&self.name, || self.load_all(ctx)).await
    }
}
