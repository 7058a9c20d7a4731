//! Configuration-driven status labeling for purchase orders (PO) and
//! purchase requests (PR).
//!
//! A [`ConditionEngine`] evaluates an ordered list of declarative rules over
//! an Arrow [`RecordBatch`](arrow::record_batch::RecordBatch), writing a
//! status into every row that does not have one yet. The first matching rule
//! wins and already labeled rows are never overwritten.
//!
//! Engines are driven by [`Pipeline`]s: sequences of [`Step`]s that share a
//! [`ProcessingContext`] holding the dataset, auxiliary reference datasets,
//! variables, and an error trail.

pub mod check;
pub mod columns;
pub mod config;
pub mod coverage;
pub mod engine;
pub mod frame;
pub mod mask;
pub mod metrics;
pub mod pipeline;
pub mod rule;
pub mod steps;

pub use check::{BuiltinCheck, Check, CheckInput};
pub use config::{ConfigIssue, ConfigTree};
pub use coverage::{CoverageReport, CoverageTracker};
pub use engine::{ConditionEngine, RuleContext, RuleStats};
pub use mask::Mask;
pub use metrics::{EngineMetrics, MetricsSnapshot, METRICS};
pub use pipeline::{
    Pipeline, PipelineBuilder, PipelineResult, ProcessingContext, Step, StepResult, StepStatus,
};
pub use rule::{CheckConfig, Combine, FallbackLabel, RecordKind, Rule, RuleConfig};
