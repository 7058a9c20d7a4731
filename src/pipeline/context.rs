use std::collections::HashMap;

use arrow::record_batch::RecordBatch;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, warn};

use crate::pipeline::StepStatus;
use crate::rule::RecordKind;

/// Run-level facts fixed when the context is created.
#[derive(Debug, Clone, Serialize)]
pub struct ContextMetadata {
    pub entity_type: String,
    /// `YYYYMM`
    pub processing_date: i64,
    pub processing_type: RecordKind,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub step: String,
    pub status: StepStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextSummary {
    pub entity_type: String,
    pub processing_date: i64,
    pub processing_type: RecordKind,
    pub rows: usize,
    pub columns: usize,
    pub auxiliary: Vec<String>,
    pub variables: Vec<String>,
    pub errors: usize,
    pub warnings: usize,
    pub steps_run: usize,
}

/// State threaded through every step of one processing run.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    data: RecordBatch,
    auxiliary: HashMap<String, RecordBatch>,
    metadata: ContextMetadata,
    variables: Map<String, Value>,
    errors: Vec<String>,
    warnings: Vec<String>,
    history: Vec<HistoryEntry>,
}

impl ProcessingContext {
    pub fn new(
        data: RecordBatch,
        entity_type: impl Into<String>,
        processing_date: i64,
        processing_type: RecordKind,
    ) -> Self {
        let metadata = ContextMetadata {
            entity_type: entity_type.into(),
            processing_date,
            processing_type,
            created_at: Utc::now(),
        };
        let mut variables = Map::new();
        variables.insert("processing_date".into(), Value::from(processing_date));
        variables.insert("entity_type".into(), Value::from(metadata.entity_type.clone()));
        variables.insert("processing_type".into(), Value::from(processing_type.as_str()));

        Self {
            data,
            auxiliary: HashMap::new(),
            metadata,
            variables,
            errors: Vec::new(),
            warnings: Vec::new(),
            history: Vec::new(),
        }
    }

    pub fn data(&self) -> &RecordBatch {
        &self.data
    }

    /// Replaces the primary dataset wholesale.
    pub fn update_data(&mut self, data: RecordBatch) {
        self.data = data;
    }

    pub fn metadata(&self) -> &ContextMetadata {
        &self.metadata
    }

    pub fn processing_type(&self) -> RecordKind {
        self.metadata.processing_type
    }

    pub fn status_column(&self) -> &'static str {
        self.metadata.processing_type.status_column()
    }

    pub fn id_column(&self) -> &'static str {
        self.metadata.processing_type.id_column()
    }

    pub fn add_auxiliary_data(&mut self, name: impl Into<String>, data: RecordBatch) {
        self.auxiliary.insert(name.into(), data);
    }

    pub fn auxiliary_data(&self, name: &str) -> Option<&RecordBatch> {
        self.auxiliary.get(name)
    }

    pub fn auxiliary_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.auxiliary.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn set_variable(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.variables.insert(name.into(), value.into());
    }

    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }

    /// Integer variable. Numeric strings such as `"202503"` are accepted.
    pub fn int_variable(&self, name: &str) -> Option<i64> {
        match self.variables.get(name)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn add_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(entity = %self.metadata.entity_type, "{}", message);
        self.errors.push(message);
    }

    pub fn add_warning(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(entity = %self.metadata.entity_type, "{}", message);
        self.warnings.push(message);
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub(crate) fn record_step(&mut self, step: &str, status: StepStatus) {
        self.history.push(HistoryEntry {
            step: step.to_string(),
            status,
            at: Utc::now(),
        });
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn summary(&self) -> ContextSummary {
        let mut variables: Vec<_> = self.variables.keys().cloned().collect();
        variables.sort();
        ContextSummary {
            entity_type: self.metadata.entity_type.clone(),
            processing_date: self.metadata.processing_date,
            processing_type: self.metadata.processing_type,
            rows: self.data.num_rows(),
            columns: self.data.num_columns(),
            auxiliary: self.auxiliary_names(),
            variables,
            errors: self.errors.len(),
            warnings: self.warnings.len(),
            steps_run: self.history.len(),
        }
    }
}
