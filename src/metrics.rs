use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::pipeline::StepStatus;

// Fixed-bucket latency histogram
#[derive(Debug)]
pub struct Histogram {
    buckets: Vec<(f64, AtomicU64)>, // (upper_bound, count)
    overflow: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        let bounds = [0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
        Self {
            buckets: bounds.into_iter().map(|b| (b, AtomicU64::new(0))).collect(),
            overflow: AtomicU64::new(0),
        }
    }

    fn record(&self, value: f64) {
        for (bound, count) in &self.buckets {
            if value <= *bound {
                count.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.buckets
            .iter()
            .map(|(_, c)| c.load(Ordering::Relaxed))
            .sum::<u64>()
            + self.overflow.load(Ordering::Relaxed)
    }

    fn to_prometheus(&self, name: &str, labels: &str) -> String {
        let sep = if labels.is_empty() { "" } else { "," };
        let mut output = format!("# HELP {name}_seconds Duration histogram.\n");
        output.push_str(&format!("# TYPE {name}_seconds histogram\n"));
        let mut cumulative = 0;
        for (bound, count) in &self.buckets {
            cumulative += count.load(Ordering::Relaxed);
            output.push_str(&format!(
                "{name}_seconds_bucket{{le=\"{bound}\"{sep}{labels}}} {cumulative}\n"
            ));
        }
        output.push_str(&format!(
            "{name}_seconds_bucket{{le=\"+Inf\"{sep}{labels}}} {}\n",
            self.total()
        ));
        output
    }
}

/// Counters for engine runs and pipeline steps.
pub struct EngineMetrics {
    pub engine_runs: AtomicU64,
    pub rows_labeled: AtomicU64,
    pub rows_unlabeled: AtomicU64,
    pub steps_succeeded: AtomicU64,
    pub steps_failed: AtomicU64,
    pub steps_skipped: AtomicU64,
    pub rule_hits: Mutex<HashMap<String, AtomicU64>>,
    pub engine_duration: Histogram,
    pub step_duration: Mutex<HashMap<String, Histogram>>,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            engine_runs: AtomicU64::new(0),
            rows_labeled: AtomicU64::new(0),
            rows_unlabeled: AtomicU64::new(0),
            steps_succeeded: AtomicU64::new(0),
            steps_failed: AtomicU64::new(0),
            steps_skipped: AtomicU64::new(0),
            rule_hits: Mutex::new(HashMap::new()),
            engine_duration: Histogram::new(),
            step_duration: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_engine_run(&self, duration_secs: f64, unlabeled: usize) {
        self.engine_runs.fetch_add(1, Ordering::Relaxed);
        self.rows_unlabeled.store(unlabeled as u64, Ordering::Relaxed);
        self.engine_duration.record(duration_secs);
    }

    pub fn record_rule_hits(&self, rule_id: &str, hits: usize) {
        self.rows_labeled.fetch_add(hits as u64, Ordering::Relaxed);
        let mut map = self.rule_hits.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(rule_id.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(hits as u64, Ordering::Relaxed);
    }

    pub fn record_step(&self, step: &str, status: StepStatus, duration_secs: f64) {
        let counter = match status {
            StepStatus::Success => &self.steps_succeeded,
            StepStatus::Failed => &self.steps_failed,
            StepStatus::Skipped => &self.steps_skipped,
            StepStatus::Pending | StepStatus::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        let mut map = self.step_duration.lock().unwrap_or_else(PoisonError::into_inner);
        map.entry(step.to_string())
            .or_insert_with(Histogram::new)
            .record(duration_secs);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let rule_hits = self
            .rule_hits
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.load(Ordering::Relaxed)))
            .collect();

        MetricsSnapshot {
            engine_runs: self.engine_runs.load(Ordering::Relaxed),
            rows_labeled: self.rows_labeled.load(Ordering::Relaxed),
            rows_unlabeled: self.rows_unlabeled.load(Ordering::Relaxed),
            steps_succeeded: self.steps_succeeded.load(Ordering::Relaxed),
            steps_failed: self.steps_failed.load(Ordering::Relaxed),
            steps_skipped: self.steps_skipped.load(Ordering::Relaxed),
            rule_hits,
        }
    }

    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut output = format!(
            "# HELP accrual_engine_runs_total Total number of rule engine runs.\n\
             # TYPE accrual_engine_runs_total counter\n\
             accrual_engine_runs_total {}\n\
             # HELP accrual_rows_labeled_total Total number of rows labeled by a rule.\n\
             # TYPE accrual_rows_labeled_total counter\n\
             accrual_rows_labeled_total {}\n\
             # HELP accrual_rows_unlabeled Rows left without a status by the last run.\n\
             # TYPE accrual_rows_unlabeled gauge\n\
             accrual_rows_unlabeled {}\n\
             # HELP accrual_steps_total Pipeline step outcomes.\n\
             # TYPE accrual_steps_total counter\n\
             accrual_steps_total{{status=\"success\"}} {}\n\
             accrual_steps_total{{status=\"failed\"}} {}\n\
             accrual_steps_total{{status=\"skipped\"}} {}\n",
            snapshot.engine_runs,
            snapshot.rows_labeled,
            snapshot.rows_unlabeled,
            snapshot.steps_succeeded,
            snapshot.steps_failed,
            snapshot.steps_skipped,
        );

        output.push_str("# HELP accrual_rule_hits_total Rows labeled per rule.\n");
        output.push_str("# TYPE accrual_rule_hits_total counter\n");
        let mut rules: Vec<_> = snapshot.rule_hits.iter().collect();
        rules.sort();
        for (rule_id, count) in rules {
            output.push_str(&format!(
                "accrual_rule_hits_total{{rule_id=\"{rule_id}\"}} {count}\n"
            ));
        }

        output.push_str(&self.engine_duration.to_prometheus("accrual_engine_duration", ""));

        let steps = self.step_duration.lock().unwrap_or_else(PoisonError::into_inner);
        let mut names: Vec<_> = steps.keys().collect();
        names.sort();
        for name in names {
            output.push_str(&steps[name].to_prometheus(
                "accrual_step_duration",
                &format!("step=\"{name}\""),
            ));
        }

        output
    }
}

#[derive(Debug, serde::Serialize)]
pub struct MetricsSnapshot {
    pub engine_runs: u64,
    pub rows_labeled: u64,
    pub rows_unlabeled: u64,
    pub steps_succeeded: u64,
    pub steps_failed: u64,
    pub steps_skipped: u64,
    pub rule_hits: HashMap<String, u64>,
}

lazy_static::lazy_static! {
    pub static ref METRICS: Arc<EngineMetrics> = Arc::new(EngineMetrics::new());
}
