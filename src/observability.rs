use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::{debug, info};

use crate::report::{GateOutcome, GateStatus};
use crate::run::{RunStatus, StepOutcome, StepResult};

#[cfg(feature = "metrics-server")]
pub mod server;

#[derive(Debug, Default, Serialize, Clone)]
pub struct MetricsSnapshot {
    pub stages: BTreeMap<String, StageMetrics>,
    /// Finished runs keyed by terminal status.
    pub runs: BTreeMap<String, u64>,
    pub steps_total: u64,
    pub steps_failed: u64,
    pub step_timeouts: u64,
    pub missing_credentials: u64,
    pub gate_passes: u64,
    pub gate_failures: u64,
    pub last_run_duration_ms: f64,
}

#[derive(Debug, Default, Serialize, Clone)]
pub struct StageMetrics {
    pub calls: u64,
    pub failures: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
}

#[derive(Debug, Default, Clone)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsSnapshot>>,
}

impl MetricsCollector {
    pub fn global() -> &'static MetricsCollector {
        static INSTANCE: Lazy<MetricsCollector> = Lazy::new(MetricsCollector::new);
        &INSTANCE
    }

    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsSnapshot::default())),
        }
    }

    pub fn start_stage(&self, stage_name: &str) -> StageTimer {
        StageTimer {
            stage: stage_name.to_string(),
            started_at: Instant::now(),
            collector: self.inner.clone(),
            failed: false,
            recorded: false,
        }
    }

    pub fn record_step(&self, step: &StepResult) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.steps_total += 1;
            match step.outcome {
                StepOutcome::Succeeded => {}
                StepOutcome::TimedOut => {
                    guard.steps_failed += 1;
                    guard.step_timeouts += 1;
                }
                StepOutcome::MissingCredential => {
                    guard.steps_failed += 1;
                    guard.missing_credentials += 1;
                }
                StepOutcome::Failed | StepOutcome::SpawnError => guard.steps_failed += 1,
            }
        }
    }

    pub fn record_gate(&self, outcome: &GateOutcome) {
        if let Ok(mut guard) = self.inner.lock() {
            match outcome.status {
                GateStatus::Passed => guard.gate_passes += 1,
                GateStatus::Failed | GateStatus::Error => guard.gate_failures += 1,
                GateStatus::NotEvaluated => {}
            }
        }
    }

    pub fn record_run(&self, status: RunStatus, duration: Duration) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard.runs.entry(status_label(status).to_string()).or_default() += 1;
            guard.last_run_duration_ms = duration.as_secs_f64() * 1_000.0;
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.lock().map(|g| g.clone()).unwrap_or_default()
    }

    pub fn reset(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            *guard = MetricsSnapshot::default();
        }
    }
}

fn status_label(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "pending",
        RunStatus::Running => "running",
        RunStatus::Succeeded => "succeeded",
        RunStatus::Failed => "failed",
        RunStatus::Aborted => "aborted",
    }
}

/// Records the stage duration when dropped.
pub struct StageTimer {
    stage: String,
    started_at: Instant,
    collector: Arc<Mutex<MetricsSnapshot>>,
    failed: bool,
    recorded: bool,
}

impl StageTimer {
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }

    fn record(&mut self) {
        if self.recorded {
            return;
        }
        let duration = self.started_at.elapsed();
        let duration_ms = duration.as_secs_f64() * 1_000.0;
        if let Ok(mut guard) = self.collector.lock() {
            let metrics = guard.stages.entry(self.stage.clone()).or_default();
            metrics.calls += 1;
            if self.failed {
                metrics.failures += 1;
            }
            metrics.total_duration_ms += duration_ms;
            if duration_ms > metrics.max_duration_ms {
                metrics.max_duration_ms = duration_ms;
            }
        }
        debug!(
            stage = self.stage.as_str(),
            duration_ms,
            failed = self.failed,
            "Stage duration recorded"
        );
        self.recorded = true;
    }
}

impl Drop for StageTimer {
    fn drop(&mut self) {
        self.record();
    }
}

pub fn log_snapshot(snapshot: &MetricsSnapshot) {
    info!(
        last_run_duration_ms = snapshot.last_run_duration_ms,
        stage_count = snapshot.stages.len(),
        steps_total = snapshot.steps_total,
        steps_failed = snapshot.steps_failed,
        step_timeouts = snapshot.step_timeouts,
        gate_passes = snapshot.gate_passes,
        gate_failures = snapshot.gate_failures,
        "Pipeline metrics summary"
    );
    for (stage, metrics) in &snapshot.stages {
        info!(
            stage = stage.as_str(),
            calls = metrics.calls,
            failures = metrics.failures,
            total_ms = metrics.total_duration_ms,
            max_ms = metrics.max_duration_ms,
            "Stage metrics"
        );
    }
}

impl MetricsSnapshot {
    pub fn to_prometheus(&self) -> String {
        let mut output = String::new();
        push_counter(
            &mut output,
            "bunker_ci_steps_total",
            "Total number of steps executed",
            self.steps_total,
        );
        push_counter(
            &mut output,
            "bunker_ci_steps_failed_total",
            "Total number of steps that did not succeed",
            self.steps_failed,
        );
        push_counter(
            &mut output,
            "bunker_ci_step_timeouts_total",
            "Total number of steps killed on timeout",
            self.step_timeouts,
        );
        push_counter(
            &mut output,
            "bunker_ci_missing_credentials_total",
            "Total number of steps skipped for a missing credential",
            self.missing_credentials,
        );
        push_counter(
            &mut output,
            "bunker_ci_gate_passes_total",
            "Total number of gate passes",
            self.gate_passes,
        );
        push_counter(
            &mut output,
            "bunker_ci_gate_failures_total",
            "Total number of gate failures",
            self.gate_failures,
        );
        output.push_str("# HELP bunker_ci_runs_total Finished runs by status\n");
        output.push_str("# TYPE bunker_ci_runs_total counter\n");
        for (status, count) in &self.runs {
            output.push_str(&format!(
                "bunker_ci_runs_total{{status=\"{}\"}} {}\n",
                status, count
            ));
        }
        output.push_str("# HELP bunker_ci_stage_calls_total Stage invocation count\n");
        output.push_str("# TYPE bunker_ci_stage_calls_total counter\n");
        output.push_str("# HELP bunker_ci_stage_failures_total Stage failure count\n");
        output.push_str("# TYPE bunker_ci_stage_failures_total counter\n");
        output.push_str(
            "# HELP bunker_ci_stage_duration_seconds_total Accumulated stage duration in seconds\n",
        );
        output.push_str("# TYPE bunker_ci_stage_duration_seconds_total counter\n");
        output.push_str(
            "# HELP bunker_ci_stage_duration_seconds_max Maximum stage duration in seconds\n",
        );
        output.push_str("# TYPE bunker_ci_stage_duration_seconds_max gauge\n");
        for (stage, metrics) in &self.stages {
            output.push_str(&format!(
                "bunker_ci_stage_calls_total{{stage=\"{}\"}} {}\n",
                stage, metrics.calls
            ));
            output.push_str(&format!(
                "bunker_ci_stage_failures_total{{stage=\"{}\"}} {}\n",
                stage, metrics.failures
            ));
            output.push_str(&format!(
                "bunker_ci_stage_duration_seconds_total{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.total_duration_ms / 1_000.0
            ));
            output.push_str(&format!(
                "bunker_ci_stage_duration_seconds_max{{stage=\"{}\"}} {:.6}\n",
                stage,
                metrics.max_duration_ms / 1_000.0
            ));
        }
        output.push_str("# HELP bunker_ci_run_duration_seconds Duration of the last run\n");
        output.push_str("# TYPE bunker_ci_run_duration_seconds gauge\n");
        output.push_str(&format!(
            "bunker_ci_run_duration_seconds {:.6}\n",
            self.last_run_duration_ms / 1_000.0
        ));
        output
    }
}

fn push_counter(output: &mut String, name: &str, help: &str, value: u64) {
    output.push_str(&format!("# HELP {name} {help}\n"));
    output.push_str(&format!("# TYPE {name} counter\n"));
    output.push_str(&format!("{name} {value}\n"));
}
