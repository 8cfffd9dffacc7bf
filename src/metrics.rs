use crate::{
    config::RunConfig,
    outcome::{JobOutcome, OutcomeState},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Nearest-rank percentile: sort ascending, take index `floor(n * p / 100)`
/// clamped to the last element. Empty input yields 0.0.
pub fn percentile(values: &[f64], p: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    percentile_sorted(&sorted, p)
}

fn percentile_sorted(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let rank = (sorted.len() as f64 * p / 100.0).floor();
    let idx = if rank.is_nan() || rank < 0.0 {
        0
    } else {
        (rank as usize).min(sorted.len() - 1)
    };
    sorted[idx]
}

/// `100 * (failed + timed_out) / total`, or 0 when nothing was issued.
pub fn error_rate(failed: u64, timed_out: u64, total: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    (failed + timed_out) as f64 * 100.0 / total as f64
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

impl LatencyStats {
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let mut sorted = values.to_vec();
        sorted.sort_by(f64::total_cmp);
        let sum: f64 = sorted.iter().sum();
        Self {
            count: sorted.len(),
            avg_ms: sum / sorted.len() as f64,
            min_ms: sorted[0],
            max_ms: sorted[sorted.len() - 1],
            p50_ms: percentile_sorted(&sorted, 50.0),
            p95_ms: percentile_sorted(&sorted, 95.0),
            p99_ms: percentile_sorted(&sorted, 99.0),
        }
    }
}

/// Run-level descriptors that are not derivable from the outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMeta {
    pub label: String,
    pub mode: String,
    pub concurrency: usize,
    pub batch_size: usize,
    pub target_files_per_second: Option<f64>,
    pub fleet_count: Option<u32>,
    pub planned_units: u64,
    pub interrupted: bool,
    pub started_at: String,
}

impl StageMeta {
    pub fn for_run(run: &RunConfig) -> Self {
        Self {
            label: run.label.clone(),
            mode: run.mode.name().to_string(),
            concurrency: run.mode.concurrency(),
            batch_size: run.batch_size,
            target_files_per_second: run.mode.target_rate(),
            fleet_count: run.fleet_count,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub meta: StageMeta,

    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub submit_failed: u64,
    pub parse_errors: u64,
    pub server_failed: u64,
    pub timed_out: u64,

    pub total_files: u64,
    pub successful_files: u64,
    pub total_bytes: u64,
    pub successful_bytes: u64,

    pub submit_latency: LatencyStats,
    pub job_duration: LatencyStats,
    pub avg_poll_attempts: f64,

    pub wall_seconds: f64,
    pub jobs_per_second: f64,
    pub files_per_second: f64,
    pub bytes_per_second: f64,
    pub error_rate: f64,
}

impl RunSummary {
    /// Pure reduction of a (possibly partial) outcome list. Non-terminal
    /// outcomes are ignored.
    pub fn from_outcomes(meta: StageMeta, outcomes: &[JobOutcome]) -> Self {
        let terminal: Vec<&JobOutcome> = outcomes.iter().filter(|o| o.is_terminal()).collect();

        let count = |s: OutcomeState| terminal.iter().filter(|o| o.state == s).count() as u64;
        let successful_jobs = count(OutcomeState::Succeeded);
        let submit_failed = count(OutcomeState::SubmitFailed);
        let parse_errors = count(OutcomeState::ParseError);
        let server_failed = count(OutcomeState::ServerFailed);
        let timed_out = count(OutcomeState::TimedOut);
        let failed_jobs = submit_failed + parse_errors + server_failed;
        let total_jobs = terminal.len() as u64;

        let succeeded = || terminal.iter().filter(|o| o.state == OutcomeState::Succeeded);
        let total_files = terminal.iter().map(|o| o.file_count as u64).sum();
        let successful_files = succeeded().map(|o| o.file_count as u64).sum();
        let total_bytes = terminal.iter().map(|o| o.total_bytes).sum();
        let successful_bytes = succeeded().map(|o| o.total_bytes).sum();

        let latencies: Vec<f64> = terminal.iter().map(|o| o.submit_latency_ms).collect();
        let durations: Vec<f64> = succeeded().filter_map(|o| o.job_duration_ms).collect();
        let polled: Vec<u32> = terminal
            .iter()
            .filter(|o| o.poll_started_ms.is_some())
            .map(|o| o.poll_attempts)
            .collect();
        let avg_poll_attempts = if polled.is_empty() {
            0.0
        } else {
            polled.iter().map(|&n| n as f64).sum::<f64>() / polled.len() as f64
        };

        let wall_seconds = wall_clock_seconds(&terminal);
        let rate = |n: f64| if wall_seconds > 0.0 { n / wall_seconds } else { 0.0 };

        Self {
            meta,
            total_jobs,
            successful_jobs,
            failed_jobs,
            submit_failed,
            parse_errors,
            server_failed,
            timed_out,
            total_files,
            successful_files,
            total_bytes,
            successful_bytes,
            submit_latency: LatencyStats::from_values(&latencies),
            job_duration: LatencyStats::from_values(&durations),
            avg_poll_attempts,
            wall_seconds,
            jobs_per_second: rate(successful_jobs as f64),
            files_per_second: rate(successful_files as f64),
            bytes_per_second: rate(successful_bytes as f64),
            error_rate: error_rate(failed_jobs, timed_out, total_jobs),
        }
    }

    /// Flat key/value view with a stable column order, for delimited export.
    pub fn record(&self) -> Vec<(&'static str, String)> {
        let opt = |v: Option<String>| v.unwrap_or_default();
        vec![
            ("label", self.meta.label.clone()),
            ("mode", self.meta.mode.clone()),
            ("fleet_count", opt(self.meta.fleet_count.map(|v| v.to_string()))),
            (
                "target_files_per_second",
                opt(self.meta.target_files_per_second.map(|v| format!("{v}"))),
            ),
            ("concurrency", self.meta.concurrency.to_string()),
            ("batch_size", self.meta.batch_size.to_string()),
            ("interrupted", self.meta.interrupted.to_string()),
            ("total_jobs", self.total_jobs.to_string()),
            ("successful_jobs", self.successful_jobs.to_string()),
            ("failed_jobs", self.failed_jobs.to_string()),
            ("submit_failed", self.submit_failed.to_string()),
            ("parse_errors", self.parse_errors.to_string()),
            ("server_failed", self.server_failed.to_string()),
            ("timed_out", self.timed_out.to_string()),
            ("error_rate_pct", format!("{:.2}", self.error_rate)),
            ("total_files", self.total_files.to_string()),
            ("total_bytes", self.total_bytes.to_string()),
            ("submit_avg_ms", format!("{:.2}", self.submit_latency.avg_ms)),
            ("submit_min_ms", format!("{:.2}", self.submit_latency.min_ms)),
            ("submit_max_ms", format!("{:.2}", self.submit_latency.max_ms)),
            ("submit_p50_ms", format!("{:.2}", self.submit_latency.p50_ms)),
            ("submit_p95_ms", format!("{:.2}", self.submit_latency.p95_ms)),
            ("submit_p99_ms", format!("{:.2}", self.submit_latency.p99_ms)),
            ("job_avg_ms", format!("{:.2}", self.job_duration.avg_ms)),
            ("job_min_ms", format!("{:.2}", self.job_duration.min_ms)),
            ("job_max_ms", format!("{:.2}", self.job_duration.max_ms)),
            ("job_p50_ms", format!("{:.2}", self.job_duration.p50_ms)),
            ("job_p95_ms", format!("{:.2}", self.job_duration.p95_ms)),
            ("job_p99_ms", format!("{:.2}", self.job_duration.p99_ms)),
            ("avg_poll_attempts", format!("{:.2}", self.avg_poll_attempts)),
            ("wall_seconds", format!("{:.3}", self.wall_seconds)),
            ("jobs_per_second", format!("{:.3}", self.jobs_per_second)),
            ("files_per_second", format!("{:.3}", self.files_per_second)),
            ("bytes_per_second", format!("{:.1}", self.bytes_per_second)),
        ]
    }
}

/// First submission start to the last terminal timestamp.
fn wall_clock_seconds(outcomes: &[&JobOutcome]) -> f64 {
    let first = outcomes
        .iter()
        .map(|o| o.submit_started_ms)
        .min_by(f64::total_cmp);
    let last = outcomes.iter().map(|o| o.terminal_ms()).max_by(f64::total_cmp);
    match (first, last) {
        (Some(a), Some(b)) if b > a => (b - a) / 1000.0,
        _ => 0.0,
    }
}

/// Distinct failure reasons with their counts, most frequent first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorGroup {
    pub state: OutcomeState,
    pub detail: String,
    pub count: u64,
}

pub fn group_errors(outcomes: &[JobOutcome]) -> Vec<ErrorGroup> {
    let mut counts: HashMap<(OutcomeState, String), u64> = HashMap::new();
    for o in outcomes {
        if !o.is_terminal() || o.state == OutcomeState::Succeeded {
            continue;
        }
        let detail: String = o
            .error
            .as_deref()
            .unwrap_or("unknown error")
            .chars()
            .take(100)
            .collect();
        *counts.entry((o.state, detail)).or_insert(0) += 1;
    }
    let mut groups: Vec<ErrorGroup> = counts
        .into_iter()
        .map(|((state, detail), count)| ErrorGroup {
            state,
            detail,
            count,
        })
        .collect();
    groups.sort_by(|a, b| {
        b.count
            .cmp(&a.count)
            .then(a.state.cmp(&b.state))
            .then(a.detail.cmp(&b.detail))
    });
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepTotals {
    pub stages: usize,
    pub total_jobs: u64,
    pub successful_jobs: u64,
    pub failed_jobs: u64,
    pub timed_out: u64,
    pub total_files: u64,
    pub total_bytes: u64,
    pub wall_seconds: f64,
    pub overall_error_rate: f64,
}

/// Completed stages of a sweep plus totals reduced from summed counts.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SweepSummary {
    stages: Vec<RunSummary>,
    totals: SweepTotals,
}

impl SweepSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, stage: RunSummary) {
        let t = &mut self.totals;
        t.stages += 1;
        t.total_jobs += stage.total_jobs;
        t.successful_jobs += stage.successful_jobs;
        t.failed_jobs += stage.failed_jobs;
        t.timed_out += stage.timed_out;
        t.total_files += stage.total_files;
        t.total_bytes += stage.total_bytes;
        t.wall_seconds += stage.wall_seconds;
        t.overall_error_rate = error_rate(t.failed_jobs, t.timed_out, t.total_jobs);
        self.stages.push(stage);
    }

    pub fn stages(&self) -> &[RunSummary] {
        &self.stages
    }

    pub fn totals(&self) -> &SweepTotals {
        &self.totals
    }

    pub fn overall_error_rate(&self) -> f64 {
        self.totals.overall_error_rate
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
