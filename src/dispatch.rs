use crate::{
    api::JobApi,
    config::{DispatchMode, MIN_LAUNCH_INTERVAL, RunConfig},
    outcome::{JobOutcome, OutcomeState, RunClock},
    poll::JobPoller,
    samples::SampleSet,
    submit::BatchSubmitter,
    util::now_rfc3339,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{Instrument, error, info, info_span};

type OutcomeTx = mpsc::UnboundedSender<JobOutcome>;

/// Launch schedule of a fixed-rate run. The interval never drops below
/// [`MIN_LAUNCH_INTERVAL`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RatePlan {
    pub units: u64,
    pub interval: Duration,
}

impl RatePlan {
    pub fn new(files_per_second: f64, duration_seconds: u64, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1) as u64;
        let total_files = (files_per_second * duration_seconds as f64).round().max(1.0) as u64;
        Self {
            units: total_files.div_ceil(batch_size),
            interval: Duration::try_from_secs_f64(batch_size as f64 / files_per_second)
                .unwrap_or(Duration::MAX)
                .max(MIN_LAUNCH_INTERVAL),
        }
    }
}

/// Everything one run produced. `outcomes` holds only terminal outcomes; an
/// interrupted run simply has fewer of them.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub outcomes: Vec<JobOutcome>,
    pub interrupted: bool,
    pub planned_units: u64,
    pub started_at: String,
    pub elapsed: Duration,
}

pub struct Dispatcher {
    api: Arc<dyn JobApi>,
    run: Arc<RunConfig>,
    samples: Arc<SampleSet>,
}

/// Submitter and poller shared by every unit of one run.
#[derive(Clone)]
struct UnitContext {
    submitter: Arc<BatchSubmitter>,
    poller: Arc<JobPoller>,
    samples: Arc<SampleSet>,
    batch_size: usize,
    tx: OutcomeTx,
}

impl UnitContext {
    fn spawn(&self, set: &mut JoinSet<()>, ids: &mut HashMap<tokio::task::Id, u64>, batch_id: u64) {
        let ctx = self.clone();
        let span = info_span!("unit", batch = batch_id);
        let handle = set.spawn(
            async move {
                let batch = ctx.samples.batch(batch_id, ctx.batch_size);
                let submitted = ctx.submitter.submit(batch_id, &batch).await;
                let outcome = ctx.poller.poll(submitted).await;
                // The receiver is gone only when the run was abandoned.
                let _ = ctx.tx.send(outcome);
            }
            .instrument(span),
        );
        ids.insert(handle.id(), batch_id);
    }

    /// A unit that died without reporting still yields a terminal outcome.
    fn report_crash(&self, batch_id: u64, err: JoinError) {
        if err.is_cancelled() {
            return;
        }
        error!("unit for batch {batch_id} crashed: {err}");
        let names = self
            .samples
            .batch(batch_id, self.batch_size)
            .into_iter()
            .map(|s| s.name)
            .collect();
        let mut outcome = JobOutcome::new(batch_id, names, 0);
        outcome.fail_submission(OutcomeState::SubmitFailed, format!("unit crashed: {err}"));
        let _ = self.tx.send(outcome);
    }
}

impl Dispatcher {
    pub fn new(api: Arc<dyn JobApi>, run: Arc<RunConfig>, samples: Arc<SampleSet>) -> Self {
        Self { api, run, samples }
    }

    pub fn planned_units(&self) -> u64 {
        match &self.run.mode {
            DispatchMode::Sequential { batches } | DispatchMode::Parallel { batches, .. } => {
                *batches as u64
            }
            DispatchMode::FixedRate {
                files_per_second,
                duration_seconds,
            } => RatePlan::new(*files_per_second, *duration_seconds, self.run.batch_size).units,
        }
    }

    /// Runs every unit to a terminal state, or until `interrupt` resolves.
    /// On interruption in-flight units are abandoned locally and only the
    /// outcomes finalized so far are returned.
    pub async fn execute<F>(&self, interrupt: F) -> RunResult
    where
        F: Future<Output = ()>,
    {
        let clock = RunClock::start();
        let started_at = now_rfc3339();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = UnitContext {
            submitter: Arc::new(BatchSubmitter::new(
                self.api.clone(),
                self.run.clone(),
                clock,
            )),
            poller: Arc::new(JobPoller::new(
                self.api.clone(),
                self.run.poll.clone(),
                clock,
            )),
            samples: self.samples.clone(),
            batch_size: self.run.batch_size,
            tx,
        };

        info!(
            "dispatch start label={} mode={} units={} batch_size={}",
            self.run.label,
            self.run.mode.name(),
            self.planned_units(),
            self.run.batch_size
        );

        let interrupted = tokio::select! {
            _ = self.dispatch(ctx) => false,
            _ = interrupt => true,
        };

        rx.close();
        let mut outcomes = Vec::new();
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        let elapsed = clock.origin().elapsed();
        if interrupted {
            info!(
                "dispatch interrupted after {:.1}s with {} finished units",
                elapsed.as_secs_f64(),
                outcomes.len()
            );
        } else {
            info!(
                "dispatch complete: {} units in {:.1}s",
                outcomes.len(),
                elapsed.as_secs_f64()
            );
        }

        RunResult {
            outcomes,
            interrupted,
            planned_units: self.planned_units(),
            started_at,
            elapsed,
        }
    }

    async fn dispatch(&self, ctx: UnitContext) {
        match self.run.mode.clone() {
            DispatchMode::Sequential { batches } => bounded(ctx, batches as u64, 1).await,
            DispatchMode::Parallel {
                batches,
                concurrency,
            } => bounded(ctx, batches as u64, concurrency).await,
            DispatchMode::FixedRate {
                files_per_second,
                duration_seconds,
            } => {
                let plan = RatePlan::new(files_per_second, duration_seconds, self.run.batch_size);
                fixed_rate(ctx, plan, files_per_second).await
            }
        }
    }
}

/// At most `limit` units in flight; a new unit starts as soon as one
/// finishes. With `limit == 1` units run strictly in batch order. Batches
/// are numbered from 1.
async fn bounded(ctx: UnitContext, units: u64, limit: usize) {
    let limit = limit.max(1);
    let mut set = JoinSet::new();
    let mut ids = HashMap::new();
    let mut done = 0u64;
    let progress_every = (units / 10).max(1);

    for batch_id in 1..=units {
        while set.len() >= limit {
            reap_one(&ctx, &mut set, &mut ids).await;
            done += 1;
            log_progress(done, units, progress_every);
        }
        ctx.spawn(&mut set, &mut ids, batch_id);
    }
    while !set.is_empty() {
        reap_one(&ctx, &mut set, &mut ids).await;
        done += 1;
        log_progress(done, units, progress_every);
    }
}

/// Launches one unit per tick regardless of how many are still running,
/// then waits for all of them.
async fn fixed_rate(ctx: UnitContext, plan: RatePlan, files_per_second: f64) {
    info!(
        "fixed-rate: {} units, one every {:.3}s ({files_per_second} files/s)",
        plan.units,
        plan.interval.as_secs_f64()
    );
    let start = Instant::now();
    let mut ticker = interval_at(start, plan.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);
    let mut set = JoinSet::new();
    let mut ids = HashMap::new();
    let log_every = ((10.0 / plan.interval.as_secs_f64()).round() as u64).max(1);

    for batch_id in 1..=plan.units {
        ticker.tick().await;
        ctx.spawn(&mut set, &mut ids, batch_id);
        while let Some(res) = set.try_join_next_with_id() {
            settle(&ctx, &mut ids, res);
        }
        if batch_id % log_every == 0 {
            info!(
                "sent {batch_id}/{} units ({:.1}s elapsed, {} in flight)",
                plan.units,
                start.elapsed().as_secs_f64(),
                set.len()
            );
        }
    }

    info!("all units launched; waiting for {} in flight", set.len());
    while !set.is_empty() {
        reap_one(&ctx, &mut set, &mut ids).await;
    }
}

async fn reap_one(ctx: &UnitContext, set: &mut JoinSet<()>, ids: &mut HashMap<tokio::task::Id, u64>) {
    if let Some(res) = set.join_next_with_id().await {
        settle(ctx, ids, res);
    }
}

fn settle(
    ctx: &UnitContext,
    ids: &mut HashMap<tokio::task::Id, u64>,
    res: Result<(tokio::task::Id, ()), JoinError>,
) {
    match res {
        Ok((id, ())) => {
            ids.remove(&id);
        }
        Err(err) => {
            if let Some(batch_id) = ids.remove(&err.id()) {
                ctx.report_crash(batch_id, err);
            }
        }
    }
}

fn log_progress(done: u64, total: u64, every: u64) {
    if done % every == 0 || done == total {
        info!("completed {done}/{total} units");
    }
}
