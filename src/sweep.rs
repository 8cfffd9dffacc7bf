use crate::{
    api::JobApi,
    config::{DispatchMode, RunConfig},
    dispatch::Dispatcher,
    metrics::{RunSummary, StageMeta, SweepSummary},
    outcome::JobOutcome,
    samples::{self, SampleSet},
    subject::Subject,
};
use anyhow::{Result, bail};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Builds the transport for one stage. Stages may differ in connection
/// budget, so each gets its own client.
pub type ApiFactory = Arc<dyn Fn(&RunConfig) -> Result<Arc<dyn JobApi>> + Send + Sync>;

/// The dimension a sweep walks along.
#[derive(Debug, Clone)]
pub enum SweepAxis {
    Dirs(Vec<PathBuf>),
    Rates { rates: Vec<f64>, duration_seconds: u64 },
    Concurrency { levels: Vec<usize>, batches: usize },
    Fleet(Vec<u32>),
}

/// One planned run. Sample bytes are not part of the plan; they are read
/// when the stage starts.
#[derive(Debug, Clone)]
pub struct Stage {
    pub run: RunConfig,
}

/// One finished run: its summary and the raw outcomes behind it.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub summary: RunSummary,
    pub outcomes: Vec<JobOutcome>,
}

impl StageReport {
    pub fn interrupted(&self) -> bool {
        self.summary.meta.interrupted
    }
}

#[derive(Debug, Clone, Default)]
pub struct SweepResult {
    pub summary: SweepSummary,
    pub reports: Vec<StageReport>,
    /// Stage cut short by an interrupt; excluded from `summary`.
    pub partial: Option<StageReport>,
    pub interrupted: bool,
    pub aborted: Option<String>,
}

/// Expands `base` into one validated stage per axis value. Every sample
/// directory is scanned here so a bad stage fails before anything is sent;
/// file contents are left on disk until the stage runs.
pub fn plan_stages(base: &RunConfig, axis: &SweepAxis) -> Result<Vec<Stage>> {
    let check = |run: &RunConfig| -> Result<()> {
        samples::scan(&run.samples_dir, &run.sample_patterns, run.max_file_bytes)?;
        Ok(())
    };

    let mut stages = Vec::new();
    match axis {
        SweepAxis::Dirs(dirs) => {
            if dirs.is_empty() {
                bail!("directory sweep needs at least one directory");
            }
            for dir in dirs {
                let mut run = base.clone();
                run.samples_dir = dir.clone();
                run.label = dir.display().to_string();
                check(&run)?;
                stages.push(Stage { run });
            }
        }
        SweepAxis::Rates {
            rates,
            duration_seconds,
        } => {
            if rates.is_empty() {
                bail!("rate sweep needs at least one rate");
            }
            check(base)?;
            for &rate in rates {
                let mut run = base.with_mode(DispatchMode::FixedRate {
                    files_per_second: rate,
                    duration_seconds: *duration_seconds,
                })?;
                run.label = format!("{rate} files/s");
                stages.push(Stage { run });
            }
        }
        SweepAxis::Concurrency { levels, batches } => {
            if levels.is_empty() {
                bail!("concurrency sweep needs at least one level");
            }
            check(base)?;
            for &level in levels {
                let mut run = base.with_mode(DispatchMode::Parallel {
                    batches: *batches,
                    concurrency: level,
                })?;
                run.label = format!("concurrency {level}");
                stages.push(Stage { run });
            }
        }
        SweepAxis::Fleet(counts) => {
            if counts.is_empty() {
                bail!("fleet sweep needs at least one count");
            }
            if counts.contains(&0) {
                bail!("fleet counts must be positive");
            }
            check(base)?;
            for &count in counts {
                let mut run = base.clone();
                run.fleet_count = Some(count);
                run.label = format!("fleet {count}");
                stages.push(Stage { run });
            }
        }
    }
    Ok(stages)
}

/// Sample set for `run`, reusing the cached one when the directory is
/// unchanged. The previous set is dropped before a new one is read.
fn stage_samples(
    cache: &mut Option<(PathBuf, Arc<SampleSet>)>,
    run: &RunConfig,
) -> Result<Arc<SampleSet>> {
    if let Some((dir, set)) = cache.as_ref() {
        if *dir == run.samples_dir {
            return Ok(set.clone());
        }
    }
    *cache = None;
    let set = Arc::new(SampleSet::load(
        &run.samples_dir,
        &run.sample_patterns,
        run.repeat,
        run.max_file_bytes,
    )?);
    *cache = Some((run.samples_dir.clone(), set.clone()));
    Ok(set)
}

/// Runs one stage to completion (or interruption) and summarizes it.
pub async fn run_stage<F>(
    api: Arc<dyn JobApi>,
    run: RunConfig,
    samples: Arc<SampleSet>,
    interrupt: F,
) -> StageReport
where
    F: Future<Output = ()>,
{
    let run = Arc::new(run);
    let dispatcher = Dispatcher::new(api, run.clone(), samples);
    let result = dispatcher.execute(interrupt).await;

    let mut meta = StageMeta::for_run(&run);
    meta.planned_units = result.planned_units;
    meta.interrupted = result.interrupted;
    meta.started_at = result.started_at.clone();

    let summary = RunSummary::from_outcomes(meta, &result.outcomes);
    StageReport {
        summary,
        outcomes: result.outcomes,
    }
}

pub struct SweepOrchestrator {
    api_factory: ApiFactory,
    subject: Option<Box<dyn Subject>>,
}

impl SweepOrchestrator {
    pub fn new(api_factory: ApiFactory) -> Self {
        Self {
            api_factory,
            subject: None,
        }
    }

    pub fn with_subject(mut self, subject: Box<dyn Subject>) -> Self {
        self.subject = Some(subject);
        self
    }

    /// Runs the stages in order. An interrupt stops the sweep; the stage in
    /// progress is reported as `partial` and kept out of the totals.
    pub async fn run<F>(&mut self, stages: Vec<Stage>, interrupt: F) -> SweepResult
    where
        F: Future<Output = ()>,
    {
        let mut interrupt = Box::pin(interrupt);
        let mut result = SweepResult::default();
        let mut loaded = None;
        let total = stages.len();

        for (i, stage) in stages.into_iter().enumerate() {
            info!("stage {}/{}: {}", i + 1, total, stage.run.label);

            let samples = match stage_samples(&mut loaded, &stage.run) {
                Ok(samples) => samples,
                Err(err) => {
                    error!("stage {}: {err:#}", stage.run.label);
                    result.aborted = Some(format!("{}: {err:#}", stage.run.label));
                    break;
                }
            };

            let api = match (self.api_factory)(&stage.run) {
                Ok(api) => api,
                Err(err) => {
                    error!("stage {}: {err:#}", stage.run.label);
                    result.aborted = Some(format!("{}: {err:#}", stage.run.label));
                    break;
                }
            };

            if let Some(subject) = self.subject.as_mut() {
                let fleet = stage.run.fleet_count.unwrap_or(1);
                let started = tokio::select! {
                    res = subject.start(fleet) => Some(res),
                    _ = &mut interrupt => None,
                };
                match started {
                    Some(Ok(())) => {}
                    Some(Err(err)) => {
                        error!("subject failed to start for {}: {err:#}", stage.run.label);
                        result.aborted = Some(format!("{}: {err:#}", stage.run.label));
                        break;
                    }
                    None => {
                        warn!("interrupted while starting subject");
                        subject.stop().await;
                        result.interrupted = true;
                        break;
                    }
                }
            }

            let report = run_stage(api, stage.run, samples, &mut interrupt).await;

            if let Some(subject) = self.subject.as_mut() {
                subject.stop().await;
            }

            let s = &report.summary;
            info!(
                "stage {} done: {}/{} succeeded, error rate {:.2}%, {:.2} files/s",
                s.meta.label, s.successful_jobs, s.total_jobs, s.error_rate, s.files_per_second
            );

            if report.interrupted() {
                result.partial = Some(report);
                result.interrupted = true;
                break;
            }
            result.summary.push(report.summary.clone());
            result.reports.push(report);
        }
        result
    }
}
