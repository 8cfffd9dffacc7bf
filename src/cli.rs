use crate::{
    api::{JobApi, http::HttpJobApi},
    config::{Config, RunConfig},
    metrics::{RunSummary, SweepSummary, group_errors},
    outcome::JobOutcome,
    report::{self, Exporter},
    samples::SampleSet,
    subject::{DockerSubject, Subject},
    sweep::{ApiFactory, StageReport, SweepAxis, SweepOrchestrator, plan_stages, run_stage},
    util::{ensure_dir, now_rfc3339, parse_list},
};
use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

pub const EXIT_OK: i32 = 0;
pub const EXIT_ERRORS: i32 = 1;
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "speed-check")]
#[command(about = "Load generator and latency harness for asynchronous job-based classification APIs")]
pub struct Args {
    #[command(subcommand)]
    pub cmd: Command,

    /// Path to config TOML. If omitted, uses ./speed-check.toml if present.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Override log level (trace/debug/info/warn/error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// One run with the configured (or overridden) scheduling policy.
    Run {
        #[command(flatten)]
        mode: ModeArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// One stage per sample directory.
    SweepDirs {
        /// Comma-separated directories; defaults to sweep.dirs.
        #[arg(long)]
        dirs: Option<String>,
        #[command(flatten)]
        mode: ModeArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// One stage per fixed rate, or per concurrency level.
    SweepRates {
        /// Comma-separated files/second; defaults to sweep.rates.
        #[arg(long, conflicts_with = "concurrencies")]
        rates: Option<String>,
        /// Seconds per rate stage; defaults to dispatch.duration_seconds.
        #[arg(long, conflicts_with = "concurrencies")]
        duration: Option<u64>,
        /// Comma-separated concurrency levels (bounded-parallel stages).
        #[arg(long)]
        concurrencies: Option<String>,
        /// Batches per concurrency stage; defaults to dispatch.batches.
        #[arg(long, requires = "concurrencies")]
        batches: Option<usize>,
        #[command(flatten)]
        target: TargetArgs,
    },
    /// One stage per fleet size of a managed subject.
    SweepFleet {
        /// Comma-separated fleet counts; defaults to sweep.fleet_counts.
        #[arg(long)]
        counts: Option<String>,
        /// Container image of the subject; defaults to subject.image.
        #[arg(long)]
        image: Option<String>,
        #[command(flatten)]
        mode: ModeArgs,
        #[command(flatten)]
        target: TargetArgs,
    },
}

/// Scheduling policy overrides. At most one policy may be named.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct ModeArgs {
    /// Sequential mode with N batches.
    #[arg(long, value_name = "N", conflicts_with_all = ["concurrency", "rate", "duration"])]
    pub sequential: Option<usize>,
    /// Bounded-parallel mode with at most K units in flight.
    #[arg(long, value_name = "K", conflicts_with_all = ["rate", "duration"])]
    pub concurrency: Option<usize>,
    /// Number of batches for sequential or bounded-parallel mode.
    #[arg(long, value_name = "N", conflicts_with_all = ["sequential", "rate", "duration"])]
    pub batches: Option<usize>,
    /// Fixed-rate mode at FPS files per second.
    #[arg(long, value_name = "FPS", requires = "duration")]
    pub rate: Option<f64>,
    /// Fixed-rate duration in seconds.
    #[arg(long, value_name = "S", requires = "rate")]
    pub duration: Option<u64>,
}

#[derive(clap::Args, Debug, Default, Clone)]
pub struct TargetArgs {
    #[arg(long)]
    pub samples_dir: Option<String>,
    #[arg(long)]
    pub batch_size: Option<usize>,
    #[arg(long)]
    pub server_url: Option<String>,
    #[arg(long)]
    pub api_key: Option<String>,
}

impl ModeArgs {
    /// Rewrites `[dispatch]` so that exactly the named policy is configured.
    pub fn apply(&self, cfg: &mut Config) {
        let d = &mut cfg.dispatch;
        if let Some(n) = self.sequential {
            d.mode = "sequential".into();
            d.batches = Some(n);
            d.concurrency = None;
            d.files_per_second = None;
            d.duration_seconds = None;
        } else if let Some(k) = self.concurrency {
            d.mode = "parallel".into();
            d.batches = self.batches.or(d.batches);
            d.concurrency = Some(k);
            d.files_per_second = None;
            d.duration_seconds = None;
        } else if let Some(fps) = self.rate {
            d.mode = "fixed_rate".into();
            d.files_per_second = Some(fps);
            d.duration_seconds = self.duration.or(d.duration_seconds);
            d.batches = None;
            d.concurrency = None;
        } else if let Some(n) = self.batches {
            d.batches = Some(n);
        }
    }
}

impl TargetArgs {
    pub fn apply(&self, cfg: &mut Config) {
        if let Some(dir) = &self.samples_dir {
            cfg.samples.dir = dir.clone();
        }
        if let Some(b) = self.batch_size {
            cfg.dispatch.batch_size = b;
        }
        if let Some(url) = &self.server_url {
            cfg.target.base_url = url.clone();
        }
        if let Some(key) = &self.api_key {
            cfg.target.api_key = key.clone();
        }
    }
}

/// Runs the command and returns the process exit code.
pub fn dispatch(args: Args) -> Result<i32> {
    let cfg_path = resolve_config_path(args.config.as_deref())?;
    let mut cfg = match &cfg_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let log_path = resolve_log_path(&cfg);
    let _guard = init_logging(&args, &cfg, log_path.as_deref())?;
    match &cfg_path {
        Some(path) => info!("config: {}", path.display()),
        None => info!("config: built-in defaults"),
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .with_context(|| "building tokio runtime")?;

    match &args.cmd {
        Command::Run { mode, target } => {
            mode.apply(&mut cfg);
            target.apply(&mut cfg);
            runtime.block_on(run(&cfg))
        }
        Command::SweepDirs { dirs, mode, target } => {
            mode.apply(&mut cfg);
            target.apply(&mut cfg);
            let dirs = match dirs {
                Some(raw) => parse_list::<String>(raw)?,
                None => cfg.sweep.dirs.clone(),
            };
            let axis = SweepAxis::Dirs(dirs.into_iter().map(PathBuf::from).collect());
            runtime.block_on(sweep(&cfg, axis, None))
        }
        Command::SweepRates {
            rates,
            duration,
            concurrencies,
            batches,
            target,
        } => {
            target.apply(&mut cfg);
            let axis = match concurrencies {
                Some(raw) => SweepAxis::Concurrency {
                    levels: parse_list(raw)?,
                    batches: batches
                        .or(cfg.dispatch.batches)
                        .ok_or_else(|| anyhow!("concurrency sweep needs --batches"))?,
                },
                None => SweepAxis::Rates {
                    rates: match rates {
                        Some(raw) => parse_list(raw)?,
                        None => cfg.sweep.rates.clone(),
                    },
                    duration_seconds: duration
                        .or(cfg.dispatch.duration_seconds)
                        .ok_or_else(|| anyhow!("rate sweep needs --duration"))?,
                },
            };
            runtime.block_on(sweep(&cfg, axis, None))
        }
        Command::SweepFleet {
            counts,
            image,
            mode,
            target,
        } => {
            mode.apply(&mut cfg);
            target.apply(&mut cfg);
            if let Some(image) = image {
                cfg.subject.image = image.clone();
            }
            let counts = match counts {
                Some(raw) => parse_list(raw)?,
                None => cfg.sweep.fleet_counts.clone(),
            };
            runtime.block_on(sweep_fleet(&cfg, counts))
        }
    }
}

fn resolve_config_path(user: Option<&Path>) -> Result<Option<PathBuf>> {
    if let Some(p) = user {
        if !p.exists() {
            bail!("config file not found: {}", p.display());
        }
        return Ok(Some(p.to_path_buf()));
    }
    let default = PathBuf::from("speed-check.toml");
    Ok(default.exists().then_some(default))
}

fn init_logging(args: &Args, cfg: &Config, file_path: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(cfg.logging.level.as_str());

    let filter = if args.log_level.is_some() {
        EnvFilter::new(level)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
    };

    let stdout_layer = if cfg.logging.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_target(true)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer().with_target(true).boxed()
    };

    let (file_layer, guard) = if let Some(path) = file_path {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        ensure_dir(parent)?;
        let file = std::fs::File::create(path)
            .with_context(|| format!("create log file: {}", path.display()))?;
        let (non_blocking, guard) = tracing_appender::non_blocking(file);
        let layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_target(true)
            .boxed();
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| anyhow!("failed to init logging: {e}"))?;

    Ok(guard)
}

fn resolve_log_path(cfg: &Config) -> Option<PathBuf> {
    if !cfg.logging.write_to_file {
        return None;
    }
    if !cfg.logging.file_path.is_empty() {
        return Some(PathBuf::from(&cfg.logging.file_path));
    }
    Some(PathBuf::from(&cfg.output.dir).join("speed-check.log"))
}

/// Resolves on Ctrl-C. If the handler cannot be installed the run is
/// simply not interruptible.
async fn interrupt_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("cannot listen for Ctrl-C: {err}");
        std::future::pending::<()>().await;
    }
    warn!("interrupt received; finishing with partial results");
}

fn http_factory() -> ApiFactory {
    Arc::new(|run: &RunConfig| {
        let api: Arc<dyn JobApi> = Arc::new(HttpJobApi::new(run)?);
        Ok(api)
    })
}

pub fn exit_code(interrupted: bool, error_rate: f64) -> i32 {
    if interrupted {
        EXIT_INTERRUPTED
    } else if error_rate > 0.0 {
        EXIT_ERRORS
    } else {
        EXIT_OK
    }
}

async fn run(cfg: &Config) -> Result<i32> {
    let run = RunConfig::from_config(cfg)?;
    let samples = Arc::new(SampleSet::load(
        &run.samples_dir,
        &run.sample_patterns,
        run.repeat,
        run.max_file_bytes,
    )?);
    let api = (http_factory())(&run)?;

    let started_at = now_rfc3339();
    let stage = run_stage(api, run, samples, interrupt_signal()).await;

    print_stage(&stage);
    if cfg.output.print_tsv {
        println!("{}", report::render_tsv(&[&stage.summary])?);
    }

    let exporter = Exporter::create(cfg, &report::run_id(cfg, &started_at))?;
    exporter.write(&[&stage.summary], &stage.summary, &stage.outcomes)?;

    Ok(exit_code(stage.interrupted(), stage.summary.error_rate))
}

#[derive(Serialize)]
struct SweepView<'a> {
    #[serde(flatten)]
    sweep: &'a SweepSummary,
    partial: Option<&'a RunSummary>,
    interrupted: bool,
    aborted: Option<&'a str>,
}

#[derive(Serialize)]
struct StageOutcomes<'a> {
    label: &'a str,
    outcomes: &'a [JobOutcome],
}

async fn sweep(cfg: &Config, axis: SweepAxis, subject: Option<Box<dyn Subject>>) -> Result<i32> {
    let base = RunConfig::from_config(cfg)?;
    let stages = plan_stages(&base, &axis)?;
    info!("sweep planned: {} stages", stages.len());

    let mut orchestrator = SweepOrchestrator::new(http_factory());
    if let Some(subject) = subject {
        orchestrator = orchestrator.with_subject(subject);
    }

    let started_at = now_rfc3339();
    let result = orchestrator.run(stages, interrupt_signal()).await;

    for stage in &result.reports {
        print_stage(stage);
    }
    if let Some(partial) = &result.partial {
        print_stage(partial);
    }
    if !result.summary.is_empty() {
        println!("{}", report::render_sweep_table(&result.summary));
    }
    if let Some(reason) = &result.aborted {
        error!("sweep aborted: {reason}");
    }

    let mut rows: Vec<&RunSummary> = result.summary.stages().iter().collect();
    if let Some(partial) = &result.partial {
        rows.push(&partial.summary);
    }
    if cfg.output.print_tsv && !rows.is_empty() {
        println!("{}", report::render_tsv(&rows)?);
    }

    let view = SweepView {
        sweep: &result.summary,
        partial: result.partial.as_ref().map(|p| &p.summary),
        interrupted: result.interrupted,
        aborted: result.aborted.as_deref(),
    };
    let outcomes: Vec<StageOutcomes> = result
        .reports
        .iter()
        .chain(result.partial.as_ref())
        .map(|r| StageOutcomes {
            label: &r.summary.meta.label,
            outcomes: &r.outcomes,
        })
        .collect();
    let exporter = Exporter::create(cfg, &report::run_id(cfg, &started_at))?;
    exporter.write(&rows, &view, &outcomes)?;

    if result.aborted.is_some() && !result.interrupted {
        return Ok(EXIT_ERRORS);
    }
    Ok(exit_code(result.interrupted, result.summary.overall_error_rate()))
}

async fn sweep_fleet(cfg: &Config, counts: Vec<u32>) -> Result<i32> {
    let base = RunConfig::from_config(cfg)?;
    let subject = DockerSubject::new(&cfg.subject, &base.target.base_url)?;
    sweep(cfg, SweepAxis::Fleet(counts), Some(Box::new(subject))).await
}

fn print_stage(stage: &StageReport) {
    println!("{}", report::render_summary(&stage.summary));
    let errors = report::render_errors(&group_errors(&stage.outcomes));
    if !errors.is_empty() {
        println!("{errors}");
    }
}
