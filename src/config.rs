use anyhow::{Context, Result, anyhow, bail};
use regex::RegexSet;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub target: Target,
    #[serde(default)]
    pub dispatch: Dispatch,
    #[serde(default)]
    pub samples: Samples,
    #[serde(default)]
    pub polling: Polling,
    #[serde(default)]
    pub heuristics: Heuristics,
    #[serde(default)]
    pub http: Http,
    #[serde(default)]
    pub subject: Subject,
    #[serde(default)]
    pub sweep: Sweep,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let cfg: Config = toml::from_str(&raw).with_context(|| "parsing TOML")?;
        Ok(cfg)
    }

    /// A stable, normalization-friendly string for hashing.
    pub fn normalized_for_hash(&self) -> String {
        toml::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Target {
    pub base_url: String,
    pub base_url_env: String,
    pub api_key: String,
    pub api_key_env: String,
    pub submit_path: String,
    pub status_path: String,
    pub datasource_ids: Vec<u32>,
    pub file_field: String,
    pub verify_tls: bool,
}
impl Default for Target {
    fn default() -> Self {
        Self {
            base_url: "".into(),
            base_url_env: "DXR_BASE_URL".into(),
            api_key: "".into(),
            api_key_env: "DXR_API_KEY".into(),
            submit_path: "/on-demand-classifiers/{datasource}/jobs".into(),
            status_path: "/on-demand-classifiers/{datasource}/jobs/{id}".into(),
            datasource_ids: vec![100],
            file_field: "files".into(),
            verify_tls: true,
        }
    }
}

/// Mode-specific keys are optional so that a key set for the wrong mode can
/// be reported instead of ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batches: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_per_second: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}
fn default_mode() -> String {
    "sequential".into()
}

fn default_batch_size() -> usize {
    1
}

impl Default for Dispatch {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            batch_size: default_batch_size(),
            batches: Some(10),
            concurrency: None,
            files_per_second: None,
            duration_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Samples {
    pub dir: String,
    pub patterns: Vec<String>,
    pub repeat: usize,
    pub max_file_bytes: u64,
}
impl Default for Samples {
    fn default() -> Self {
        Self {
            dir: "samples/plain_txt".into(),
            patterns: vec!["sample*".into(), "testfile*".into()],
            repeat: 1,
            max_file_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Polling {
    pub interval_ms: u64,
    pub job_timeout_seconds: u64,
    pub success_states: Vec<String>,
    pub failure_states: Vec<String>,
}
impl Default for Polling {
    fn default() -> Self {
        Self {
            interval_ms: 1000,
            job_timeout_seconds: 1200,
            success_states: vec![
                "FINISHED".into(),
                "SUCCEEDED".into(),
                "COMPLETED".into(),
                "DONE".into(),
            ],
            failure_states: vec![
                "FAILED".into(),
                "CANCELLED".into(),
                "CANCELED".into(),
                "ERROR".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Heuristics {
    pub body_error_scan: bool,
    pub patterns: Vec<String>,
}
impl Default for Heuristics {
    fn default() -> Self {
        Self {
            body_error_scan: true,
            patterns: vec![
                "API key is required".into(),
                "Unauthorized".into(),
                "Authentication failed".into(),
                "Invalid API key".into(),
                "Access denied".into(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Http {
    pub request_timeout_seconds: u64,
    pub connect_timeout_seconds: u64,
    pub min_pool_size: usize,
}
impl Default for Http {
    fn default() -> Self {
        Self {
            request_timeout_seconds: 1200,
            connect_timeout_seconds: 30,
            min_pool_size: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Subject {
    pub image: String,
    pub container_name: String,
    pub port: u16,
    pub fleet_env_var: String,
    pub ready_path: String,
    pub startup_wait_seconds: u64,
    pub startup_timeout_seconds: u64,
    pub forward_env: Vec<String>,
    pub env: std::collections::BTreeMap<String, String>,
}
impl Default for Subject {
    fn default() -> Self {
        Self {
            image: "".into(),
            container_name: "odc-sync".into(),
            port: 8844,
            fleet_env_var: "DXR_ODC_DATASOURCE_COUNT".into(),
            ready_path: "".into(),
            startup_wait_seconds: 20,
            startup_timeout_seconds: 120,
            forward_env: vec!["DXR_BASE_URL".into(), "DXR_API_KEY".into()],
            env: Default::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Sweep {
    pub dirs: Vec<String>,
    pub rates: Vec<f64>,
    pub concurrencies: Vec<usize>,
    pub fleet_counts: Vec<u32>,
}
impl Default for Sweep {
    fn default() -> Self {
        Self {
            dirs: vec![],
            rates: vec![1.0, 2.0, 4.0, 8.0, 16.0, 32.0],
            concurrencies: vec![1, 2, 4, 8],
            fleet_counts: vec![1, 2, 4, 8, 16, 32, 64],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Output {
    pub dir: String,
    pub write_csv: bool,
    pub write_tsv: bool,
    pub write_json: bool,
    pub write_outcomes: bool,
    pub dump_effective_config: bool,
    pub print_tsv: bool,
}
impl Default for Output {
    fn default() -> Self {
        Self {
            dir: "results".into(),
            write_csv: true,
            write_tsv: true,
            write_json: true,
            write_outcomes: false,
            dump_effective_config: true,
            print_tsv: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Logging {
    pub level: String,
    pub json: bool,
    pub write_to_file: bool,
    pub file_path: String,
}
impl Default for Logging {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json: false,
            write_to_file: false,
            file_path: "".into(),
        }
    }
}

/// Shortest launch interval a fixed-rate run may ask for.
pub const MIN_LAUNCH_INTERVAL: Duration = Duration::from_millis(1);

/// Scheduling policy of one run. Exactly one is active.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DispatchMode {
    Sequential { batches: usize },
    Parallel { batches: usize, concurrency: usize },
    FixedRate { files_per_second: f64, duration_seconds: u64 },
}

impl DispatchMode {
    pub fn name(&self) -> &'static str {
        match self {
            DispatchMode::Sequential { .. } => "sequential",
            DispatchMode::Parallel { .. } => "parallel",
            DispatchMode::FixedRate { .. } => "fixed_rate",
        }
    }

    pub fn concurrency(&self) -> usize {
        match self {
            DispatchMode::Sequential { .. } => 1,
            DispatchMode::Parallel { concurrency, .. } => *concurrency,
            DispatchMode::FixedRate { .. } => 0,
        }
    }

    pub fn target_rate(&self) -> Option<f64> {
        match self {
            DispatchMode::FixedRate {
                files_per_second, ..
            } => Some(*files_per_second),
            _ => None,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            DispatchMode::Sequential { batches } => {
                if *batches == 0 {
                    bail!("sequential mode needs a positive batch count");
                }
            }
            DispatchMode::Parallel {
                batches,
                concurrency,
            } => {
                if *batches == 0 {
                    bail!("parallel mode needs a positive batch count");
                }
                if *concurrency == 0 {
                    bail!("concurrency must be positive");
                }
            }
            DispatchMode::FixedRate {
                files_per_second,
                duration_seconds,
            } => {
                if !files_per_second.is_finite() || *files_per_second <= 0.0 {
                    bail!("files_per_second must be positive");
                }
                if *duration_seconds == 0 {
                    bail!("duration_seconds must be positive");
                }
            }
        }
        Ok(())
    }

    /// Fixed-rate launches are `batch_size / files_per_second` apart; reject
    /// rates whose interval falls below [`MIN_LAUNCH_INTERVAL`].
    fn check_launch_interval(&self, batch_size: usize) -> Result<()> {
        if let DispatchMode::FixedRate {
            files_per_second, ..
        } = self
        {
            let interval = batch_size as f64 / files_per_second;
            if interval < MIN_LAUNCH_INTERVAL.as_secs_f64() {
                bail!(
                    "files_per_second {files_per_second} with batch_size {batch_size} launches a unit every {:.6}ms; the minimum interval is 1ms",
                    interval * 1000.0
                );
            }
        }
        Ok(())
    }
}

impl TryFrom<&Dispatch> for DispatchMode {
    type Error = anyhow::Error;

    fn try_from(d: &Dispatch) -> Result<Self> {
        let mode = match d.mode.as_str() {
            "sequential" => {
                reject_keys(d, &["concurrency", "files_per_second", "duration_seconds"])?;
                DispatchMode::Sequential {
                    batches: d
                        .batches
                        .ok_or_else(|| anyhow!("sequential mode requires dispatch.batches"))?,
                }
            }
            "parallel" => {
                reject_keys(d, &["files_per_second", "duration_seconds"])?;
                DispatchMode::Parallel {
                    batches: d
                        .batches
                        .ok_or_else(|| anyhow!("parallel mode requires dispatch.batches"))?,
                    concurrency: d
                        .concurrency
                        .ok_or_else(|| anyhow!("parallel mode requires dispatch.concurrency"))?,
                }
            }
            "fixed_rate" => {
                reject_keys(d, &["batches", "concurrency"])?;
                DispatchMode::FixedRate {
                    files_per_second: d.files_per_second.ok_or_else(|| {
                        anyhow!("fixed_rate mode requires dispatch.files_per_second")
                    })?,
                    duration_seconds: d.duration_seconds.ok_or_else(|| {
                        anyhow!("fixed_rate mode requires dispatch.duration_seconds")
                    })?,
                }
            }
            other => bail!("unknown dispatch.mode: {other} (expected sequential, parallel or fixed_rate)"),
        };
        mode.validate()?;
        Ok(mode)
    }
}

fn reject_keys(d: &Dispatch, keys: &[&str]) -> Result<()> {
    for key in keys {
        let set = match *key {
            "batches" => d.batches.is_some(),
            "concurrency" => d.concurrency.is_some(),
            "files_per_second" => d.files_per_second.is_some(),
            "duration_seconds" => d.duration_seconds.is_some(),
            _ => false,
        };
        if set {
            bail!(
                "dispatch.{key} does not apply to {} mode; scheduling policies are mutually exclusive",
                d.mode
            );
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct TargetSettings {
    pub base_url: String,
    pub api_key: Option<String>,
    pub submit_path: String,
    pub status_path: String,
    pub datasource_ids: Vec<u32>,
    pub file_field: String,
    pub verify_tls: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub min_pool_size: usize,
}

#[derive(Debug, Clone)]
pub struct PollSettings {
    pub interval: Duration,
    pub job_timeout: Duration,
    pub success_states: Vec<String>,
    pub failure_states: Vec<String>,
}

impl PollSettings {
    pub fn max_attempts(&self) -> u32 {
        let interval = self.interval.as_millis().max(1);
        let n = self.job_timeout.as_millis() / interval;
        n.clamp(1, u32::MAX as u128) as u32
    }

    pub fn is_success(&self, state: &str) -> bool {
        self.success_states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(state))
    }

    pub fn is_failure(&self, state: &str) -> bool {
        self.failure_states
            .iter()
            .any(|s| s.eq_ignore_ascii_case(state))
    }
}

/// Validated, immutable settings for one run. Sweeps clone this and
/// override only the fields that vary per stage.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub label: String,
    pub target: TargetSettings,
    pub mode: DispatchMode,
    pub batch_size: usize,
    pub samples_dir: PathBuf,
    pub sample_patterns: Vec<String>,
    pub repeat: usize,
    pub max_file_bytes: u64,
    pub poll: PollSettings,
    pub body_heuristic: Option<RegexSet>,
    pub fleet_count: Option<u32>,
}

impl RunConfig {
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mode = DispatchMode::try_from(&cfg.dispatch)?;

        if cfg.dispatch.batch_size == 0 {
            bail!("dispatch.batch_size must be at least 1");
        }
        mode.check_launch_interval(cfg.dispatch.batch_size)?;
        if cfg.samples.repeat == 0 {
            bail!("samples.repeat must be at least 1");
        }
        if cfg.polling.interval_ms == 0 {
            bail!("polling.interval_ms must be positive");
        }
        if cfg.polling.job_timeout_seconds == 0 {
            bail!("polling.job_timeout_seconds must be positive");
        }
        if cfg.polling.success_states.is_empty() {
            bail!("polling.success_states must not be empty");
        }
        if cfg.target.datasource_ids.is_empty()
            && (cfg.target.submit_path.contains("{datasource}")
                || cfg.target.status_path.contains("{datasource}"))
        {
            bail!("target paths use {{datasource}} but target.datasource_ids is empty");
        }
        if !cfg.target.status_path.contains("{id}") {
            bail!("target.status_path must contain an {{id}} placeholder");
        }

        let base_url = resolve_base_url(&cfg.target)?;
        let api_key = resolve_api_key(&cfg.target);

        let body_heuristic = if cfg.heuristics.body_error_scan && !cfg.heuristics.patterns.is_empty()
        {
            let escaped: Vec<String> = cfg
                .heuristics
                .patterns
                .iter()
                .map(|p| format!("(?i){}", regex::escape(p)))
                .collect();
            Some(RegexSet::new(&escaped).with_context(|| "compiling heuristics.patterns")?)
        } else {
            None
        };

        Ok(Self {
            label: cfg.samples.dir.clone(),
            target: TargetSettings {
                base_url,
                api_key,
                submit_path: cfg.target.submit_path.clone(),
                status_path: cfg.target.status_path.clone(),
                datasource_ids: cfg.target.datasource_ids.clone(),
                file_field: cfg.target.file_field.clone(),
                verify_tls: cfg.target.verify_tls,
                request_timeout: Duration::from_secs(cfg.http.request_timeout_seconds),
                connect_timeout: Duration::from_secs(cfg.http.connect_timeout_seconds),
                min_pool_size: cfg.http.min_pool_size,
            },
            mode,
            batch_size: cfg.dispatch.batch_size,
            samples_dir: PathBuf::from(&cfg.samples.dir),
            sample_patterns: cfg.samples.patterns.clone(),
            repeat: cfg.samples.repeat,
            max_file_bytes: cfg.samples.max_file_bytes,
            poll: PollSettings {
                interval: Duration::from_millis(cfg.polling.interval_ms),
                job_timeout: Duration::from_secs(cfg.polling.job_timeout_seconds),
                success_states: cfg.polling.success_states.clone(),
                failure_states: cfg.polling.failure_states.clone(),
            },
            body_heuristic,
            fleet_count: None,
        })
    }

    /// Replaces the scheduling policy, keeping the one-policy invariant.
    pub fn with_mode(&self, mode: DispatchMode) -> Result<Self> {
        mode.validate()?;
        mode.check_launch_interval(self.batch_size)?;
        let mut next = self.clone();
        next.mode = mode;
        Ok(next)
    }

    /// Idle connections to keep per host so that the pool never becomes the
    /// bottleneck being measured.
    pub fn connection_budget(&self) -> usize {
        let wanted = match &self.mode {
            DispatchMode::Sequential { .. } => 1,
            DispatchMode::Parallel { concurrency, .. } => *concurrency,
            DispatchMode::FixedRate {
                files_per_second, ..
            } => {
                let units_per_second = files_per_second / self.batch_size as f64;
                let in_flight = units_per_second * self.poll.job_timeout.as_secs_f64().min(60.0);
                in_flight.ceil().max(1.0) as usize
            }
        };
        wanted.max(self.target.min_pool_size)
    }
}

fn resolve_base_url(target: &Target) -> Result<String> {
    let raw = if !target.base_url.trim().is_empty() {
        target.base_url.trim().to_string()
    } else if !target.base_url_env.is_empty() {
        std::env::var(&target.base_url_env).unwrap_or_default()
    } else {
        String::new()
    };
    let raw = raw.trim().trim_end_matches('/').to_string();
    if raw.is_empty() {
        bail!(
            "no target base URL: set target.base_url, --server-url, or ${}",
            target.base_url_env
        );
    }
    if !(raw.starts_with("http://") || raw.starts_with("https://")) {
        bail!("target base URL must start with http:// or https://: {raw}");
    }
    Ok(raw)
}

fn resolve_api_key(target: &Target) -> Option<String> {
    if !target.api_key.is_empty() {
        return Some(target.api_key.clone());
    }
    if target.api_key_env.is_empty() {
        return None;
    }
    std::env::var(&target.api_key_env)
        .ok()
        .filter(|v| !v.trim().is_empty())
}
