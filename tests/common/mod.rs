#![allow(dead_code)]

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use speed_check::api::{FilePart, HttpReply, JobApi, Route, envelope};
use speed_check::config::{Config, DispatchMode, RunConfig};
use speed_check::samples::{Sample, SampleSet};
use speed_check::submit::{SubmitVerdict, classify_submission};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const TERMINAL_STATES: &[&str] = &[
    "FINISHED", "SUCCEEDED", "COMPLETED", "DONE", "FAILED", "CANCELLED", "CANCELED", "ERROR",
];

type SubmitFn = dyn Fn(usize) -> Result<HttpReply> + Send + Sync;
type StatusFn = dyn Fn(&str, u32) -> Result<HttpReply> + Send + Sync;

/// In-memory `JobApi` whose replies are decided by closures.
///
/// `on_submit` gets the 0-based submit call index. `on_status` gets the job
/// id and the 1-based poll number for that job.
///
/// A unit counts as in flight from the moment its submit arrives until the
/// submit is rejected or a poll reply reports a terminal state.
pub struct ScriptedApi {
    on_submit: Box<SubmitFn>,
    on_status: Box<StatusFn>,
    submit_delay: Duration,
    submit_calls: AtomicUsize,
    units_in_flight: AtomicUsize,
    max_units_in_flight: AtomicUsize,
    polls: Mutex<HashMap<String, u32>>,
    uploads: Mutex<Vec<(Route, Vec<String>)>>,
    status_routes: Mutex<Vec<(Route, String)>>,
}

impl ScriptedApi {
    pub fn new(
        on_submit: impl Fn(usize) -> Result<HttpReply> + Send + Sync + 'static,
        on_status: impl Fn(&str, u32) -> Result<HttpReply> + Send + Sync + 'static,
    ) -> Self {
        Self {
            on_submit: Box::new(on_submit),
            on_status: Box::new(on_status),
            submit_delay: Duration::ZERO,
            submit_calls: AtomicUsize::new(0),
            units_in_flight: AtomicUsize::new(0),
            max_units_in_flight: AtomicUsize::new(0),
            polls: Mutex::new(HashMap::new()),
            uploads: Mutex::new(Vec::new()),
            status_routes: Mutex::new(Vec::new()),
        }
    }

    /// Accepts every batch as `job-<n>` and reports `state` on every poll.
    pub fn always(state: &'static str) -> Self {
        Self::new(
            |n| Ok(accepted(&format!("job-{n}"))),
            move |_, _| Ok(status(state)),
        )
    }

    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = delay;
        self
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    /// Most submit-then-poll units that were ever non-terminal at once.
    pub fn max_units_in_flight(&self) -> usize {
        self.max_units_in_flight.load(Ordering::SeqCst)
    }

    fn unit_finished(&self) {
        self.units_in_flight.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn polls_for(&self, job_id: &str) -> u32 {
        self.polls
            .lock()
            .unwrap()
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn uploads(&self) -> Vec<(Route, Vec<String>)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn status_routes(&self) -> Vec<(Route, String)> {
        self.status_routes.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobApi for ScriptedApi {
    async fn submit(&self, route: &Route, files: Vec<FilePart>) -> Result<HttpReply> {
        let n = self.submit_calls.fetch_add(1, Ordering::SeqCst);
        self.uploads
            .lock()
            .unwrap()
            .push((*route, files.iter().map(|f| f.file_name.clone()).collect()));

        let now = self.units_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_units_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.submit_delay.is_zero() {
            tokio::time::sleep(self.submit_delay).await;
        }

        let reply = (self.on_submit)(n);
        let accepted = matches!(
            reply.as_ref().map(|r| classify_submission(r, None)),
            Ok(SubmitVerdict::Accepted { .. })
        );
        if !accepted {
            self.unit_finished();
        }
        reply
    }

    async fn job_status(&self, route: &Route, job_id: &str) -> Result<HttpReply> {
        self.status_routes
            .lock()
            .unwrap()
            .push((*route, job_id.to_string()));
        let poll = {
            let mut polls = self.polls.lock().unwrap();
            let count = polls.entry(job_id.to_string()).or_insert(0);
            *count += 1;
            *count
        };
        let reply = (self.on_status)(job_id, poll);
        if let Ok(r) = &reply {
            let state = envelope::parse(&r.body).and_then(|doc| envelope::job_state(&doc));
            if state.is_some_and(|s| TERMINAL_STATES.iter().any(|t| t.eq_ignore_ascii_case(&s))) {
                self.unit_finished();
            }
        }
        reply
    }
}

pub fn accepted(job_id: &str) -> HttpReply {
    HttpReply::new(202, format!(r#"{{"id":"{job_id}","state":"SUBMITTED"}}"#))
}

pub fn status(state: &str) -> HttpReply {
    HttpReply::new(200, format!(r#"{{"state":"{state}"}}"#))
}

pub fn transport_error() -> Result<HttpReply> {
    Err(anyhow!("connection reset by peer"))
}

/// Config pointed at a fake server with a 1s poll interval.
pub fn base_config() -> Config {
    let mut cfg = Config::default();
    cfg.target.base_url = "http://127.0.0.1:8844".into();
    cfg.target.api_key = "test-key".into();
    cfg.polling.interval_ms = 1000;
    cfg.polling.job_timeout_seconds = 60;
    cfg
}

pub fn run_config(mode: DispatchMode, batch_size: usize) -> RunConfig {
    let mut cfg = base_config();
    cfg.dispatch.batch_size = batch_size;
    RunConfig::from_config(&cfg)
        .and_then(|run| run.with_mode(mode))
        .expect("valid run config")
}

pub fn sample_set(n: usize) -> Arc<SampleSet> {
    let samples = (0..n)
        .map(|i| Sample::new(format!("sample{i}.txt"), format!("payload {i}").into_bytes()))
        .collect();
    Arc::new(SampleSet::from_samples(samples, 1).unwrap())
}
