use crate::{
    api::{FilePart, HttpReply, JobApi, Route, envelope},
    config::RunConfig,
    outcome::{JobOutcome, OutcomeState, RunClock},
    samples::Sample,
    util::truncate_chars,
};
use regex::RegexSet;
use std::path::Path;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, warn};

const BODY_EXCERPT_CHARS: usize = 200;

/// Immediate classification of a submission reply.
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitVerdict {
    Accepted { job_id: String },
    Rejected { state: OutcomeState, detail: String },
}

pub struct BatchSubmitter {
    api: Arc<dyn JobApi>,
    run: Arc<RunConfig>,
    clock: RunClock,
}

impl BatchSubmitter {
    pub fn new(api: Arc<dyn JobApi>, run: Arc<RunConfig>, clock: RunClock) -> Self {
        Self { api, run, clock }
    }

    /// Batch n goes to `datasource_ids[(n - 1) % len]`.
    pub fn route_for(&self, batch_id: u64) -> Route {
        let ids = &self.run.target.datasource_ids;
        if ids.is_empty() {
            return Route::default();
        }
        let slot = batch_id.saturating_sub(1) % ids.len() as u64;
        Route {
            datasource: Some(ids[slot as usize]),
        }
    }

    /// Sends one batch. The returned outcome is either terminal (rejected)
    /// or in `Submitted` state with a job id and must be polled.
    pub async fn submit(&self, batch_id: u64, samples: &[Sample]) -> JobOutcome {
        let parts = build_parts(batch_id, samples);
        let names = parts.iter().map(|p| p.file_name.clone()).collect();
        let bytes = samples.iter().map(Sample::size).sum();
        let route = self.route_for(batch_id);

        let mut outcome = JobOutcome::new(batch_id, names, bytes);
        outcome.datasource = route.datasource;

        let started = Instant::now();
        let result = self.api.submit(&route, parts).await;
        let finished = Instant::now();

        outcome.submit_started_ms = self.clock.since_ms(started);
        outcome.submit_finished_ms = self.clock.since_ms(finished);
        outcome.submit_latency_ms = outcome.submit_finished_ms - outcome.submit_started_ms;

        let reply = match result {
            Ok(reply) => reply,
            Err(err) => {
                warn!("batch {batch_id} submission transport error: {err:#}");
                outcome.fail_submission(OutcomeState::SubmitFailed, format!("transport: {err:#}"));
                return outcome;
            }
        };
        outcome.http_status = Some(reply.status);

        match classify_submission(&reply, self.run.body_heuristic.as_ref()) {
            SubmitVerdict::Accepted { job_id } => {
                debug!(
                    "batch {batch_id} accepted as job {job_id} in {:.0}ms",
                    outcome.submit_latency_ms
                );
                outcome.job_id = Some(job_id);
            }
            SubmitVerdict::Rejected { state, detail } => {
                warn!("batch {batch_id} {state}: {detail}");
                outcome.fail_submission(state, detail);
            }
        }
        outcome
    }
}

/// File parts for one batch. Names embed the batch id and the per-file index
/// so concurrent batches never upload two parts with the same name.
pub fn build_parts(batch_id: u64, samples: &[Sample]) -> Vec<FilePart> {
    samples
        .iter()
        .enumerate()
        .map(|(i, s)| FilePart {
            file_name: disambiguate(&s.name, batch_id, i),
            content_type: s.content_type(),
            content: s.content.clone(),
        })
        .collect()
}

pub fn disambiguate(name: &str, batch_id: u64, index: usize) -> String {
    let path = Path::new(name);
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string());
    match path.extension() {
        Some(ext) => format!("{stem}_b{batch_id:06}_{index}.{}", ext.to_string_lossy()),
        None => format!("{stem}_b{batch_id:06}_{index}"),
    }
}

pub fn classify_submission(reply: &HttpReply, heuristic: Option<&RegexSet>) -> SubmitVerdict {
    if !reply.is_success() {
        return SubmitVerdict::Rejected {
            state: OutcomeState::SubmitFailed,
            detail: format!(
                "HTTP {}: {}",
                reply.status,
                truncate_chars(&reply.body, BODY_EXCERPT_CHARS)
            ),
        };
    }

    let doc = envelope::parse(&reply.body);
    if let Some(doc) = &doc {
        if envelope::reports_failure(doc) {
            return SubmitVerdict::Rejected {
                state: OutcomeState::SubmitFailed,
                detail: format!(
                    "server reported FAILED: {}",
                    truncate_chars(&reply.body, BODY_EXCERPT_CHARS)
                ),
            };
        }
        if let Some(job_id) = envelope::job_id(doc) {
            if let Some(phrase) = heuristic_match(heuristic, &reply.body) {
                warn!("job {job_id} accepted but reply mentions {phrase:?}; keeping accepted");
            }
            return SubmitVerdict::Accepted { job_id };
        }
    }

    if let Some(phrase) = heuristic_match(heuristic, &reply.body) {
        return SubmitVerdict::Rejected {
            state: OutcomeState::SubmitFailed,
            detail: format!(
                "HTTP {} body looks like an error ({phrase}): {}",
                reply.status,
                truncate_chars(&reply.body, BODY_EXCERPT_CHARS)
            ),
        };
    }

    let reason = if doc.is_some() {
        "no job id in reply"
    } else {
        "reply is not JSON"
    };
    SubmitVerdict::Rejected {
        state: OutcomeState::ParseError,
        detail: format!(
            "HTTP {} {reason}: {}",
            reply.status,
            truncate_chars(&reply.body, BODY_EXCERPT_CHARS)
        ),
    }
}

fn heuristic_match(heuristic: Option<&RegexSet>, body: &str) -> Option<String> {
    let set = heuristic?;
    let idx = set.matches(body).into_iter().next()?;
    Some(
        set.patterns()[idx]
            .trim_start_matches("(?i)")
            .replace('\\', ""),
    )
}
