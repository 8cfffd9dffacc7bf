use crate::{
    api::{JobApi, Route, envelope},
    config::PollSettings,
    outcome::{JobOutcome, OutcomeState, RunClock, StateTiming},
    util::truncate_chars,
};
use std::sync::Arc;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// State label a job holds between acceptance and its first observed state.
pub const INITIAL_STATE: &str = "SUBMITTED";

pub struct JobPoller {
    api: Arc<dyn JobApi>,
    settings: PollSettings,
    clock: RunClock,
}

impl JobPoller {
    pub fn new(api: Arc<dyn JobApi>, settings: PollSettings, clock: RunClock) -> Self {
        Self {
            api,
            settings,
            clock,
        }
    }

    /// Drives an accepted job to a terminal state. Outcomes that are already
    /// terminal, or carry no job id, are returned untouched.
    pub async fn poll(&self, mut outcome: JobOutcome) -> JobOutcome {
        if outcome.is_terminal() {
            return outcome;
        }
        let Some(job_id) = outcome.job_id.clone() else {
            outcome.state = OutcomeState::ParseError;
            outcome.error = Some("accepted outcome has no job id".into());
            outcome.finished_ms = Some(outcome.submit_finished_ms);
            return outcome;
        };
        let route = Route {
            datasource: outcome.datasource,
        };

        let started = Instant::now();
        outcome.poll_started_ms = Some(self.clock.since_ms(started));

        let max_attempts = self.settings.max_attempts();
        let mut current = INITIAL_STATE.to_string();
        let mut entered = started;
        let mut last_fault: Option<String> = None;

        for attempt in 1..=max_attempts {
            if started.elapsed() >= self.settings.job_timeout {
                break;
            }
            sleep(self.settings.interval).await;
            outcome.poll_attempts = attempt;

            let observed = match self.api.job_status(&route, &job_id).await {
                Err(err) => {
                    debug!("job {job_id} poll {attempt}: transport error: {err:#}");
                    outcome.transient_faults += 1;
                    last_fault = Some(format!("transport: {err:#}"));
                    continue;
                }
                Ok(reply) if !reply.is_success() => {
                    debug!("job {job_id} poll {attempt}: HTTP {}", reply.status);
                    outcome.transient_faults += 1;
                    last_fault = Some(format!(
                        "HTTP {}: {}",
                        reply.status,
                        truncate_chars(&reply.body, 200)
                    ));
                    continue;
                }
                Ok(reply) => match envelope::parse(&reply.body) {
                    Some(doc) => envelope::job_state(&doc),
                    None => {
                        debug!("job {job_id} poll {attempt}: body is not JSON");
                        outcome.transient_faults += 1;
                        last_fault = Some(format!(
                            "malformed status body: {}",
                            truncate_chars(&reply.body, 200)
                        ));
                        continue;
                    }
                },
            };

            // No state field this time; wait and ask again.
            let Some(state) = observed else {
                debug!("job {job_id} poll {attempt}: state {}", envelope::UNKNOWN_STATE);
                continue;
            };

            if !state.eq_ignore_ascii_case(&current) {
                let now = Instant::now();
                let spent = now.duration_since(entered).as_secs_f64() * 1000.0;
                debug!("job {job_id}: {current} -> {state} after {spent:.0}ms");
                outcome.transitions.push(StateTiming {
                    state: current.clone(),
                    duration_ms: spent,
                });
                current = state.clone();
                entered = now;
            }
            outcome.last_server_state = Some(state.clone());

            if self.settings.is_success(&state) {
                return self.finish(outcome, started, OutcomeState::Succeeded, None);
            }
            if self.settings.is_failure(&state) {
                let detail = format!("server reported {state}");
                return self.finish(outcome, started, OutcomeState::ServerFailed, Some(detail));
            }
        }

        let mut detail = format!(
            "no terminal state within {:?} ({} attempts, last state {current})",
            self.settings.job_timeout, outcome.poll_attempts
        );
        if let Some(fault) = last_fault {
            detail.push_str(&format!("; last fault: {fault}"));
        }
        self.finish(outcome, started, OutcomeState::TimedOut, Some(detail))
    }

    fn finish(
        &self,
        mut outcome: JobOutcome,
        started: Instant,
        state: OutcomeState,
        error: Option<String>,
    ) -> JobOutcome {
        let finished = Instant::now();
        outcome.state = state;
        outcome.error = error;
        outcome.finished_ms = Some(self.clock.since_ms(finished));
        outcome.job_duration_ms = Some(finished.duration_since(started).as_secs_f64() * 1000.0);

        let job_id = outcome.job_id.as_deref().unwrap_or("-");
        match state {
            OutcomeState::Succeeded => info!(
                "job {job_id} batch {} {state} after {} polls ({:.0}ms)",
                outcome.batch_id,
                outcome.poll_attempts,
                outcome.job_duration_ms.unwrap_or_default()
            ),
            _ => warn!(
                "job {job_id} batch {} {state}: {}",
                outcome.batch_id,
                outcome.error.as_deref().unwrap_or("")
            ),
        }
        outcome
    }
}
