use serde::{Deserialize, Serialize};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutcomeState {
    /// Accepted by the server; polling has not finished yet.
    Submitted,
    Succeeded,
    SubmitFailed,
    ParseError,
    ServerFailed,
    TimedOut,
}

impl OutcomeState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OutcomeState::Submitted)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeState::Submitted => "SUBMITTED",
            OutcomeState::Succeeded => "SUCCEEDED",
            OutcomeState::SubmitFailed => "SUBMIT_FAILED",
            OutcomeState::ParseError => "PARSE_ERROR",
            OutcomeState::ServerFailed => "SERVER_FAILED",
            OutcomeState::TimedOut => "TIMED_OUT",
        }
    }
}

impl std::fmt::Display for OutcomeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time spent in one server-side state before it changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateTiming {
    pub state: String,
    pub duration_ms: f64,
}

/// Monotonic origin shared by every unit of a run. All outcome timestamps
/// are milliseconds since this origin.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn origin(&self) -> Instant {
        self.origin
    }

    pub fn since_ms(&self, at: Instant) -> f64 {
        at.saturating_duration_since(self.origin).as_secs_f64() * 1000.0
    }
}

/// Record of one submitted batch, owned by the unit that submitted it until
/// it reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub batch_id: u64,
    pub job_id: Option<String>,
    pub datasource: Option<u32>,
    pub file_names: Vec<String>,
    pub file_count: usize,
    pub total_bytes: u64,

    pub submit_started_ms: f64,
    pub submit_finished_ms: f64,
    pub submit_latency_ms: f64,
    pub http_status: Option<u16>,

    pub poll_started_ms: Option<f64>,
    pub finished_ms: Option<f64>,
    pub job_duration_ms: Option<f64>,
    pub poll_attempts: u32,
    pub transient_faults: u32,
    pub last_server_state: Option<String>,
    pub transitions: Vec<StateTiming>,

    pub state: OutcomeState,
    pub error: Option<String>,
}

impl JobOutcome {
    pub fn new(batch_id: u64, file_names: Vec<String>, total_bytes: u64) -> Self {
        Self {
            batch_id,
            job_id: None,
            datasource: None,
            file_count: file_names.len(),
            file_names,
            total_bytes,
            submit_started_ms: 0.0,
            submit_finished_ms: 0.0,
            submit_latency_ms: 0.0,
            http_status: None,
            poll_started_ms: None,
            finished_ms: None,
            job_duration_ms: None,
            poll_attempts: 0,
            transient_faults: 0,
            last_server_state: None,
            transitions: Vec::new(),
            state: OutcomeState::Submitted,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Marks the outcome terminal without polling (rejected submissions).
    pub fn fail_submission(&mut self, state: OutcomeState, error: impl Into<String>) {
        self.state = state;
        self.error = Some(error.into());
        self.finished_ms = Some(self.submit_finished_ms);
    }

    /// Timestamp at which the outcome became terminal.
    pub fn terminal_ms(&self) -> f64 {
        self.finished_ms.unwrap_or(self.submit_finished_ms)
    }
}
