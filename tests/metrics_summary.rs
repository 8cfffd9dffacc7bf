use speed_check::metrics::{
    LatencyStats, RunSummary, StageMeta, SweepSummary, error_rate, group_errors, percentile,
};
use speed_check::outcome::{JobOutcome, OutcomeState};

/// Terminal outcome submitted at `start_ms` that took `latency_ms` to submit
/// and `job_ms` more to finish.
fn outcome(batch_id: u64, state: OutcomeState, start_ms: f64, latency_ms: f64, job_ms: f64) -> JobOutcome {
    let mut o = JobOutcome::new(batch_id, vec![format!("sample{batch_id}.txt")], 100);
    o.submit_started_ms = start_ms;
    o.submit_finished_ms = start_ms + latency_ms;
    o.submit_latency_ms = latency_ms;
    match state {
        OutcomeState::Succeeded | OutcomeState::ServerFailed | OutcomeState::TimedOut => {
            o.job_id = Some(format!("job-{batch_id}"));
            o.poll_started_ms = Some(o.submit_finished_ms);
            o.poll_attempts = 2;
            o.job_duration_ms = Some(job_ms);
            o.finished_ms = Some(o.submit_finished_ms + job_ms);
            o.state = state;
            if state != OutcomeState::Succeeded {
                o.error = Some(format!("{state}"));
            }
        }
        _ => o.fail_submission(state, "HTTP 500: boom"),
    }
    o
}

fn stage(ok: u64, failed: u64) -> RunSummary {
    let mut outcomes = Vec::new();
    for i in 0..ok {
        outcomes.push(outcome(i, OutcomeState::Succeeded, i as f64, 10.0, 100.0));
    }
    for i in ok..ok + failed {
        outcomes.push(outcome(i, OutcomeState::SubmitFailed, i as f64, 10.0, 0.0));
    }
    RunSummary::from_outcomes(StageMeta::default(), &outcomes)
}

#[test]
fn percentile_is_nearest_rank() {
    let values: Vec<f64> = (1..=10).map(f64::from).collect();
    assert_eq!(percentile(&values, 50.0), 6.0);
    assert_eq!(percentile(&values, 95.0), 10.0);
    assert_eq!(percentile(&values, 99.0), 10.0);
    assert_eq!(percentile(&values, 0.0), 1.0);
    assert_eq!(percentile(&[], 50.0), 0.0);
    assert_eq!(percentile(&[7.0], 99.0), 7.0);
}

#[test]
fn percentiles_stay_within_bounds_and_ordered() {
    let values = [42.0, 3.5, 17.0, 99.0, 0.25, 64.0, 8.0];
    let stats = LatencyStats::from_values(&values);
    assert_eq!(stats.min_ms, 0.25);
    assert_eq!(stats.max_ms, 99.0);
    assert!(stats.min_ms <= stats.p50_ms);
    assert!(stats.p50_ms <= stats.p95_ms);
    assert!(stats.p95_ms <= stats.p99_ms);
    assert!(stats.p99_ms <= stats.max_ms);
}

#[test]
fn error_rate_counts_failures_and_timeouts() {
    assert_eq!(error_rate(0, 0, 0), 0.0);
    assert_eq!(error_rate(1, 1, 4), 50.0);
    assert!((error_rate(1, 0, 3) - 33.333).abs() < 0.01);
}

#[test]
fn summary_counts_partition_the_outcomes() {
    let outcomes = vec![
        outcome(0, OutcomeState::Succeeded, 0.0, 20.0, 1000.0),
        outcome(1, OutcomeState::Succeeded, 100.0, 40.0, 2000.0),
        outcome(2, OutcomeState::SubmitFailed, 200.0, 5.0, 0.0),
        outcome(3, OutcomeState::ParseError, 300.0, 5.0, 0.0),
        outcome(4, OutcomeState::ServerFailed, 400.0, 30.0, 500.0),
        outcome(5, OutcomeState::TimedOut, 500.0, 30.0, 3000.0),
    ];
    let s = RunSummary::from_outcomes(StageMeta::default(), &outcomes);

    assert_eq!(s.total_jobs, 6);
    assert_eq!(s.successful_jobs, 2);
    assert_eq!(s.failed_jobs, 3);
    assert_eq!(s.timed_out, 1);
    assert_eq!(s.successful_jobs + s.failed_jobs + s.timed_out, s.total_jobs);
    assert_eq!((s.submit_failed, s.parse_errors, s.server_failed), (1, 1, 1));
    assert!((s.error_rate - 400.0 / 6.0).abs() < 1e-9);

    assert_eq!(s.submit_latency.count, 6);
    assert_eq!(s.job_duration.count, 2);
    assert_eq!(s.avg_poll_attempts, 2.0);

    // First submit at 0ms, last terminal at 500 + 30 + 3000.
    assert!((s.wall_seconds - 3.53).abs() < 1e-9);
    assert!((s.jobs_per_second - 2.0 / 3.53).abs() < 1e-9);
    assert_eq!(s.total_bytes, 600);
    assert_eq!(s.successful_bytes, 200);
}

#[test]
fn job_duration_covers_successful_jobs_only() {
    let outcomes = vec![
        outcome(0, OutcomeState::Succeeded, 0.0, 10.0, 1200.0),
        outcome(1, OutcomeState::TimedOut, 0.0, 10.0, 60_000.0),
        outcome(2, OutcomeState::TimedOut, 0.0, 10.0, 60_000.0),
        outcome(3, OutcomeState::ServerFailed, 0.0, 10.0, 400.0),
    ];
    let s = RunSummary::from_outcomes(StageMeta::default(), &outcomes);

    assert_eq!(s.successful_jobs, 1);
    assert_eq!(s.timed_out, 2);
    assert_eq!(s.job_duration.count, 1);
    assert_eq!(s.job_duration.p50_ms, 1200.0);
    assert_eq!(s.job_duration.max_ms, 1200.0);
    // Every polled unit still counts toward the attempt average.
    assert_eq!(s.avg_poll_attempts, 2.0);
}

#[test]
fn summary_is_idempotent_and_ignores_pending_outcomes() {
    let mut outcomes = vec![
        outcome(0, OutcomeState::Succeeded, 0.0, 10.0, 100.0),
        outcome(1, OutcomeState::TimedOut, 5.0, 10.0, 100.0),
    ];
    let first = RunSummary::from_outcomes(StageMeta::default(), &outcomes);
    let second = RunSummary::from_outcomes(StageMeta::default(), &outcomes);
    assert_eq!(first, second);

    outcomes.push(JobOutcome::new(2, vec!["pending".into()], 1));
    let with_pending = RunSummary::from_outcomes(StageMeta::default(), &outcomes);
    assert_eq!(with_pending.total_jobs, 2);
    assert_eq!(with_pending, first);
}

#[test]
fn empty_run_has_zero_rates() {
    let s = RunSummary::from_outcomes(StageMeta::default(), &[]);
    assert_eq!(s.total_jobs, 0);
    assert_eq!(s.error_rate, 0.0);
    assert_eq!(s.wall_seconds, 0.0);
    assert_eq!(s.files_per_second, 0.0);
}

#[test]
fn record_has_stable_columns() {
    let s = stage(3, 1);
    let keys: Vec<&str> = s.record().iter().map(|(k, _)| *k).collect();
    assert_eq!(keys[0], "label");
    assert!(keys.contains(&"error_rate_pct"));
    assert!(keys.contains(&"submit_p95_ms"));
    let values: Vec<String> = s.record().into_iter().map(|(_, v)| v).collect();
    assert_eq!(values.len(), keys.len());
}

#[test]
fn sweep_error_rate_comes_from_summed_counts() {
    let mut sweep = SweepSummary::new();
    sweep.push(stage(10, 0));
    sweep.push(stage(50, 50));

    // 50 of 110, not the mean of 0% and 50%.
    let expected = 50.0 * 100.0 / 110.0;
    assert!((sweep.overall_error_rate() - expected).abs() < 1e-9);
    assert!((sweep.overall_error_rate() - 25.0).abs() > 1.0);
    assert_eq!(sweep.totals().stages, 2);
    assert_eq!(sweep.totals().total_jobs, 110);
    assert_eq!(sweep.stages().len(), 2);
}

#[test]
fn errors_are_grouped_by_state_and_detail() {
    let outcomes = vec![
        outcome(0, OutcomeState::SubmitFailed, 0.0, 1.0, 0.0),
        outcome(1, OutcomeState::SubmitFailed, 1.0, 1.0, 0.0),
        outcome(2, OutcomeState::TimedOut, 2.0, 1.0, 10.0),
        outcome(3, OutcomeState::Succeeded, 3.0, 1.0, 10.0),
    ];
    let groups = group_errors(&outcomes);
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0].state, OutcomeState::SubmitFailed);
    assert_eq!(groups[0].count, 2);
    assert_eq!(groups[1].state, OutcomeState::TimedOut);
}
