mod common;

use common::{ScriptedApi, accepted, run_config, sample_set, status};
use speed_check::api::HttpReply;
use speed_check::config::DispatchMode;
use speed_check::dispatch::{Dispatcher, RatePlan};
use speed_check::metrics::{RunSummary, StageMeta};
use speed_check::outcome::OutcomeState;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;

fn dispatcher(api: Arc<ScriptedApi>, mode: DispatchMode, samples: usize) -> Dispatcher {
    Dispatcher::new(api, Arc::new(run_config(mode, 1)), sample_set(samples))
}

#[test]
fn rate_plan_counts_units_and_spacing() {
    let plan = RatePlan::new(2.0, 3, 1);
    assert_eq!(plan.units, 6);
    assert_eq!(plan.interval, Duration::from_millis(500));

    let plan = RatePlan::new(0.5, 10, 1);
    assert_eq!(plan.units, 5);
    assert_eq!(plan.interval, Duration::from_secs(2));

    let plan = RatePlan::new(10.0, 1, 4);
    assert_eq!(plan.units, 3);
    assert_eq!(plan.interval, Duration::from_millis(400));

    let plan = RatePlan::new(4e9, 1, 1);
    assert_eq!(plan.interval, Duration::from_millis(1));
}

#[tokio::test(start_paused = true)]
async fn single_unit_succeeds_on_second_poll() {
    let api = Arc::new(ScriptedApi::new(
        |_| Ok(accepted("j1")),
        |_, poll| Ok(status(if poll < 2 { "RUNNING" } else { "finished" })),
    ));
    let result = dispatcher(api.clone(), DispatchMode::Parallel { batches: 1, concurrency: 1 }, 1)
        .execute(pending())
        .await;

    assert!(!result.interrupted);
    assert_eq!(result.outcomes.len(), 1);
    assert_eq!(result.outcomes[0].poll_attempts, 2);

    let summary = RunSummary::from_outcomes(StageMeta::default(), &result.outcomes);
    assert_eq!(summary.successful_jobs, 1);
    assert_eq!(summary.error_rate, 0.0);
}

#[tokio::test(start_paused = true)]
async fn sequential_failure_is_isolated_to_its_unit() {
    let api = Arc::new(ScriptedApi::new(
        |n| {
            Ok(if n == 1 {
                HttpReply::new(500, "internal error")
            } else {
                accepted(&format!("job-{n}"))
            })
        },
        |_, _| Ok(status("FINISHED")),
    ));
    let result = dispatcher(api, DispatchMode::Sequential { batches: 3 }, 3)
        .execute(pending())
        .await;

    let states: Vec<OutcomeState> = result.outcomes.iter().map(|o| o.state).collect();
    assert_eq!(
        states,
        [
            OutcomeState::Succeeded,
            OutcomeState::SubmitFailed,
            OutcomeState::Succeeded
        ]
    );
    let batches: Vec<u64> = result.outcomes.iter().map(|o| o.batch_id).collect();
    assert_eq!(batches, [1, 2, 3]);

    let summary = RunSummary::from_outcomes(StageMeta::default(), &result.outcomes);
    assert!((summary.error_rate - 100.0 / 3.0).abs() < 0.01);
}

#[tokio::test(start_paused = true)]
async fn parallel_never_exceeds_concurrency() {
    // Each unit spends 100ms submitting and about 3s polling.
    let api = Arc::new(
        ScriptedApi::new(
            |n| Ok(accepted(&format!("job-{n}"))),
            |_, poll| Ok(status(if poll < 3 { "RUNNING" } else { "FINISHED" })),
        )
        .with_submit_delay(Duration::from_millis(100)),
    );
    let result = dispatcher(
        api.clone(),
        DispatchMode::Parallel {
            batches: 12,
            concurrency: 3,
        },
        4,
    )
    .execute(pending())
    .await;

    assert_eq!(result.outcomes.len(), 12);
    assert!(result.outcomes.iter().all(|o| o.state == OutcomeState::Succeeded));
    assert!(result.outcomes.iter().all(|o| o.poll_attempts == 3));
    assert_eq!(api.max_units_in_flight(), 3);
    // Four waves of three units, each about 3.1s long.
    assert!(result.elapsed >= Duration::from_millis(12_400));
    assert!(result.elapsed < Duration::from_secs(16));
}

#[tokio::test(start_paused = true)]
async fn fixed_rate_launches_every_unit_and_waits_for_all() {
    // job-n needs n + 1 polls, so later units outlive the launch window.
    let api = Arc::new(ScriptedApi::new(
        |n| Ok(accepted(&format!("job-{n}"))),
        |job_id, poll| {
            let n: u32 = job_id.trim_start_matches("job-").parse().unwrap();
            Ok(status(if poll > n { "FINISHED" } else { "RUNNING" }))
        },
    ));
    let result = dispatcher(
        api.clone(),
        DispatchMode::FixedRate {
            files_per_second: 2.0,
            duration_seconds: 3,
        },
        2,
    )
    .execute(pending())
    .await;

    assert_eq!(api.submit_calls(), 6);
    assert_eq!(result.planned_units, 6);
    assert_eq!(result.outcomes.len(), 6);
    assert!(result.outcomes.iter().all(|o| o.state == OutcomeState::Succeeded));

    let mut starts: Vec<(u64, f64)> = result
        .outcomes
        .iter()
        .map(|o| (o.batch_id, o.submit_started_ms))
        .collect();
    starts.sort_by_key(|(id, _)| *id);
    for (id, start) in starts {
        assert!((start - (id - 1) as f64 * 500.0).abs() < 1.0, "batch {id} at {start}");
    }
    // The last unit starts at 2.5s and needs 6 polls.
    assert!(result.elapsed >= Duration::from_millis(8500));
}

#[tokio::test(start_paused = true)]
async fn interrupt_keeps_finished_outcomes_only() {
    let api = Arc::new(ScriptedApi::new(
        |n| Ok(accepted(&format!("job-{n}"))),
        |_, poll| Ok(status(if poll < 2 { "RUNNING" } else { "FINISHED" })),
    ));
    let result = dispatcher(api, DispatchMode::Sequential { batches: 5 }, 5)
        .execute(tokio::time::sleep(Duration::from_secs(5)))
        .await;

    assert!(result.interrupted);
    assert_eq!(result.planned_units, 5);
    assert_eq!(result.outcomes.len(), 2);
    assert!(result.outcomes.iter().all(|o| o.is_terminal()));
}

#[tokio::test(start_paused = true)]
async fn crashed_unit_still_reports_an_outcome() {
    let api = Arc::new(ScriptedApi::new(
        |n| {
            if n == 1 {
                panic!("scripted crash");
            }
            Ok(accepted(&format!("job-{n}")))
        },
        |_, _| Ok(status("FINISHED")),
    ));
    let result = dispatcher(api, DispatchMode::Sequential { batches: 3 }, 3)
        .execute(pending())
        .await;

    assert_eq!(result.outcomes.len(), 3);
    let crashed: Vec<_> = result
        .outcomes
        .iter()
        .filter(|o| o.state == OutcomeState::SubmitFailed)
        .collect();
    assert_eq!(crashed.len(), 1);
    assert_eq!(crashed[0].batch_id, 2);
    assert!(crashed[0].error.as_deref().unwrap().contains("unit crashed"));
}

#[tokio::test(start_paused = true)]
async fn polls_follow_the_submission_route() {
    let api = Arc::new(ScriptedApi::always("FINISHED"));
    let mut run = run_config(DispatchMode::Sequential { batches: 4 }, 1);
    run.target.datasource_ids = vec![1, 2];
    let result = Dispatcher::new(api.clone(), Arc::new(run), sample_set(2))
        .execute(pending())
        .await;

    assert_eq!(result.outcomes.len(), 4);
    let routed: Vec<(u64, Option<u32>)> = result
        .outcomes
        .iter()
        .map(|o| (o.batch_id, o.datasource))
        .collect();
    assert_eq!(routed, [(1, Some(1)), (2, Some(2)), (3, Some(1)), (4, Some(2))]);
    // job-n is the (n + 1)th submission, i.e. batch n + 1.
    for (route, job_id) in api.status_routes() {
        let n: u32 = job_id.trim_start_matches("job-").parse().unwrap();
        assert_eq!(route.datasource, Some(if n % 2 == 0 { 1 } else { 2 }));
    }
}
