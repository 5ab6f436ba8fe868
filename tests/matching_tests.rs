
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use ktest_sched::error::SchedulerError;
use ktest_sched::scheduler::environment::ResourceAllocation;
use ktest_sched::scheduler::{EnvironmentStatus, JobPriority, JobState, TestScheduler};

use test_harness::{
    assert_eventually, physical_env, request, request_with_hardware, test_config, virtual_env,
    ScriptedRunner,
};

fn scheduler(runner: Arc<ScriptedRunner>) -> TestScheduler {
    TestScheduler::new(test_config(), runner)
}

async fn all_completed(scheduler: &TestScheduler, expected: usize) -> bool {
    scheduler.get_queue_status().await.completed == expected
}

#[tokio::test]
async fn test_no_requirement_takes_first_registered_idle() {
    let runner = Arc::new(ScriptedRunner::new());
    let sched = scheduler(Arc::clone(&runner));
    sched
        .add_environment(physical_env("board-0", "arm64", 2048, &["usb"]))
        .await
        .unwrap();
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();

    sched.submit_job(request("anywhere", "mm")).await.unwrap();
    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;

    assert_eq!(runner.executions(), vec![("anywhere".to_string(), "board-0".to_string())]);
}

#[tokio::test]
async fn test_requirement_filters_architecture_and_memory() {
    let runner = Arc::new(ScriptedRunner::new());
    let sched = scheduler(Arc::clone(&runner));
    sched.add_environment(virtual_env("qemu-x86", "x86_64", 2048)).await.unwrap();
    sched.add_environment(virtual_env("qemu-arm-small", "arm64", 1024)).await.unwrap();
    sched.add_environment(virtual_env("qemu-arm-big", "arm64", 4096)).await.unwrap();

    sched
        .submit_job(request_with_hardware("arm-heavy", "mm", "arm64", 2048, &[]))
        .await
        .unwrap();
    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;

    assert_eq!(
        runner.executions(),
        vec![("arm-heavy".to_string(), "qemu-arm-big".to_string())]
    );
}

#[tokio::test]
async fn test_peripherals_must_all_be_present() {
    let runner = Arc::new(ScriptedRunner::new());
    let sched = scheduler(Arc::clone(&runner));
    sched
        .add_environment(physical_env("board-usb", "arm64", 2048, &["usb"]))
        .await
        .unwrap();
    sched
        .add_environment(physical_env("board-full", "arm64", 2048, &["usb", "gpio", "jtag"]))
        .await
        .unwrap();

    sched
        .submit_job(request_with_hardware("gpio-suite", "drivers", "arm64", 1024, &["usb", "gpio"]))
        .await
        .unwrap();
    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;

    assert_eq!(
        runner.executions(),
        vec![("gpio-suite".to_string(), "board-full".to_string())]
    );
}

#[tokio::test]
async fn test_virtual_environment_preferred_over_physical() {
    let runner = Arc::new(ScriptedRunner::new());
    let sched = scheduler(Arc::clone(&runner));
    // The physical board registers first and would win a plain first-match.
    sched
        .add_environment(physical_env("board-arm", "arm64", 4096, &[]))
        .await
        .unwrap();
    sched.add_environment(virtual_env("qemu-arm", "arm64", 4096)).await.unwrap();

    sched
        .submit_job(request_with_hardware("portable", "mm", "arm64", 1024, &[]))
        .await
        .unwrap();
    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;

    assert_eq!(
        runner.executions(),
        vec![("portable".to_string(), "qemu-arm".to_string())]
    );
}

#[tokio::test]
async fn test_unmatched_head_blocks_lower_priority_work() {
    let runner = Arc::new(ScriptedRunner::new());
    let sched = scheduler(Arc::clone(&runner));
    sched.add_environment(virtual_env("qemu-x86", "x86_64", 4096)).await.unwrap();

    let mut arm_job = request_with_hardware("needs-arm", "mm", "arm64", 1024, &[]);
    arm_job.priority = JobPriority::High;
    let arm_id = sched.submit_job(arm_job).await.unwrap();

    let mut easy_job = request("runs-anywhere", "mm");
    easy_job.priority = JobPriority::Low;
    let easy_id = sched.submit_job(easy_job).await.unwrap();

    // The x86 machine is idle, but dispatch stops at the unmatched head of
    // the queue rather than letting the low-priority job overtake it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sched.get_job_status(arm_id).await.unwrap().state, JobState::Queued);
    assert_eq!(sched.get_job_status(easy_id).await.unwrap().state, JobState::Queued);

    sched.add_environment(virtual_env("qemu-arm", "arm64", 2048)).await.unwrap();
    assert_eventually(
        || all_completed(&sched, 2),
        Duration::from_secs(2),
        "jobs never completed after the arm environment arrived",
    )
    .await;

    let order: Vec<String> = runner.executions().into_iter().map(|(name, _)| name).collect();
    assert_eq!(order, vec!["needs-arm".to_string(), "runs-anywhere".to_string()]);
}

#[tokio::test]
async fn test_environment_reused_across_sequential_jobs() {
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(50)));
    let sched = scheduler(Arc::clone(&runner));
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();

    sched.submit_job(request("one", "mm")).await.unwrap();
    sched.submit_job(request("two", "mm")).await.unwrap();
    sched.submit_job(request("three", "mm")).await.unwrap();

    assert_eventually(
        || all_completed(&sched, 3),
        Duration::from_secs(3),
        "jobs never completed",
    )
    .await;

    let status = sched.get_queue_status().await;
    assert_eq!(status.environments_idle, 1);
    assert_eq!(status.environments_allocated, 0);
    assert_eq!(runner.executions().len(), 3);
}

#[tokio::test]
async fn test_environment_shows_allocated_while_running() {
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(300)));
    let sched = scheduler(runner);
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();

    let job_id = sched.submit_job(request("holder", "mm")).await.unwrap();
    assert_eventually(
        || async {
            sched
                .get_job_status(job_id)
                .await
                .is_some_and(|s| s.state == JobState::Running)
        },
        Duration::from_secs(2),
        "job never started",
    )
    .await;

    let environments = sched.list_environments().await;
    assert_eq!(environments[0].status, EnvironmentStatus::Allocated);

    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;
    let environments = sched.list_environments().await;
    assert_eq!(environments[0].status, EnvironmentStatus::Idle);
}

#[tokio::test]
async fn test_add_environment_dispatches_parked_jobs() {
    let sched = scheduler(Arc::new(ScriptedRunner::new()));
    let job_id = sched.submit_job(request("parked", "mm")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(sched.get_job_status(job_id).await.unwrap().state, JobState::Queued);

    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();
    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "parked job never ran",
    )
    .await;
}

#[tokio::test]
async fn test_duplicate_environment_rejected() {
    let sched = scheduler(Arc::new(ScriptedRunner::new()));
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();

    match sched.add_environment(virtual_env("qemu-0", "arm64", 1024)).await {
        Err(SchedulerError::DuplicateEnvironment(id)) => assert_eq!(id, "qemu-0"),
        other => panic!("expected DuplicateEnvironment, got {other:?}"),
    }
}

#[tokio::test]
async fn test_remove_environment_rules() {
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(300)));
    let sched = scheduler(runner);
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();
    sched.add_environment(virtual_env("qemu-1", "x86_64", 4096)).await.unwrap();

    // Unknown ids are an error.
    assert!(matches!(
        sched.remove_environment("ghost").await,
        Err(SchedulerError::EnvironmentNotFound(_))
    ));

    // Idle environments deregister cleanly.
    let removed = sched.remove_environment("qemu-1").await.unwrap();
    assert_eq!(removed.id, "qemu-1");

    // Allocated environments must finish their job first.
    let job_id = sched.submit_job(request("holder", "mm")).await.unwrap();
    assert_eventually(
        || async {
            sched
                .get_job_status(job_id)
                .await
                .is_some_and(|s| s.state == JobState::Running)
        },
        Duration::from_secs(2),
        "job never started",
    )
    .await;
    assert!(matches!(
        sched.remove_environment("qemu-0").await,
        Err(SchedulerError::EnvironmentAllocated(_))
    ));

    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;
    assert!(sched.remove_environment("qemu-0").await.is_ok());
    assert_eq!(sched.get_queue_status().await.environments_total, 0);
}

#[tokio::test]
async fn test_stale_allocation_detection() {
    // Synthetic allocation backdated past 1.5x its estimate.
    let stale = ResourceAllocation {
        environment_id: "board-0".to_string(),
        job_id: uuid::Uuid::new_v4(),
        allocated_at: Utc::now() - chrono::Duration::seconds(20),
        estimated_duration: Duration::from_secs(10),
    };
    assert!(stale.is_stale(Utc::now()));

    // Within the window, even past the raw estimate.
    let slow = ResourceAllocation {
        environment_id: "board-0".to_string(),
        job_id: uuid::Uuid::new_v4(),
        allocated_at: Utc::now() - chrono::Duration::seconds(12),
        estimated_duration: Duration::from_secs(10),
    };
    assert!(!slow.is_stale(Utc::now()));

    let fresh = ResourceAllocation {
        environment_id: "board-0".to_string(),
        job_id: uuid::Uuid::new_v4(),
        allocated_at: Utc::now(),
        estimated_duration: Duration::from_secs(10),
    };
    assert!(!fresh.is_stale(Utc::now()));
}

#[tokio::test]
async fn test_open_ended_estimate_is_never_stale() {
    // Estimate at the top of the Duration range, allocated long ago.
    let open_ended = ResourceAllocation {
        environment_id: "board-0".to_string(),
        job_id: uuid::Uuid::new_v4(),
        allocated_at: Utc::now() - chrono::Duration::seconds(3600),
        estimated_duration: Duration::from_secs(u64::MAX),
    };
    assert!(!open_ended.is_stale(Utc::now()));

    // Same estimate submitted through the scheduler: the staleness scan must
    // still answer while the job runs.
    let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(200)));
    let sched = scheduler(runner);
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();

    let mut req = request("open-ended", "mm");
    req.spec.estimated_duration_secs = u64::MAX;
    let job_id = sched.submit_job(req).await.unwrap();
    assert_eq!(
        sched.get_job_status(job_id).await.unwrap().state,
        JobState::Running
    );
    assert!(sched.stale_allocations().await.is_empty());
}

#[tokio::test]
async fn test_no_stale_allocations_for_quick_jobs() {
    let sched = scheduler(Arc::new(ScriptedRunner::new()));
    sched.add_environment(virtual_env("qemu-0", "x86_64", 4096)).await.unwrap();
    sched.submit_job(request("quick", "mm")).await.unwrap();

    assert_eventually(
        || all_completed(&sched, 1),
        Duration::from_secs(2),
        "job never completed",
    )
    .await;
    assert!(sched.stale_allocations().await.is_empty());
}
