mod common;

use std::sync::Arc;

use common::{valid_fields, Harness, Options, ScriptedDriver};
use records_request_submit::config::Config;
use records_request_submit::models::{AttemptOutcome, LifecycleState};
use records_request_submit::services::FixedPacing;
use records_request_submit::store::{FileStore, RequestStore};
use records_request_submit::workflow::ClaimOutcome;
use records_request_submit::App;

#[tokio::test]
async fn interrupted_attempt_resumes_after_restart() {
    let dir = tempfile::tempdir().unwrap();

    let id = {
        let store: Arc<dyn RequestStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let options = Options {
            store: Some(store),
            ..Default::default()
        };
        let harness = Harness::with_options(ScriptedDriver::new(), options);
        let id = harness.enqueue().await;

        // 认领后进程"崩溃"，尝试一直处于打开状态
        assert!(matches!(harness.engine.claim(id).await.unwrap(), ClaimOutcome::Claimed(_)));
        id
    };

    let store: Arc<dyn RequestStore> = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let options = Options {
        store: Some(store),
        ..Default::default()
    };
    let harness = Harness::with_options(ScriptedDriver::new(), options);
    assert_eq!(
        harness.coordinator.store().load(id).await.unwrap().state,
        LifecycleState::Submitting
    );

    assert_eq!(harness.coordinator.recover().await.unwrap(), 1);
    assert_eq!(harness.drive_to_rest(id).await, LifecycleState::Submitted);

    let attempts = harness.coordinator.store().attempts(id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].outcome, AttemptOutcome::TransientFailure);
    assert_eq!(attempts[1].number, 2);
    assert_eq!(attempts[1].outcome, AttemptOutcome::Success);
}

#[tokio::test]
async fn app_runs_intake_through_submission_and_first_poll() {
    let dir = tempfile::tempdir().unwrap();
    let intake_dir = dir.path().join("intake");
    std::fs::create_dir_all(&intake_dir).unwrap();
    std::fs::write(
        intake_dir.join("001.toml"),
        r#"
priority = "priority"
report_type = "incident"
case_number = "2024-00123456"

[requestor]
first_name = "Jane"
last_name = "Doe"
email = "jane.doe@example.com"
"#,
    )
    .unwrap();

    let mut config = Config::default();
    config.storage.state_dir = dir.path().join("state");
    config.storage.intake_dir = intake_dir.clone();
    config.storage.follow_up_file = dir.path().join("follow_up.txt");
    config.evidence.dir = dir.path().join("evidence");
    config.submission.backoff_base_ms = 0;
    config.submission.backoff_cap_ms = 0;

    let driver = ScriptedDriver::new();
    let app = App::with_driver(config, Arc::new(driver.clone()), Arc::new(FixedPacing::zero()))
        .await
        .unwrap();

    let stats = app.run_once().await.unwrap();
    assert_eq!(stats.submitted, 1);
    assert!(!intake_dir.join("001.toml").exists());

    let submitted = app
        .coordinator()
        .store()
        .list_in_states(&[LifecycleState::Submitted])
        .await
        .unwrap();
    assert_eq!(submitted.len(), 1);
    assert!(submitted[0].last_polled_at.is_some());
    assert_eq!(driver.state.queried.load(std::sync::atomic::Ordering::SeqCst), 1);

    // 证据已落盘
    let evidence = app.coordinator().evidence_for_request(submitted[0].id).await.unwrap();
    assert_eq!(evidence.len(), 2);
    assert!(dir.path().join("evidence").join("blobs").exists());
}

#[tokio::test]
async fn app_recovers_state_written_by_a_previous_run() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.storage.state_dir = dir.path().join("state");
    config.storage.intake_dir = dir.path().join("missing_intake");
    config.storage.follow_up_file = dir.path().join("follow_up.txt");
    config.evidence.dir = dir.path().join("evidence");

    let id = {
        let app = App::with_driver(config.clone(), Arc::new(ScriptedDriver::new()), Arc::new(FixedPacing::zero()))
            .await
            .unwrap();
        app.coordinator()
            .enqueue(valid_fields(), records_request_submit::Priority::Standard)
            .await
            .unwrap()
    };

    let app = App::with_driver(config, Arc::new(ScriptedDriver::new()), Arc::new(FixedPacing::zero()))
        .await
        .unwrap();
    let view = app.coordinator().status(id).await.unwrap();
    assert_eq!(view.state, LifecycleState::Queued);

    let stats = app.run_once().await.unwrap();
    assert_eq!(stats.submitted, 1);
    assert_eq!(app.coordinator().status(id).await.unwrap().state, LifecycleState::Submitted);
}

#[tokio::test]
async fn intake_never_reenqueues_a_claimed_file() {
    let dir = tempfile::tempdir().unwrap();
    let intake_dir = dir.path().join("intake");
    std::fs::create_dir_all(&intake_dir).unwrap();
    let payload = r#"
report_type = "incident"
case_number = "2024-00123456"

[requestor]
first_name = "Jane"
last_name = "Doe"
email = "jane.doe@example.com"
"#;
    std::fs::write(intake_dir.join("001.toml"), payload).unwrap();
    // 上次运行改名后中断
    std::fs::write(intake_dir.join("002.toml.claimed"), payload).unwrap();

    let mut config = Config::default();
    config.storage.state_dir = dir.path().join("state");
    config.storage.intake_dir = intake_dir.clone();
    config.storage.follow_up_file = dir.path().join("follow_up.txt");
    config.evidence.dir = dir.path().join("evidence");

    let app = App::with_driver(config, Arc::new(ScriptedDriver::new()), Arc::new(FixedPacing::zero()))
        .await
        .unwrap();
    assert_eq!(app.intake().await.unwrap(), 1);
    assert_eq!(app.intake().await.unwrap(), 0);

    assert!(!intake_dir.join("001.toml").exists());
    assert!(!intake_dir.join("001.toml.claimed").exists());
    assert!(intake_dir.join("002.toml.claimed").exists());

    let queued = app
        .coordinator()
        .store()
        .list_in_states(&[LifecycleState::Queued])
        .await
        .unwrap();
    assert_eq!(queued.len(), 1);
}
