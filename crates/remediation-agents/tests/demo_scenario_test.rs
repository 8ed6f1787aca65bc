//! The built-in demo scenario, run end to end with the tracker sync.

use std::sync::Arc;
use std::time::Duration;

use orchestration::{
    CircuitState, Dispatcher, EngineConfig, PublishDecision, SharedResources, Stage, TrackerStatus,
};
use remediation_agents::intake::IntakeLoop;
use remediation_agents::simulated::demo_scenario;
use remediation_agents::sinks::spawn_tracker_sync;
use remediation_agents::tracker::FileTicketSource;
use tokio_util::sync::CancellationToken;

#[tokio::test(start_paused = true)]
async fn test_demo_scenario_outcomes_reach_tracker() {
    let scenario = demo_scenario();
    let file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(file.path(), serde_json::to_string(&scenario.tickets).unwrap()).unwrap();
    let source = Arc::new(FileTicketSource::new(file.path()));

    let config = EngineConfig::default();
    let resources = SharedResources::from_config(&config);
    let dispatcher = Dispatcher::new(config, scenario.handlers, resources)
        .unwrap()
        .shared();

    let shutdown = CancellationToken::new();
    let sync = spawn_tracker_sync(
        &dispatcher.resources().events,
        source.clone(),
        shutdown.clone(),
    );
    let mut intake = IntakeLoop::new(source.clone(), dispatcher.clone(), Duration::from_secs(60));
    assert_eq!(intake.poll_once().await.unwrap().accepted, 4);

    let scheduler = tokio::spawn(dispatcher.clone().run(shutdown.clone()));
    while !dispatcher.is_settled().await {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    // Let the sync drain the last updates.
    while source.updates().len() < 4 {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.cancel();
    scheduler.await.unwrap();
    sync.await.unwrap();

    let outage = dispatcher.context("demo-outage").await.unwrap();
    assert_eq!(outage.current_stage(), Stage::Completed);
    assert_eq!(outage.outcome_counts().transient, 2);
    assert_eq!(outage.publish_decision(), Some(PublishDecision::CreatePr));
    assert_eq!(
        outage.stage_data(Stage::Communication).unwrap()["decision"],
        "create_pr"
    );

    let export = dispatcher.context("demo-export").await.unwrap();
    assert_eq!(export.current_stage(), Stage::Escalated);
    assert_eq!(export.halted_stage(), Some(Stage::Development));
    assert_eq!(export.patch_attempts().len(), 1);

    let avatar = dispatcher.context("demo-avatar").await.unwrap();
    assert_eq!(avatar.current_stage(), Stage::Completed);
    assert_eq!(avatar.outcome_counts().circuit_open, 1);

    let typo = dispatcher.context("demo-typo").await.unwrap();
    assert_eq!(typo.current_stage(), Stage::Completed);

    // The planner's target file reached the developer through stage data.
    assert_eq!(
        outage.latest_patch().unwrap().target_file,
        "src/demo_2.rs"
    );

    let updates = source.updates();
    assert_eq!(updates.len(), 4);
    let escalated: Vec<_> = updates
        .iter()
        .filter(|u| u.status == TrackerStatus::Escalated)
        .collect();
    assert_eq!(escalated.len(), 1);
    assert_eq!(escalated[0].tracker_id, "DEMO-3");
    assert!(escalated[0]
        .comment
        .contains("no patch above confidence threshold"));

    assert!(dispatcher
        .breaker_states()
        .iter()
        .all(|b| b.state == CircuitState::Closed));
}
