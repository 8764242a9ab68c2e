//! End-to-end build tests against the in-memory gateway.

use std::sync::Arc;
use std::time::Duration;

use lfsbuild::adapters::{ChannelSink, EventSink};
use lfsbuild::config::ExecutionSettings;
use lfsbuild::core::{BuildConfig, Orchestrator};
use lfsbuild::domain::{BuildEvent, BuildStatus, DocumentType, StageStatus};
use lfsbuild::store::{MemoryGateway, PersistenceGateway};
use tokio::sync::mpsc::UnboundedReceiver;

fn setup() -> (
    Orchestrator,
    Arc<MemoryGateway>,
    UnboundedReceiver<BuildEvent>,
) {
    let gateway = Arc::new(MemoryGateway::new());
    let (sink, rx) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let settings = ExecutionSettings {
        grace_period: Duration::from_millis(300),
        flush_lines: 25,
        flush_interval: Duration::from_secs(30),
        control_poll_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let orch = Orchestrator::from_settings(gateway.clone(), sink, settings);
    (orch, gateway, rx)
}

fn drain(rx: &mut UnboundedReceiver<BuildEvent>) -> Vec<BuildEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_all_stages_succeed() {
    let (orch, gateway, mut rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
version: "12.0"
stages:
  - { name: prepare_host, order: 1, command: "echo preparing" }
  - { name: download_sources, order: 2, command: "echo downloading", dependencies: [prepare_host] }
  - { name: build_toolchain, order: 3, command: "echo building", dependencies: [download_sources] }
"#,
    )
    .unwrap();

    let report = orch.run_build(config).await.unwrap();
    let build = &report.build;

    assert_eq!(build.status, BuildStatus::Success);
    assert_eq!(build.total_stages, 3);
    assert_eq!(build.completed_stages, build.total_stages);
    assert!(build.end_time.is_some());
    assert!(report.stages.iter().all(|s| s.status == StageStatus::Success));

    let stored = gateway.get_build(&build.build_id).await.unwrap().unwrap();
    assert_eq!(stored.status, BuildStatus::Success);

    let events = drain(&mut rx);
    let starts = events
        .iter()
        .filter(|e| matches!(e, BuildEvent::StageStart { .. }))
        .count();
    assert_eq!(starts, 3);
    assert!(matches!(
        events.last(),
        Some(BuildEvent::BuildComplete { status: BuildStatus::Success, .. })
    ));

    // Config snapshot and summary are recorded alongside stage output
    let docs = gateway.list_documents(&build.build_id, None).await.unwrap();
    assert!(docs.iter().any(|d| d.document_type == DocumentType::Config));
    assert!(docs.iter().any(|d| d.document_type == DocumentType::Summary));
}

#[tokio::test]
async fn test_hard_failure_skips_remaining_stages() {
    let (orch, _gateway, mut rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: one, order: 1, command: "true" }
  - { name: two, order: 2, command: "echo broken >&2; exit 3" }
  - { name: three, order: 3, command: "true" }
  - { name: four, order: 4, command: "true" }
"#,
    )
    .unwrap();

    let report = orch.run_build(config).await.unwrap();
    assert_eq!(report.build.status, BuildStatus::Failed);
    assert_eq!(report.build.completed_stages, 1);

    let statuses: Vec<_> = report.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StageStatus::Success,
            StageStatus::Failed,
            StageStatus::Skipped,
            StageStatus::Skipped
        ]
    );
    assert!(report.stages[1].error_log.contains("broken"));
    assert!(report.stages[2].start_time.is_none());

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        BuildEvent::BuildError { stage: Some(stage), .. } if stage == "two"
    )));
}

#[tokio::test]
async fn test_allowed_failure_continues() {
    let (orch, _gateway, _rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: optional_docs, order: 1, command: "exit 1", allow_failure: true }
  - { name: build_system, order: 2, command: "true" }
"#,
    )
    .unwrap();

    let report = orch.run_build(config).await.unwrap();
    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[1].status, StageStatus::Success);
    assert_eq!(report.build.status, BuildStatus::Success);
    assert_eq!(report.build.completed_stages, 1);
}

#[tokio::test]
async fn test_output_documents_preserve_line_order() {
    let (orch, gateway, _rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: chatty, order: 1, command: "for i in $(seq 1 120); do echo line-$i; done" }
"#,
    )
    .unwrap();

    let report = orch.run_build(config).await.unwrap();
    assert_eq!(report.build.status, BuildStatus::Success);

    let docs = gateway
        .list_documents(&report.build.build_id, Some("chatty"))
        .await
        .unwrap();
    let outputs: Vec<_> = docs
        .iter()
        .filter(|d| d.document_type == DocumentType::Output)
        .collect();
    assert_eq!(outputs.len(), 5);

    let joined: String = outputs.iter().map(|d| d.content.as_str()).collect();
    let expected: String = (1..=120).map(|i| format!("line-{}\n", i)).collect();
    assert_eq!(joined, expected);
    assert_eq!(report.stages[0].output_log, expected);
}

#[tokio::test]
async fn test_dependency_order_is_deterministic() {
    let (orch, _gateway, mut rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: C, order: 2, command: "true", dependencies: [A] }
  - { name: B, order: 1, command: "true", dependencies: [A] }
  - { name: A, order: 3, command: "true" }
"#,
    )
    .unwrap();

    orch.run_build(config).await.unwrap();

    let started: Vec<_> = drain(&mut rx)
        .into_iter()
        .filter_map(|e| match e {
            BuildEvent::StageStart { stage, .. } => Some(stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, vec!["A", "B", "C"]);
}

#[tokio::test]
async fn test_toolchain_failure_skips_chroot() {
    let (orch, gateway, mut rx) = setup();
    let config = BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: build_toolchain, order: 1, command: "exit 1", rollback_command: "echo rolled back" }
  - { name: enter_chroot, order: 2, command: "echo chroot", dependencies: [build_toolchain] }
"#,
    )
    .unwrap();

    let report = orch.run_build(config).await.unwrap();
    assert_eq!(report.build.status, BuildStatus::Failed);
    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);

    let events = drain(&mut rx);
    assert!(!events
        .iter()
        .any(|e| matches!(e, BuildEvent::StageStart { stage, .. } if stage == "enter_chroot")));
    assert!(events.iter().any(|e| matches!(
        e,
        BuildEvent::StageComplete { stage, status: StageStatus::Skipped, .. } if stage == "enter_chroot"
    )));

    let docs = gateway
        .list_documents(&report.build.build_id, Some("build_toolchain"))
        .await
        .unwrap();
    assert!(docs.iter().any(|d| d.document_type == DocumentType::Error));
    assert!(docs.iter().any(|d| d.metadata["rollback"] == true));
}

#[tokio::test]
async fn test_stage_sees_build_environment() {
    let (orch, _gateway, _rx) = setup();
    let dir = tempfile::TempDir::new().unwrap();
    let yaml = format!(
        r#"
name: lfs
working_dir: {}
environment:
  MAKEFLAGS: "-j4"
stages:
  - {{ name: env, order: 1, command: "echo $MAKEFLAGS $LFS $LFSBUILD_STAGE; pwd" }}
"#,
        dir.path().display()
    );

    let report = orch.run_build(BuildConfig::from_yaml(&yaml).unwrap()).await.unwrap();
    let output = &report.stages[0].output_log;
    assert!(output.starts_with("-j4 /mnt/lfs env\n"));
    let cwd = dir.path().canonicalize().unwrap();
    assert!(output.contains(cwd.to_str().unwrap()));
}
