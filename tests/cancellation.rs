//! Graceful and forced cancellation tests.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use lfsbuild::adapters::{ChannelSink, EventSink};
use lfsbuild::config::ExecutionSettings;
use lfsbuild::core::{BuildConfig, Orchestrator};
use lfsbuild::domain::{Build, BuildEvent, BuildStatus, DocumentType, Stage, StageStatus};
use lfsbuild::store::{MemoryGateway, PersistenceGateway};
use tokio::sync::mpsc::UnboundedReceiver;

const GRACE: Duration = Duration::from_millis(300);

fn setup() -> (Orchestrator, Arc<MemoryGateway>, UnboundedReceiver<BuildEvent>) {
    let gateway = Arc::new(MemoryGateway::new());
    let (sink, rx) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let settings = ExecutionSettings {
        grace_period: GRACE,
        control_poll_interval: Duration::from_millis(50),
        kill_patterns: Vec::new(),
        ..Default::default()
    };
    let orch = Orchestrator::from_settings(gateway.clone(), sink, settings);
    (orch, gateway, rx)
}

/// A two-stage build whose first stage ignores SIGTERM
fn stubborn_config() -> BuildConfig {
    BuildConfig::from_yaml(
        r#"
name: lfs
stages:
  - { name: build_toolchain, order: 1, command: "trap '' TERM; echo ready; sleep 30" }
  - { name: build_system, order: 2, command: "true" }
"#,
    )
    .unwrap()
}

async fn wait_for_output(rx: &mut UnboundedReceiver<BuildEvent>, wanted: &str) {
    let found = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            if matches!(&event, BuildEvent::StageOutput { line, .. } if line == wanted) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(found, "stage never printed {:?}", wanted);
}

#[tokio::test]
async fn test_graceful_cancel_escalates_after_grace() {
    let (orch, _gateway, mut rx) = setup();
    let id = orch.start_build(stubborn_config()).await.unwrap();
    wait_for_output(&mut rx, "ready").await;

    let started = Instant::now();
    assert!(orch.cancel_build(&id).await.unwrap());
    let report = tokio::time::timeout(Duration::from_secs(10), orch.wait(&id))
        .await
        .unwrap()
        .unwrap();

    assert!(started.elapsed() >= GRACE);
    assert!(started.elapsed() < GRACE + Duration::from_secs(3));
    assert_eq!(report.build.status, BuildStatus::Cancelled);
    assert_eq!(report.stages[0].status, StageStatus::Cancelled);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);
}

#[tokio::test]
async fn test_force_cancel_finishes_within_grace() {
    let (orch, gateway, mut rx) = setup();
    let id = orch.start_build(stubborn_config()).await.unwrap();
    wait_for_output(&mut rx, "ready").await;

    let started = Instant::now();
    let outcome = orch.force_cancel_build(&id).await.unwrap();
    assert!(outcome.transitioned);

    // The stored build is cancelled as soon as the call returns
    let stored = gateway.get_build(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, BuildStatus::Cancelled);

    let report = tokio::time::timeout(Duration::from_secs(10), orch.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert!(started.elapsed() < GRACE + Duration::from_secs(2));
    assert_eq!(report.build.status, BuildStatus::Cancelled);
    assert_eq!(report.stages[0].status, StageStatus::Cancelled);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);

    // Exactly one terminal event, from the force cancel itself
    let mut finals = 0;
    while let Ok(event) = rx.try_recv() {
        if event.is_final() {
            finals += 1;
        }
    }
    assert_eq!(finals, 1);
}

#[tokio::test]
async fn test_repeated_cancel_is_noop() {
    let (orch, _gateway, mut rx) = setup();
    let id = orch.start_build(stubborn_config()).await.unwrap();
    wait_for_output(&mut rx, "ready").await;

    assert!(orch.cancel_build(&id).await.unwrap());
    assert!(!orch.cancel_build(&id).await.unwrap());
    let report = orch.wait(&id).await.unwrap();
    assert_eq!(report.build.status, BuildStatus::Cancelled);

    // Finished builds ignore both kinds of cancel
    assert!(!orch.cancel_build(&id).await.unwrap());
    let outcome = orch.force_cancel_build(&id).await.unwrap();
    assert!(!outcome.transitioned);
    assert_eq!(
        orch.status(&id).await.unwrap().build.status,
        BuildStatus::Cancelled
    );
}

#[tokio::test]
async fn test_force_cancel_without_worker() {
    let (orch, gateway, _rx) = setup();

    // A build left running by a process that no longer exists
    let mut build = Build::new("lfs-orphan-1".to_string(), "lfs".to_string(), 2);
    gateway.create_build(&build).await.unwrap();
    let mut running = Stage::new("build_toolchain".to_string(), 1);
    let pending = Stage::new("build_system".to_string(), 2);
    gateway
        .insert_stages(&build.build_id, &[running.clone(), pending])
        .await
        .unwrap();
    build.status = BuildStatus::Running;
    gateway.update_build(&build).await.unwrap();
    running.start(Utc::now());
    gateway.update_stage(&build.build_id, &running).await.unwrap();

    // Leftover process that carries the build id on its command line
    let mut leftover = tokio::process::Command::new("bash")
        .arg("-c")
        .arg("while :; do sleep 0.1; done")
        .arg(format!("lfsbuild-{}", build.build_id))
        .kill_on_drop(true)
        .spawn()
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let outcome = orch.force_cancel_build(&build.build_id).await.unwrap();
    assert!(outcome.transitioned);
    assert!(outcome
        .terminated
        .iter()
        .any(|p| Some(p.pid) == leftover.id()));

    let status = tokio::time::timeout(Duration::from_secs(5), leftover.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!status.success());

    let report = orch.status(&build.build_id).await.unwrap();
    assert_eq!(report.build.status, BuildStatus::Cancelled);
    assert_eq!(report.stages[0].status, StageStatus::Cancelled);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);

    // The owning process, if any, is told through the control queue
    let controls = gateway.take_controls(&build.build_id).await.unwrap();
    assert_eq!(controls.len(), 1);
}

#[tokio::test]
async fn test_force_cancel_from_other_process_skips_rollback() {
    let dir = tempfile::TempDir::new().unwrap();
    let gateway = Arc::new(MemoryGateway::new());

    // The owner only polls for queued controls long after the kill lands
    let (sink, mut rx) = ChannelSink::new();
    let owner = Orchestrator::from_settings(
        gateway.clone(),
        Arc::new(sink),
        ExecutionSettings {
            grace_period: GRACE,
            control_poll_interval: Duration::from_secs(5),
            kill_patterns: Vec::new(),
            ..Default::default()
        },
    );
    let (remote_sink, _remote_rx) = ChannelSink::new();
    let remote = Orchestrator::from_settings(
        gateway.clone(),
        Arc::new(remote_sink),
        ExecutionSettings {
            grace_period: GRACE,
            kill_patterns: Vec::new(),
            ..Default::default()
        },
    );

    let yaml = format!(
        r#"
name: lfs
working_dir: {}
stages:
  - {{ name: build_toolchain, order: 1, command: "echo ready; sleep 30", rollback_command: "echo ROLLED_BACK" }}
  - {{ name: build_system, order: 2, command: "true" }}
"#,
        dir.path().display()
    );
    let id = owner
        .start_build(BuildConfig::from_yaml(&yaml).unwrap())
        .await
        .unwrap();
    wait_for_output(&mut rx, "ready").await;

    let outcome = remote.force_cancel_build(&id).await.unwrap();
    assert!(outcome.transitioned);
    assert!(!outcome.terminated.is_empty());

    let report = tokio::time::timeout(Duration::from_secs(3), owner.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.build.status, BuildStatus::Cancelled);
    assert_eq!(report.stages[0].status, StageStatus::Cancelled);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);

    let docs = gateway.list_documents(&id, None).await.unwrap();
    assert!(docs.iter().all(|d| d.metadata["rollback"] != true));
    assert!(docs.iter().all(|d| d.document_type != DocumentType::Error));
    assert!(docs.iter().all(|d| !d.content.contains("ROLLED_BACK")));

    while let Ok(event) = rx.try_recv() {
        assert!(!matches!(
            event,
            BuildEvent::StageComplete {
                status: StageStatus::Failed,
                ..
            }
        ));
    }
}
