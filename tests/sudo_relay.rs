//! Privilege prompts relayed from a running stage to the event consumer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use lfsbuild::adapters::{ChannelSink, EventSink};
use lfsbuild::config::ExecutionSettings;
use lfsbuild::core::process::DEFAULT_SUDO_PROMPT;
use lfsbuild::core::{BuildConfig, Credential, Orchestrator};
use lfsbuild::domain::{BuildEvent, BuildReport, BuildStatus, DocumentType, StageStatus};
use lfsbuild::store::{MemoryGateway, PersistenceGateway};

/// Run a build and answer every sudo request with `answer`.
/// Returns the report and how many requests were seen.
async fn run_answering(
    yaml: &str,
    answer: Option<&'static str>,
) -> (BuildReport, usize, Arc<MemoryGateway>) {
    let gateway = Arc::new(MemoryGateway::new());
    let (sink, mut rx) = ChannelSink::new();
    let sink: Arc<dyn EventSink> = Arc::new(sink);
    let settings = ExecutionSettings {
        grace_period: Duration::from_millis(300),
        flush_interval: Duration::from_millis(100),
        ..Default::default()
    };
    let orch = Orchestrator::from_settings(gateway.clone(), sink, settings);

    let requests = Arc::new(AtomicUsize::new(0));
    let responder = {
        let orch = orch.clone();
        let requests = requests.clone();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let BuildEvent::SudoRequired { build_id, .. } = event {
                    requests.fetch_add(1, Ordering::SeqCst);
                    orch.supply_credential(&build_id, answer.map(Credential::new));
                }
            }
        })
    };

    let config = BuildConfig::from_yaml(yaml).unwrap();
    let report = tokio::time::timeout(Duration::from_secs(20), orch.run_build(config))
        .await
        .unwrap()
        .unwrap();
    responder.abort();

    (report, requests.load(Ordering::SeqCst), gateway)
}

fn prompting_stage(name: &str, order: i64) -> String {
    format!(
        "  - {{ name: {}, order: {}, command: 'echo \"{}\"; read -r pw; echo \"len:${{#pw}}\"' }}\n",
        name, order, DEFAULT_SUDO_PROMPT
    )
}

#[tokio::test]
async fn test_credential_reaches_stage_stdin() {
    let yaml = format!("name: lfs\nstages:\n{}", prompting_stage("create_partition", 1));
    let (report, requests, gateway) = run_answering(&yaml, Some("hunter2")).await;

    assert_eq!(requests, 1);
    assert_eq!(report.build.status, BuildStatus::Success);
    let output = &report.stages[0].output_log;
    assert!(output.contains("len:7"));

    // The secret itself never lands in stored logs
    assert!(!output.contains("hunter2"));
    let docs = gateway
        .list_documents(&report.build.build_id, None)
        .await
        .unwrap();
    assert!(docs.iter().all(|d| !d.content.contains("hunter2")));
}

#[tokio::test]
async fn test_credential_is_reused_within_build() {
    let yaml = format!(
        "name: lfs\nstages:\n{}{}",
        prompting_stage("create_partition", 1),
        prompting_stage("build_kernel", 2)
    );
    let (report, requests, _gateway) = run_answering(&yaml, Some("hunter2")).await;

    assert_eq!(report.build.status, BuildStatus::Success);
    assert_eq!(requests, 1);
    assert!(report.stages[1].output_log.contains("len:7"));
}

#[tokio::test]
async fn test_declined_credential_fails_stage() {
    let yaml = format!(
        "name: lfs\nstages:\n{}  - {{ name: after, order: 2, command: \"true\" }}\n",
        prompting_stage("create_partition", 1)
    );
    let (report, requests, gateway) = run_answering(&yaml, None).await;

    assert_eq!(requests, 1);
    assert_eq!(report.build.status, BuildStatus::Failed);
    assert_eq!(report.stages[0].status, StageStatus::Failed);
    assert_eq!(report.stages[1].status, StageStatus::Skipped);
    assert!(!report.stages[0].output_log.contains("len:"));

    let docs = gateway
        .list_documents(&report.build.build_id, Some("create_partition"))
        .await
        .unwrap();
    let error = docs
        .iter()
        .find(|d| d.document_type == DocumentType::Error)
        .unwrap();
    assert!(error.metadata["failure"]
        .as_str()
        .unwrap()
        .contains("declined"));
}

#[tokio::test]
async fn test_cancel_while_awaiting_credential() {
    let gateway = Arc::new(MemoryGateway::new());
    let (sink, mut rx) = ChannelSink::new();
    let settings = ExecutionSettings {
        grace_period: Duration::from_millis(300),
        control_poll_interval: Duration::from_millis(50),
        kill_patterns: Vec::new(),
        ..Default::default()
    };
    let orch = Orchestrator::from_settings(gateway.clone(), Arc::new(sink), settings);

    let yaml = format!(
        "name: lfs\nstages:\n  - {{ name: create_partition, order: 1, command: 'echo \"{}\"; read -r pw; echo \"len:${{#pw}}\"', rollback_command: 'echo undone' }}\n",
        DEFAULT_SUDO_PROMPT
    );
    let id = orch
        .start_build(BuildConfig::from_yaml(&yaml).unwrap())
        .await
        .unwrap();

    // Nobody answers the request
    let asked = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(event) = rx.recv().await {
            if matches!(event, BuildEvent::SudoRequired { .. }) {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    assert!(asked);

    assert!(orch.cancel_build(&id).await.unwrap());
    let report = tokio::time::timeout(Duration::from_secs(3), orch.wait(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.build.status, BuildStatus::Cancelled);
    assert_eq!(report.stages[0].status, StageStatus::Cancelled);
    assert!(!report.stages[0].output_log.contains("len:"));

    let docs = gateway.list_documents(&id, Some("create_partition")).await.unwrap();
    assert!(docs.iter().all(|d| d.metadata["rollback"] != true));
    assert!(docs.iter().all(|d| d.document_type != DocumentType::Error));

    // The abandoned request leaves nothing to answer
    assert!(!orch.supply_credential(&id, Some(Credential::new("late"))));
}
