//! Execution semantics: contract gating, failure cascades, the layer
//! barrier, timeouts and true within-layer concurrency.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use epicflow::{
    AgentRegistry, AgentRequest, AgentResponse, EpicConfig, EpicCoordinator, EpicPlan, EpicStatus,
    ExecutionAgent, SprintStatus, TransitionStore,
};
use serde_json::json;

/// Scripted agent: logs start/end markers, honors per-sprint delays and
/// failures, and records every request it receives.
struct ScriptedAgent {
    log: Arc<Mutex<Vec<String>>>,
    requests: Arc<Mutex<HashMap<String, AgentRequest>>>,
    fail: HashSet<String>,
    delay_ms: HashMap<String, u64>,
    rendezvous: Option<Arc<tokio::sync::Barrier>>,
}

impl ScriptedAgent {
    fn new() -> Self {
        Self {
            log: Arc::new(Mutex::new(Vec::new())),
            requests: Arc::new(Mutex::new(HashMap::new())),
            fail: HashSet::new(),
            delay_ms: HashMap::new(),
            rendezvous: None,
        }
    }

    fn failing(mut self, sprint_id: &str) -> Self {
        self.fail.insert(sprint_id.to_string());
        self
    }

    fn delayed(mut self, sprint_id: &str, ms: u64) -> Self {
        self.delay_ms.insert(sprint_id.to_string(), ms);
        self
    }

    fn with_rendezvous(mut self, barrier: Arc<tokio::sync::Barrier>) -> Self {
        self.rendezvous = Some(barrier);
        self
    }

    fn log_snapshot(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn request_for(&self, sprint_id: &str) -> Option<AgentRequest> {
        self.requests.lock().unwrap().get(sprint_id).cloned()
    }

    fn invoked(&self, sprint_id: &str) -> bool {
        self.log_snapshot()
            .iter()
            .any(|entry| entry == &format!("start:{}", sprint_id))
    }
}

#[async_trait]
impl ExecutionAgent for ScriptedAgent {
    fn name(&self) -> String {
        "scripted".to_string()
    }

    async fn invoke(&self, request: AgentRequest) -> Result<AgentResponse> {
        let sprint_id = request.sprint_id.clone();
        self.log.lock().unwrap().push(format!("start:{}", sprint_id));
        self.requests
            .lock()
            .unwrap()
            .insert(sprint_id.clone(), request);

        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        if let Some(ms) = self.delay_ms.get(&sprint_id) {
            tokio::time::sleep(Duration::from_millis(*ms)).await;
        }

        self.log.lock().unwrap().push(format!("end:{}", sprint_id));
        if self.fail.contains(&sprint_id) {
            Ok(AgentResponse::failed("scripted failure"))
        } else {
            Ok(AgentResponse::completed(1.0, Some(json!({ "done": sprint_id }))))
        }
    }
}

async fn run_epic(yaml: &str, agent: Arc<ScriptedAgent>) -> epicflow::EpicRunReport {
    let plan = EpicPlan::from_yaml_str(yaml).unwrap();
    let registry = Arc::new(AgentRegistry::new());
    registry.register_default("scripted", agent).await.unwrap();
    let store = Arc::new(TransitionStore::temporary().unwrap());
    EpicCoordinator::new(plan, registry, store, EpicConfig::default())
        .unwrap()
        .run()
        .await
        .unwrap()
}

#[tokio::test]
async fn contract_consumer_waits_for_producer_completion() {
    // No declared dependency edge: only the contract relationship orders
    // these two sprints.
    let agent = Arc::new(ScriptedAgent::new());
    let report = run_epic(
        r#"
epic_id: contracts
name: contracts
sprints:
  - id: producer
    estimated_hours: 1.0
    produces: [token_api]
  - id: consumer
    estimated_hours: 1.0
    consumes: [token_api]
"#,
        agent.clone(),
    )
    .await;

    assert_eq!(report.status, EpicStatus::Completed);
    let log = agent.log_snapshot();
    let end_producer = log.iter().position(|e| e == "end:producer").unwrap();
    let start_consumer = log.iter().position(|e| e == "start:consumer").unwrap();
    assert!(
        end_producer < start_consumer,
        "consumer must not start before the producer finished: {log:?}"
    );

    // the consumer was handed the locked contract and the producer's output
    let request = agent.request_for("consumer").unwrap();
    assert_eq!(request.locked_contracts, vec!["token_api".to_string()]);
    assert_eq!(request.dependency_context.len(), 1);
    assert_eq!(request.dependency_context[0].sprint_id, "producer");
    assert_eq!(
        request.dependency_context[0].payload,
        Some(json!({ "done": "producer" }))
    );
}

#[tokio::test]
async fn failure_cascades_to_descendants_only() {
    let agent = Arc::new(ScriptedAgent::new().failing("s1"));
    let report = run_epic(
        r#"
epic_id: cascade
name: cascade
sprints:
  - id: s1
    estimated_hours: 1.0
  - id: s2
    estimated_hours: 1.0
    dependencies: [s1]
  - id: s3
    estimated_hours: 1.0
    dependencies: [s2]
  - id: s4
    estimated_hours: 1.0
"#,
        agent.clone(),
    )
    .await;

    assert_eq!(report.status, EpicStatus::PartiallyBlocked);

    let status_of = |id: &str| {
        report
            .sprints
            .iter()
            .find(|s| s.sprint_id == id)
            .unwrap()
            .clone()
    };
    assert_eq!(status_of("s1").status, SprintStatus::Failed);
    assert_eq!(status_of("s2").status, SprintStatus::Blocked);
    assert_eq!(status_of("s3").status, SprintStatus::Blocked);
    assert_eq!(status_of("s4").status, SprintStatus::Completed);

    // blocked sprints are never dispatched
    assert!(!agent.invoked("s2"));
    assert!(!agent.invoked("s3"));

    // reason chains name the root cause without re-deriving the graph
    let s2_reason = status_of("s2").status_reason.unwrap();
    assert!(s2_reason.contains("'s1'"), "direct reason: {s2_reason}");
    let s3_reason = status_of("s3").status_reason.unwrap();
    assert!(s3_reason.contains("root cause"), "transitive reason: {s3_reason}");
    assert!(s3_reason.contains("'s1'"), "transitive reason: {s3_reason}");

    let unfinished = report.unfinished();
    assert_eq!(unfinished.len(), 3);
}

#[tokio::test]
async fn all_failed_epic_is_failed_not_partially_blocked() {
    let agent = Arc::new(ScriptedAgent::new().failing("only"));
    let report = run_epic(
        r#"
epic_id: all-fail
name: all-fail
sprints:
  - id: only
    estimated_hours: 1.0
"#,
        agent,
    )
    .await;
    assert_eq!(report.status, EpicStatus::Failed);
}

#[tokio::test]
async fn later_layer_never_starts_before_earlier_layer_resolves() {
    // "slow" drags layer 0 out; "fast" finishes immediately. The layer-1
    // sprint must still wait for both.
    let agent = Arc::new(ScriptedAgent::new().delayed("slow", 150));
    let report = run_epic(
        r#"
epic_id: barrier
name: barrier
sprints:
  - id: slow
    estimated_hours: 1.0
  - id: fast
    estimated_hours: 1.0
  - id: downstream
    estimated_hours: 1.0
    dependencies: [slow, fast]
"#,
        agent.clone(),
    )
    .await;

    assert_eq!(report.status, EpicStatus::Completed);
    let log = agent.log_snapshot();
    let start_downstream = log.iter().position(|e| e == "start:downstream").unwrap();
    for upstream in ["slow", "fast"] {
        let end = log.iter().position(|e| e == &format!("end:{upstream}")).unwrap();
        assert!(
            end < start_downstream,
            "downstream started before '{upstream}' resolved: {log:?}"
        );
    }
}

#[tokio::test]
async fn sprints_within_a_layer_run_concurrently() {
    // Both sprints wait on the same rendezvous point inside the agent; the
    // epic can only complete if they are actually in flight together.
    let barrier = Arc::new(tokio::sync::Barrier::new(2));
    let agent = Arc::new(ScriptedAgent::new().with_rendezvous(barrier));
    let report = tokio::time::timeout(
        Duration::from_secs(10),
        run_epic(
            r#"
epic_id: concurrent
name: concurrent
sprints:
  - id: left
    estimated_hours: 1.0
  - id: right
    estimated_hours: 1.0
"#,
            agent,
        ),
    )
    .await
    .expect("layer sprints were not dispatched concurrently");
    assert_eq!(report.status, EpicStatus::Completed);
}

#[tokio::test]
async fn timed_out_sprint_fails_and_cascades() {
    let plan = EpicPlan::from_yaml_str(
        r#"
epic_id: timeouts
name: timeouts
sprints:
  - id: hang
    estimated_hours: 1.0
  - id: after
    estimated_hours: 1.0
    dependencies: [hang]
"#,
    )
    .unwrap();

    let agent = Arc::new(ScriptedAgent::new().delayed("hang", 2500));
    let registry = Arc::new(AgentRegistry::new());
    registry
        .register_default("scripted", agent)
        .await
        .unwrap();
    let store = Arc::new(TransitionStore::temporary().unwrap());
    let config = EpicConfig {
        sprint_timeout_seconds: 1,
        ..EpicConfig::default()
    };

    let report = EpicCoordinator::new(plan, registry, store, config)
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, EpicStatus::Failed);
    let hang = report.sprints.iter().find(|s| s.sprint_id == "hang").unwrap();
    assert_eq!(hang.status, SprintStatus::Failed);
    assert!(hang.status_reason.as_deref().unwrap().contains("timeout"));
    let after = report.sprints.iter().find(|s| s.sprint_id == "after").unwrap();
    assert_eq!(after.status, SprintStatus::Blocked);
}

#[tokio::test]
async fn report_carries_full_transition_history() {
    let agent = Arc::new(ScriptedAgent::new());
    let report = run_epic(
        r#"
epic_id: history
name: history
sprints:
  - id: s1
    estimated_hours: 1.0
"#,
        agent,
    )
    .await;

    let s1 = &report.sprints[0];
    let statuses: Vec<SprintStatus> = s1.transitions.iter().map(|t| t.status).collect();
    assert_eq!(
        statuses,
        vec![SprintStatus::Ready, SprintStatus::Running, SprintStatus::Completed]
    );
    assert!(s1.started_at.is_some());
    assert!(s1.completed_at.is_some());
    assert_eq!(s1.actual_hours, Some(1.0));
}

#[tokio::test]
async fn planner_skipped_sprint_blocks_its_consumers() {
    let agent = Arc::new(ScriptedAgent::new());
    let report = run_epic(
        r#"
epic_id: skips
name: skips
sprints:
  - id: disabled
    estimated_hours: 1.0
    skip: true
    produces: [api]
  - id: wants-api
    estimated_hours: 1.0
    consumes: [api]
  - id: independent
    estimated_hours: 1.0
"#,
        agent.clone(),
    )
    .await;

    assert_eq!(report.status, EpicStatus::PartiallyBlocked);
    let status_of = |id: &str| {
        report
            .sprints
            .iter()
            .find(|s| s.sprint_id == id)
            .unwrap()
            .status
    };
    assert_eq!(status_of("disabled"), SprintStatus::Skipped);
    assert_eq!(status_of("wants-api"), SprintStatus::Blocked);
    assert_eq!(status_of("independent"), SprintStatus::Completed);
    assert!(!agent.invoked("disabled"));
    assert!(!agent.invoked("wants-api"));
}
