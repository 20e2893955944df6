//! End-to-end tests for the run controller.
//!
//! Everything runs in-process: `MemoryStore` for persistence,
//! `MockJobBoard` for the external board and a `LocalTaskRegistry` for poll
//! tasks.  Timer-driven behaviour uses paused tokio time, so a 30 minute
//! poll timeout completes instantly.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use chrono::Utc;
use serde_json::{json, Value};
use uuid::Uuid;

use db::models::{NodeRunStatus, RunStatus};
use db::{MemoryStore, Store};
use jobboard::mock::{MockJobBoard, MockReply};
use jobboard::{JobStatus, JobWebhook};
use nodes::mock::MockNode;
use nodes::{ExecutableNode, ExecutionContext, JobDefaults, JobNode, NodeError, NodeOutcome};
use queue::{LocalTaskRegistry, TaskRegistry};

use crate::controller::CANCELLED_ERROR;
use crate::tracker::TIMEOUT_ERROR;
use crate::{
    Edge, EngineConfig, EngineError, Node, NodeRegistry, NodeType, PipelineDefinition,
    RunController, RunEvent, RunEventKind, Subscription, Topic, WebhookOutcome,
};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

struct Harness {
    controller: RunController,
    store: Arc<MemoryStore>,
    board: Arc<MockJobBoard>,
    polls: LocalTaskRegistry,
    events: Subscription,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        Self::build(
            Arc::new(MemoryStore::new()),
            Arc::new(MockJobBoard::new()),
            config,
        )
    }

    fn build(store: Arc<MemoryStore>, board: Arc<MockJobBoard>, config: EngineConfig) -> Self {
        let nodes = NodeRegistry::standard(board.clone(), JobDefaults::default());
        Self::assemble(store, board, nodes, config)
    }

    /// Standard registry with `job` nodes handled by `node`.
    fn with_job_node(node: Arc<dyn ExecutableNode>, config: EngineConfig) -> Self {
        let board = Arc::new(MockJobBoard::new());
        let nodes = NodeRegistry::standard(board.clone(), JobDefaults::default())
            .with(NodeType::Job, node);
        Self::assemble(Arc::new(MemoryStore::new()), board, nodes, config)
    }

    fn assemble(
        store: Arc<MemoryStore>,
        board: Arc<MockJobBoard>,
        nodes: NodeRegistry,
        config: EngineConfig,
    ) -> Self {
        let polls = LocalTaskRegistry::new();
        let controller = RunController::new(
            store.clone(),
            board.clone(),
            nodes,
            Arc::new(polls.clone()),
            config,
        );
        let events = controller.events().subscribe(Topic::All);
        Self {
            controller,
            store,
            board,
            polls,
            events,
        }
    }

    async fn pipeline(&self, nodes: Vec<Node>, edges: &[(&str, &str)]) -> Uuid {
        let def = PipelineDefinition::new(
            nodes,
            edges.iter().map(|(s, t)| Edge::new(*s, *t)).collect(),
        );
        self.store
            .create_pipeline("test", None, def.to_value().unwrap())
            .await
            .unwrap()
            .id
    }

    async fn status_of(&self, run_id: Uuid, node_id: &str) -> NodeRunStatus {
        self.store.get_node_run(run_id, node_id).await.unwrap().status
    }

    async fn job_of(&self, run_id: Uuid, node_id: &str) -> String {
        self.store
            .get_node_run(run_id, node_id)
            .await
            .unwrap()
            .job_id
            .expect("node should have delegated")
    }

    /// Collect events until one of `kind` arrives.
    async fn wait_for(&mut self, kind: RunEventKind) -> Vec<RunEvent> {
        let mut seen = Vec::new();
        tokio::time::timeout(Duration::from_secs(2 * 60 * 60), async {
            while let Some(event) = self.events.recv().await {
                let done = event.kind == kind;
                seen.push(event);
                if done {
                    break;
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {kind}"));
        seen
    }

    fn drain(&mut self) -> Vec<RunEvent> {
        std::iter::from_fn(|| self.events.try_recv()).collect()
    }
}

fn linear() -> (Vec<Node>, Vec<(&'static str, &'static str)>) {
    (
        vec![
            Node::new("start", NodeType::Start),
            Node::new("job_a", NodeType::Job),
            Node::new("job_b", NodeType::Job),
            Node::new("end", NodeType::End),
        ],
        vec![("start", "job_a"), ("job_a", "job_b"), ("job_b", "end")],
    )
}

fn diamond() -> (Vec<Node>, Vec<(&'static str, &'static str)>) {
    (
        vec![
            Node::new("start", NodeType::Start),
            Node::new("a", NodeType::Job),
            Node::new("b", NodeType::Job),
            Node::new("merge", NodeType::Condition).with_config(json!({
                "condition": "node_outputs.a.result.ok && node_outputs.b.result.ok"
            })),
            Node::new("end", NodeType::End),
        ],
        vec![
            ("start", "a"),
            ("start", "b"),
            ("a", "merge"),
            ("b", "merge"),
            ("merge", "end"),
        ],
    )
}

fn single_job() -> (Vec<Node>, Vec<(&'static str, &'static str)>) {
    (
        vec![
            Node::new("start", NodeType::Start),
            Node::new("a", NodeType::Job),
            Node::new("end", NodeType::End),
        ],
        vec![("start", "a"), ("a", "end")],
    )
}

fn count(events: &[RunEvent], kind: RunEventKind, node_id: Option<&str>) -> usize {
    events
        .iter()
        .filter(|e| e.kind == kind && (node_id.is_none() || e.node_id.as_deref() == node_id))
        .count()
}

fn position(events: &[RunEvent], kind: RunEventKind, node_id: &str) -> usize {
    events
        .iter()
        .position(|e| e.kind == kind && e.node_id.as_deref() == Some(node_id))
        .unwrap_or_else(|| panic!("no {kind} event for {node_id}"))
}

fn webhook(job_id: &str, status: JobStatus, result: Option<Value>, error: Option<&str>) -> JobWebhook {
    JobWebhook {
        job_id: job_id.into(),
        status,
        result,
        error: error.map(str::to_owned),
        metadata: None,
    }
}

// ============================================================
// Scenarios
// ============================================================

#[tokio::test(start_paused = true)]
async fn linear_chain_runs_nodes_in_dependency_order() {
    let mut h = Harness::new();
    let (nodes, edges) = linear();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h
        .controller
        .start_run(pipeline_id, json!({ "topic": "rust" }))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);

    // `start` completed synchronously; only job_a has been dispatched.
    assert_eq!(h.status_of(run.id, "start").await, NodeRunStatus::Completed);
    assert_eq!(h.status_of(run.id, "job_a").await, NodeRunStatus::Running);
    assert_eq!(h.status_of(run.id, "job_b").await, NodeRunStatus::Pending);
    assert_eq!(h.board.created().len(), 1);

    h.board.script("job-1", vec![MockReply::progress(50.0), MockReply::completed(json!({ "text": "a" }))]);
    h.board.script("job-2", vec![MockReply::completed(json!({ "text": "b" }))]);

    let mut events = h.wait_for(RunEventKind::RunCompleted).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    events.extend(h.drain());

    let details = h.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Completed);
    assert!(details.node_runs.iter().all(|n| n.status == NodeRunStatus::Completed));

    let output = details.run.output.clone().unwrap();
    assert_eq!(output["job_a"]["result"], json!({ "text": "a" }));
    assert_eq!(output["job_b"]["job_id"], "job-2");
    assert_eq!(output["start"]["topic"], "rust");

    // job_b saw job_a's output in its input context.
    let job_b_input = details.node("job_b").unwrap().input.clone().unwrap();
    assert_eq!(job_b_input["node_outputs"]["job_a"]["result"]["text"], "a");
    assert_eq!(job_b_input["topic"], "rust");

    assert!(position(&events, RunEventKind::NodeCompleted, "job_a") < position(&events, RunEventKind::NodeStarted, "job_b"));
    assert!(count(&events, RunEventKind::JobProgress, Some("job_a")) >= 2);
    assert_eq!(count(&events, RunEventKind::RunCompleted, None), 1);
    assert_eq!(h.polls.active_count(), 0);

    let created = h.board.created();
    assert_eq!(created.len(), 2);
    assert_eq!(created[0].title, "job_a");
    assert_eq!(created[0].description, "Execute node: job_a");
    assert_eq!(created[0].metadata["run_id"], json!(run.id.to_string()));
}

#[tokio::test(start_paused = true)]
async fn diamond_merge_waits_for_both_branches() {
    let mut h = Harness::new();
    let (nodes, edges) = diamond();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Running);
    assert_eq!(h.status_of(run.id, "b").await, NodeRunStatus::Running);

    let job_a = h.job_of(run.id, "a").await;
    let job_b = h.job_of(run.id, "b").await;

    // b finishes first; merge must keep waiting for a.
    h.board.script(&job_b, vec![MockReply::completed(json!({ "ok": true }))]);
    tokio::time::sleep(Duration::from_secs(6)).await;
    assert_eq!(h.status_of(run.id, "b").await, NodeRunStatus::Completed);
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Running);
    assert_eq!(h.status_of(run.id, "merge").await, NodeRunStatus::Pending);

    h.board.script(&job_a, vec![MockReply::completed(json!({ "ok": true }))]);
    let events = h.wait_for(RunEventKind::RunCompleted).await;

    assert!(position(&events, RunEventKind::NodeCompleted, "a") < position(&events, RunEventKind::NodeStarted, "merge"));
    assert!(position(&events, RunEventKind::NodeCompleted, "b") < position(&events, RunEventKind::NodeStarted, "merge"));

    let merge = h.store.get_node_run(run.id, "merge").await.unwrap();
    assert_eq!(merge.output.unwrap()["condition_result"], true);
}

#[tokio::test(start_paused = true)]
async fn node_failure_fails_the_run_and_strands_downstream_nodes() {
    let mut h = Harness::new();
    let (nodes, edges) = diamond();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    let job_a = h.job_of(run.id, "a").await;
    let job_b = h.job_of(run.id, "b").await;
    h.board.script(&job_a, vec![MockReply::failed("boom")]);

    let events = h.wait_for(RunEventKind::RunFailed).await;
    assert_eq!(count(&events, RunEventKind::NodeFailed, Some("a")), 1);
    assert_eq!(events.last().unwrap().error.as_deref(), Some("Node a failed: boom"));

    let details = h.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Failed);
    let output = details.run.output.clone().unwrap();
    assert_eq!(output["failed_node"], "a");
    assert_eq!(output["error"], "Node a failed: boom");
    assert_eq!(details.node("a").unwrap().error.as_deref(), Some("boom"));

    // Polling for b stopped with the run.
    assert_eq!(h.polls.active_count(), 0);
    let polls_of_b = h.board.poll_count(&job_b);
    tokio::time::sleep(Duration::from_secs(10 * 60)).await;
    assert_eq!(h.board.poll_count(&job_b), polls_of_b);

    assert_eq!(h.status_of(run.id, "merge").await, NodeRunStatus::Pending);
    assert_eq!(h.status_of(run.id, "end").await, NodeRunStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn cancellation_fails_open_nodes_and_stops_polling() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Running);
    assert_eq!(h.status_of(run.id, "end").await, NodeRunStatus::Pending);
    assert_eq!(h.polls.active_count(), 1);
    h.drain();

    let cancelled = h.controller.cancel_run(run.id).await.unwrap();
    assert_eq!(cancelled.status, RunStatus::Failed);
    assert_eq!(cancelled.output.as_ref().unwrap()["cancelled"], true);
    assert!(cancelled.output.as_ref().unwrap()["cancelled_at"].is_string());

    for node_id in ["a", "end"] {
        let node = h.store.get_node_run(run.id, node_id).await.unwrap();
        assert_eq!(node.status, NodeRunStatus::Failed);
        assert_eq!(node.error.as_deref(), Some(CANCELLED_ERROR));
    }
    assert_eq!(h.status_of(run.id, "start").await, NodeRunStatus::Completed);
    assert_eq!(h.polls.active_count(), 0);
    assert_eq!(h.board.cancelled(), vec!["job-1".to_owned()]);

    let events = h.drain();
    assert_eq!(count(&events, RunEventKind::NodeFailed, None), 2);
    assert_eq!(count(&events, RunEventKind::RunFailed, None), 1);

    let again = h.controller.cancel_run(run.id).await.unwrap_err();
    assert!(matches!(
        again,
        EngineError::InvalidRunState { status: RunStatus::Failed, .. }
    ));
}

#[tokio::test(start_paused = true)]
async fn job_that_never_finishes_times_out() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    h.wait_for(RunEventKind::RunFailed).await;

    let node = h.store.get_node_run(run.id, "a").await.unwrap();
    assert_eq!(node.status, NodeRunStatus::Failed);
    assert_eq!(node.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(h.polls.active_count(), 0);

    // One tick every 5 s for 30 minutes, then nothing more.
    let polls = h.board.poll_count("job-1");
    assert!((300..=400).contains(&polls), "polled {polls} times");
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.board.poll_count("job-1"), polls);
}

#[tokio::test(start_paused = true)]
async fn repeated_query_errors_fail_the_node() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    h.board.script("job-1", vec![MockReply::query_error("board offline")]);

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    h.wait_for(RunEventKind::RunFailed).await;

    let node = h.store.get_node_run(run.id, "a").await.unwrap();
    let error = node.error.unwrap();
    assert!(error.starts_with("Failed to poll job status:"), "{error}");
    assert!(error.contains("board offline"));
    // Three retries after the first failure.
    assert_eq!(h.board.poll_count("job-1"), 4);
}

#[tokio::test(start_paused = true)]
async fn successful_query_resets_the_error_budget() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    h.board.script(
        "job-1",
        vec![
            MockReply::query_error("blip"),
            MockReply::query_error("blip"),
            MockReply::query_error("blip"),
            MockReply::progress(40.0),
            MockReply::query_error("blip"),
            MockReply::query_error("blip"),
            MockReply::query_error("blip"),
            MockReply::completed(json!("done")),
        ],
    );

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    h.wait_for(RunEventKind::RunCompleted).await;
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn webhook_and_poll_race_yields_one_transition() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    h.board.script("job-1", vec![MockReply::completed(json!({ "from": "poll" }))]);

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();

    let (outcome, applied) = tokio::join!(
        h.controller.handle_webhook(webhook(
            "job-1",
            JobStatus::Completed,
            Some(json!({ "from": "webhook" })),
            None
        )),
        h.controller.complete_node(run.id, "a", json!({ "from": "direct" })),
    );
    let outcome = outcome.unwrap();
    let applied = applied.unwrap();
    assert!(usize::from(outcome == WebhookOutcome::Completed) + usize::from(applied) <= 1);

    let mut events = h.wait_for(RunEventKind::RunCompleted).await;
    tokio::time::sleep(Duration::from_secs(60)).await;
    events.extend(h.drain());
    assert_eq!(count(&events, RunEventKind::NodeCompleted, Some("a")), 1);
    assert_eq!(count(&events, RunEventKind::RunCompleted, None), 1);

    // Anything after the fact is stale.
    let stale = h
        .controller
        .handle_webhook(webhook("job-1", JobStatus::Done, None, None))
        .await
        .unwrap();
    assert_eq!(stale, WebhookOutcome::Stale);

    let details = h.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Completed);
}

#[tokio::test(start_paused = true)]
async fn webhook_completion_stops_polling() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();

    let outcome = h
        .controller
        .handle_webhook(webhook("job-1", JobStatus::Completed, Some(json!(7)), None))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Completed);
    assert_eq!(h.polls.active_count(), 0);

    let events = h.wait_for(RunEventKind::RunCompleted).await;
    assert_eq!(count(&events, RunEventKind::NodeCompleted, Some("a")), 1);

    let node = h.store.get_node_run(run.id, "a").await.unwrap();
    assert_eq!(
        node.output.unwrap(),
        json!({ "job_id": "job-1", "result": 7, "webhook_received": true })
    );
}

#[tokio::test(start_paused = true)]
async fn webhook_non_terminal_and_unknown_jobs_change_nothing() {
    let h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();

    let ack = h
        .controller
        .handle_webhook(webhook("job-1", JobStatus::InProgress, None, None))
        .await
        .unwrap();
    assert_eq!(ack, WebhookOutcome::Acknowledged);
    assert_eq!(h.polls.active_count(), 1);
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Running);

    let unknown = h
        .controller
        .handle_webhook(webhook("job-404", JobStatus::Completed, None, None))
        .await
        .unwrap();
    assert_eq!(unknown, WebhookOutcome::UnknownJob);
}

#[tokio::test(start_paused = true)]
async fn webhook_failure_fails_the_run() {
    let mut h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();

    let outcome = h
        .controller
        .handle_webhook(webhook("job-1", JobStatus::Cancelled, None, None))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Failed);

    h.wait_for(RunEventKind::RunFailed).await;
    let details = h.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.output.unwrap()["error"], "Node a failed: Job cancelled");
    assert_eq!(h.status_of(run.id, "end").await, NodeRunStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn registering_a_live_poll_again_is_a_no_op() {
    let h = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;
    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();

    assert!(!h.controller.register_poll(run.id, "a", "job-1", Utc::now()));
    assert_eq!(h.polls.active_count(), 1);

    let status = h.controller.polling_status();
    assert_eq!(status.active_count, 1);
    assert_eq!(status.keys, vec![format!("{}:a", run.id)]);
}

#[tokio::test(start_paused = true)]
async fn resume_polling_picks_up_inflight_jobs() {
    let first = Harness::new();
    let (nodes, edges) = single_job();
    let pipeline_id = first.pipeline(nodes, &edges).await;
    let run = first.controller.start_run(pipeline_id, json!({})).await.unwrap();

    // Simulate a restart: the old process's poll tasks are gone.
    first.polls.cancel_run(run.id);
    let store = Arc::clone(&first.store);
    let board = Arc::clone(&first.board);
    drop(first);

    let mut second = Harness::build(store, board, EngineConfig::default());
    assert_eq!(second.controller.resume_polling().await.unwrap(), 1);
    assert_eq!(second.controller.resume_polling().await.unwrap(), 0);

    second.board.script("job-1", vec![MockReply::completed(json!("late"))]);
    second.wait_for(RunEventKind::RunCompleted).await;
    let details = second.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Completed);
}

#[tokio::test]
async fn synchronous_pipeline_completes_exactly_once() {
    let mut h = Harness::new();
    let pipeline_id = h
        .pipeline(
            vec![
                Node::new("start", NodeType::Start),
                Node::new("check", NodeType::Condition)
                    .with_config(json!({ "condition": "input.topic == 'rust'" })),
                Node::new("end", NodeType::End),
            ],
            &[("start", "check"), ("check", "end")],
        )
        .await;

    let run = h
        .controller
        .start_run(pipeline_id, json!({ "topic": "rust" }))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(run.output.as_ref().unwrap()["check"]["condition_result"], true);

    let events = h.drain();
    assert_eq!(events.first().unwrap().kind, RunEventKind::RunStarted);
    assert_eq!(count(&events, RunEventKind::RunCompleted, None), 1);
    assert_eq!(count(&events, RunEventKind::NodeCompleted, None), 3);
    assert!(h.board.created().is_empty());
}

#[tokio::test]
async fn job_submission_failure_fails_the_run() {
    let store = Arc::new(MemoryStore::new());
    let board = Arc::new(MockJobBoard::failing_create("board down"));
    let mut h = Harness::build(store, board, EngineConfig::default());
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);

    let node = h.store.get_node_run(run.id, "a").await.unwrap();
    assert!(node.error.unwrap().contains("board down"));
    assert_eq!(h.status_of(run.id, "end").await, NodeRunStatus::Pending);
    assert_eq!(count(&h.drain(), RunEventKind::RunFailed, None), 1);
}

#[tokio::test]
async fn cyclic_pipeline_is_rejected_before_a_run_exists() {
    let h = Harness::new();
    let pipeline_id = h
        .pipeline(
            vec![Node::new("a", NodeType::Job), Node::new("b", NodeType::Job)],
            &[("a", "b"), ("b", "a")],
        )
        .await;

    let err = h.controller.start_run(pipeline_id, json!({})).await.unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected));
    assert!(h.controller.list_runs(pipeline_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn unknown_ids_are_reported() {
    let h = Harness::new();
    let missing = Uuid::new_v4();

    assert!(matches!(
        h.controller.start_run(missing, json!({})).await,
        Err(EngineError::PipelineNotFound(id)) if id == missing
    ));
    assert!(matches!(
        h.controller.cancel_run(missing).await,
        Err(EngineError::RunNotFound(id)) if id == missing
    ));
    assert!(matches!(
        h.controller.get_run(missing).await,
        Err(EngineError::RunNotFound(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn bounded_dispatch_still_fans_out() {
    let config = EngineConfig {
        max_parallel_dispatch: Some(1),
        ..EngineConfig::default()
    };
    let h = Harness::with_config(config);
    let (nodes, edges) = diamond();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(h.status_of(run.id, "a").await, NodeRunStatus::Running);
    assert_eq!(h.status_of(run.id, "b").await, NodeRunStatus::Running);
    assert_eq!(h.polls.active_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn late_completion_after_run_failure_is_ignored() {
    let mut h = Harness::new();
    let (nodes, edges) = diamond();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    let job_a = h.job_of(run.id, "a").await;
    let job_b = h.job_of(run.id, "b").await;

    h.controller
        .handle_webhook(webhook(&job_a, JobStatus::Failed, None, Some("boom")))
        .await
        .unwrap();
    h.wait_for(RunEventKind::RunFailed).await;

    let outcome = h
        .controller
        .handle_webhook(webhook(&job_b, JobStatus::Completed, Some(json!({ "ok": true })), None))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Stale);
    assert_eq!(h.status_of(run.id, "b").await, NodeRunStatus::Running);
    assert_eq!(count(&h.drain(), RunEventKind::NodeCompleted, Some("b")), 0);

    let details = h.controller.get_run(run.id).await.unwrap();
    assert_eq!(details.run.status, RunStatus::Failed);
    assert_eq!(details.run.output.unwrap()["failed_node"], "a");
}

/// Submits through a real `JobNode` after blocking for a while, so the
/// wave finishes well after the node was marked started.
struct SlowSubmit {
    inner: JobNode,
    delay: Duration,
}

#[async_trait]
impl ExecutableNode for SlowSubmit {
    async fn execute(&self, input: Value, ctx: &ExecutionContext) -> Result<NodeOutcome, NodeError> {
        std::thread::sleep(self.delay);
        self.inner.execute(input, ctx).await
    }
}

#[tokio::test(start_paused = true)]
async fn poll_budget_counts_from_node_start() {
    let board = Arc::new(MockJobBoard::new());
    let slow = SlowSubmit {
        inner: JobNode::new(board.clone(), JobDefaults::default()),
        delay: Duration::from_millis(50),
    };
    let config = EngineConfig {
        max_poll_duration: Duration::from_millis(20),
        ..EngineConfig::default()
    };
    let nodes = NodeRegistry::standard(board.clone(), JobDefaults::default())
        .with(NodeType::Job, Arc::new(slow));
    let mut h = Harness::assemble(Arc::new(MemoryStore::new()), board, nodes, config);
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    h.wait_for(RunEventKind::RunFailed).await;

    // The budget was spent before the first tick, so the job is never queried.
    let node = h.store.get_node_run(run.id, "a").await.unwrap();
    assert_eq!(node.error.as_deref(), Some(TIMEOUT_ERROR));
    assert_eq!(h.board.poll_count("job-1"), 0);
}

#[tokio::test]
async fn job_nodes_can_be_replaced_in_the_registry() {
    let stub = Arc::new(MockNode::returning("stub", json!({ "ok": true })));
    let mut h = Harness::with_job_node(stub.clone(), EngineConfig::default());
    let (nodes, edges) = linear();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h
        .controller
        .start_run(pipeline_id, json!({ "topic": "rust" }))
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert_eq!(stub.called_for(), vec!["job_a".to_owned(), "job_b".to_owned()]);
    assert!(h.board.created().is_empty());

    // job_b saw job_a's output in its input context.
    let (_, job_b_input) = stub.calls.lock().unwrap()[1].clone();
    assert_eq!(job_b_input["node_outputs"]["job_a"]["node"], "stub");
    assert_eq!(job_b_input["topic"], "rust");
    assert_eq!(count(&h.drain(), RunEventKind::RunCompleted, None), 1);
}

#[tokio::test]
async fn node_implementation_error_fails_the_run() {
    let stub = Arc::new(MockNode::failing("stub", "no capacity"));
    let mut h = Harness::with_job_node(stub.clone(), EngineConfig::default());
    let (nodes, edges) = linear();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.output.unwrap()["error"], "Node job_a failed: no capacity");
    assert_eq!(stub.call_count(), 1);
    assert_eq!(h.status_of(run.id, "job_b").await, NodeRunStatus::Pending);
    assert_eq!(count(&h.drain(), RunEventKind::NodeFailed, Some("job_a")), 1);
}

#[tokio::test(start_paused = true)]
async fn externally_delegated_node_completes_by_webhook() {
    let stub = Arc::new(MockNode::delegating("stub", "ext-7"));
    let mut h = Harness::with_job_node(stub, EngineConfig::default());
    let (nodes, edges) = single_job();
    let pipeline_id = h.pipeline(nodes, &edges).await;

    let run = h.controller.start_run(pipeline_id, json!({})).await.unwrap();
    assert_eq!(h.job_of(run.id, "a").await, "ext-7");
    assert_eq!(h.polls.active_count(), 1);

    let outcome = h
        .controller
        .handle_webhook(webhook("ext-7", JobStatus::Done, Some(json!("ok")), None))
        .await
        .unwrap();
    assert_eq!(outcome, WebhookOutcome::Completed);
    h.wait_for(RunEventKind::RunCompleted).await;
    assert_eq!(h.polls.active_count(), 0);
}
