//! End-to-end runs of the reasoning / approval / execution workflow against
//! scripted providers and the in-memory checkpoint store.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tollgate_types::approval::{ApprovalResponse, Resume, ResumeValue};
use tollgate_types::config::{EngineConfig, TollgateConfig};
use tollgate_types::event::WorkflowEvent;
use tollgate_types::message::{Message, ToolCall};
use tollgate_types::workflow::{RunStatus, StateUpdate, WorkflowState};

use crate::agent::{self, APPROVAL, PromptTemplate, REASONING};
use crate::llm::BoxLlmProvider;
use crate::repository::{CheckpointStore, InMemoryCheckpointStore};
use crate::testing::{CallLog, MockTools, ScriptedLlm, args};
use crate::tool::{BoxToolProvider, ToolRegistry};
use crate::workflow::engine::{CheckpointMismatch, EngineError, WorkflowEngine};
use crate::workflow::graph::{END, GraphBuilder};
use crate::workflow::node::{Node, NodeContext, NodeError, NodeOutput};

const CONFIG: &str = r#"
hidden_capabilities = ["query-dept-list"]

[[reference]]
name = "departments"
capability = "query-dept-list"
arguments = { sql = "SELECT code, name FROM Org" }

[[prefill]]
capability = "create-user"
field = "dept"
reference = "departments"
take = 2
"#;

struct Harness {
    engine: WorkflowEngine<Arc<InMemoryCheckpointStore>>,
    store: Arc<InMemoryCheckpointStore>,
    calls: CallLog,
}

impl Harness {
    async fn new(llm: ScriptedLlm) -> Self {
        Self::with_config(llm, CONFIG).await
    }

    async fn with_config(llm: ScriptedLlm, config: &str) -> Self {
        let config: TollgateConfig = toml::from_str(config).unwrap();
        let tools = MockTools::new()
            .with_tool(
                "create-user",
                json!({
                    "type": "object",
                    "properties": {"name": {"type": "string"}, "dept": {"type": "array"}},
                    "required": ["name", "dept"]
                }),
            )
            .with_tool("query-dept-list", json!({}))
            .with_result(
                "query-dept-list",
                json!([
                    {"code": "01", "name": "Sales"},
                    {"code": "02", "name": "R&D"},
                    {"code": "03", "name": "Support"}
                ]),
            )
            .with_result("create-user", json!({"id": 42, "status": "created"}));
        let calls = tools.calls();

        let registry = ToolRegistry::connect(
            BoxToolProvider::new(tools),
            &config,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let graph = agent::build_workflow(
            BoxLlmProvider::new(llm),
            Arc::new(registry),
            PromptTemplate::parse("You manage employees. Time: {system_time}").unwrap(),
            &config,
        )
        .unwrap();

        let store = Arc::new(InMemoryCheckpointStore::new());
        let engine = WorkflowEngine::new(graph, Arc::clone(&store), config.engine.clone());
        Self {
            engine,
            store,
            calls,
        }
    }

    /// Arguments of every `create-user` invocation, in order.
    fn create_calls(&self) -> Vec<serde_json::Map<String, Value>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _)| name == "create-user")
            .map(|(_, a)| a.clone())
            .collect()
    }
}

fn propose_create() -> Message {
    Message::assistant_with_calls(
        "Creating the employee.",
        vec![ToolCall::new("call-1", "create-user", args(json!({"name": "X"})))],
    )
}

fn two_turn_script() -> ScriptedLlm {
    ScriptedLlm::new(vec![propose_create(), Message::assistant("Employee X was created.")])
}

fn prefilled_depts() -> Value {
    json!([{"code": "01", "name": "Sales"}, {"code": "02", "name": "R&D"}])
}

fn assert_scenario_one_result(h: &Harness, state: &WorkflowState) {
    assert_eq!(state.len(), 4);
    let messages = state.messages();
    assert!(messages[1].has_tool_calls());
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call-1"));
    assert!(!messages[2].is_error);
    assert_eq!(messages[3].content, "Employee X was created.");
    assert!(!messages[3].has_tool_calls());

    let created = h.create_calls();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["name"], "X");
    assert_eq!(created[0]["dept"], prefilled_depts());
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn prefill_then_accept_runs_to_completion() {
    let h = Harness::new(two_turn_script()).await;
    let cancel = CancellationToken::new();

    let suspended = h
        .engine
        .start("t1", Message::user("create employee X"), &cancel)
        .await
        .unwrap();
    assert!(suspended.is_suspended());
    let request = suspended.pending.clone().unwrap();
    assert_eq!(request.capability, "create-user");
    assert_eq!(request.arguments["dept"], prefilled_depts());

    // Tool calls go to approval first; nothing has executed yet.
    let checkpoint = h.store.get("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.next_node.as_deref(), Some(APPROVAL));
    assert!(h.create_calls().is_empty());

    // The persisted history already carries what the human was shown.
    let stored_call = checkpoint
        .state
        .last_assistant()
        .unwrap()
        .last_tool_call()
        .unwrap()
        .clone();
    assert_eq!(stored_call.arguments(), &request.arguments);

    let done = h
        .engine
        .resume("t1", request.decide(ApprovalResponse::Accept), &cancel)
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.discarded_decisions, 0);
    assert_scenario_one_result(&h, &done.state);
    assert_eq!(h.engine.state("t1").await.unwrap().unwrap(), done.state);
    assert!(h.engine.pending("t1").await.unwrap().is_none());
}

#[tokio::test]
async fn edit_replaces_prefilled_arguments() {
    let h = Harness::new(two_turn_script()).await;
    let cancel = CancellationToken::new();
    h.engine
        .start("t1", Message::user("create employee X"), &cancel)
        .await
        .unwrap();

    let edit = ResumeValue::from_json(json!({
        "type": "edit",
        "args": {"name": "X", "dept": [{"code": "01"}]}
    }))
    .unwrap();
    let done = h.engine.resume("t1", Resume::new(edit), &cancel).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let created = h.create_calls();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["dept"], json!([{"code": "01"}]));

    let call = done.state.messages()[1].last_tool_call().unwrap();
    assert_eq!(call.id(), "call-1");
    assert_eq!(call.name(), "create-user");
    assert_eq!(call.arguments()["dept"], json!([{"code": "01"}]));
}

#[tokio::test]
async fn ignore_is_rejected_and_checkpoint_survives() {
    let h = Harness::new(two_turn_script()).await;
    let cancel = CancellationToken::new();
    let suspended = h
        .engine
        .start("t1", Message::user("create employee X"), &cancel)
        .await
        .unwrap();
    let before = h.store.get("t1").await.unwrap().unwrap();

    let err = h
        .engine
        .resume("t1", Resume::new(ApprovalResponse::Ignore), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::MalformedDecision(_)));
    assert_eq!(h.store.get("t1").await.unwrap().unwrap(), before);
    assert!(h.create_calls().is_empty());

    let done = h
        .engine
        .resume(
            "t1",
            Resume::new(ApprovalResponse::Accept).for_request(suspended.pending.unwrap().id),
            &cancel,
        )
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_scenario_one_result(&h, &done.state);
}

#[tokio::test]
async fn batch_applies_first_decision_and_reports_discard() {
    let h = Harness::new(two_turn_script()).await;
    let cancel = CancellationToken::new();
    let mut events = h.engine.events().subscribe();
    h.engine
        .start("t1", Message::user("create employee X"), &cancel)
        .await
        .unwrap();

    let batch = ResumeValue::from_json(json!([
        {"type": "accept"},
        {"type": "respond", "args": "never mind"}
    ]))
    .unwrap();
    let done = h.engine.resume("t1", Resume::new(batch), &cancel).await.unwrap();

    assert_eq!(done.discarded_decisions, 1);
    assert_eq!(h.engine.stats().discarded_decisions(), 1);
    assert_scenario_one_result(&h, &done.state);

    let mut saw_discard = false;
    while let Ok(event) = events.try_recv() {
        if let WorkflowEvent::DecisionsDiscarded { discarded, .. } = event {
            assert_eq!(discarded, 1);
            saw_discard = true;
        }
    }
    assert!(saw_discard);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[tokio::test]
async fn respond_never_invokes_the_capability() {
    let h = Harness::new(two_turn_script()).await;
    let cancel = CancellationToken::new();
    h.engine
        .start("t1", Message::user("create employee X"), &cancel)
        .await
        .unwrap();

    let done = h
        .engine
        .resume(
            "t1",
            Resume::new(ApprovalResponse::Respond {
                args: json!("X already exists; nothing to do."),
            }),
            &cancel,
        )
        .await
        .unwrap();

    assert!(h.create_calls().is_empty());
    let messages = done.state.messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[2].tool_call_id.as_deref(), Some("call-1"));
    assert_eq!(messages[2].content, "X already exists; nothing to do.");
    assert_eq!(messages[3].content, "Employee X was created.");
}

#[tokio::test]
async fn decision_for_another_run_is_rejected() {
    let h = Harness::new(ScriptedLlm::looping("create-user")).await;
    let cancel = CancellationToken::new();

    let a = h.engine.start("run-a", Message::user("first"), &cancel).await.unwrap();
    let b = h.engine.start("run-b", Message::user("second"), &cancel).await.unwrap();
    let a_before = h.store.get("run-a").await.unwrap().unwrap();

    let err = h
        .engine
        .resume(
            "run-b",
            Resume::new(ApprovalResponse::Accept).for_request(a.pending.clone().unwrap().id),
            &cancel,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CheckpointMismatch(CheckpointMismatch::WrongRequest { .. })
    ));
    assert_eq!(h.store.get("run-a").await.unwrap().unwrap(), a_before);
    assert_eq!(h.engine.pending("run-b").await.unwrap(), b.pending);
}

#[tokio::test]
async fn each_round_issues_a_fresh_request() {
    let h = Harness::new(ScriptedLlm::looping("create-user")).await;
    let cancel = CancellationToken::new();

    let first = h.engine.start("t1", Message::user("go"), &cancel).await.unwrap();
    let first_id = first.pending.unwrap().id;

    let second = h
        .engine
        .resume("t1", Resume::new(ApprovalResponse::Accept).for_request(first_id), &cancel)
        .await
        .unwrap();
    let second_id = second.pending.clone().unwrap().id;
    assert_ne!(first_id, second_id);
    assert_eq!(h.create_calls().len(), 1);

    // The resolved request can no longer be answered.
    let err = h
        .engine
        .resume("t1", Resume::new(ApprovalResponse::Accept).for_request(first_id), &cancel)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CheckpointMismatch(CheckpointMismatch::WrongRequest { .. })
    ));
}

#[tokio::test]
async fn unknown_capability_fails_the_run() {
    let llm = ScriptedLlm::new(vec![Message::assistant_with_calls(
        "",
        vec![ToolCall::new("call-9", "drop-table", args(json!({})))],
    )]);
    let h = Harness::new(llm).await;
    let mut events = h.engine.events().subscribe();

    let err = h
        .engine
        .start("t1", Message::user("wipe it"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapabilityNotFound(ref name) if name == "drop-table"));

    let checkpoint = h.store.get("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert!(checkpoint.error.unwrap().contains("drop-table"));
    assert_eq!(h.engine.stats().failures(), 1);

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        saw_failure |= matches!(event, WorkflowEvent::RunFailed { .. });
    }
    assert!(saw_failure);
}

#[tokio::test]
async fn cancellation_commits_nothing() {
    let h = Harness::new(ScriptedLlm::then_hang(vec![])).await;
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let (result, _) = tokio::join!(
        h.engine.start("t1", Message::user("create employee X"), &cancel),
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        }
    );
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert!(h.store.get("t1").await.unwrap().is_none());
}

#[tokio::test]
async fn retried_decision_after_cancel_invokes_once() {
    let llm = ScriptedLlm::with_stalls(vec![
        Some(propose_create()),
        None,
        Some(Message::assistant("Employee X was created.")),
    ]);
    let h = Harness::new(llm).await;
    let suspended = h
        .engine
        .start("t1", Message::user("create employee X"), &CancellationToken::new())
        .await
        .unwrap();
    let request = suspended.pending.unwrap();

    // Cancelled while the model digests the tool result.
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let (result, _) = tokio::join!(
        h.engine
            .resume("t1", request.decide(ApprovalResponse::Accept), &cancel),
        async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        }
    );
    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(h.create_calls().len(), 1);

    let checkpoint = h.store.get("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Running);
    assert_eq!(checkpoint.next_node.as_deref(), Some(REASONING));
    assert_eq!(checkpoint.resolved, Some(request.id));
    assert_eq!(checkpoint.state.len(), 3);
    assert!(h.engine.pending("t1").await.unwrap().is_none());

    let retry = CancellationToken::new();
    let err = h
        .engine
        .resume(
            "t1",
            Resume::new(ApprovalResponse::Accept).for_request(Uuid::now_v7()),
            &retry,
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        EngineError::CheckpointMismatch(CheckpointMismatch::WrongRequest { .. })
    ));

    let done = h
        .engine
        .resume("t1", request.decide(ApprovalResponse::Accept), &retry)
        .await
        .unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_scenario_one_result(&h, &done.state);
    assert_eq!(h.engine.active_runs(), 0);
}

#[tokio::test]
async fn hidden_helper_is_not_callable_by_the_model() {
    let llm = ScriptedLlm::new(vec![Message::assistant_with_calls(
        "",
        vec![ToolCall::new(
            "call-7",
            "query-dept-list",
            args(json!({"sql": "DELETE FROM Org"})),
        )],
    )]);
    let h = Harness::new(llm).await;

    let err = h
        .engine
        .start("t1", Message::user("clean up departments"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::CapabilityNotFound(ref name) if name == "query-dept-list"));

    let checkpoint = h.store.get("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert!(checkpoint.pending.is_none());

    // Only the connect-time reference load ever reached the helper.
    let calls = h.calls.lock().unwrap();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1["sql"], "SELECT code, name FROM Org");
}

#[tokio::test(start_paused = true)]
async fn slow_node_times_out_without_committing() {
    let h = Harness::with_config(
        ScriptedLlm::then_hang(vec![]),
        &format!("{CONFIG}\n[engine]\nnode_timeout_secs = 5\n"),
    )
    .await;

    let err = h
        .engine
        .start("t1", Message::user("hello"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NodeTimeout { ref node, timeout_secs: 5 } if node == "reasoning"));
    assert!(h.store.get("t1").await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Step ceiling
// ---------------------------------------------------------------------------

struct Echo;

impl Node for Echo {
    async fn run<'a>(&'a self, _ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
        Ok(NodeOutput::Update(StateUpdate::append(Message::assistant("again"))))
    }
}

#[tokio::test]
async fn step_ceiling_aborts_runaway_loop() {
    let graph = GraphBuilder::new()
        .add_node("ping", Echo)
        .add_node("pong", Echo)
        .set_entry("ping")
        .add_edge("ping", "pong")
        .add_conditional_edges("pong", |_: &WorkflowState| "ping".to_string(), &["ping", END])
        .compile()
        .unwrap();
    let config = EngineConfig {
        max_steps: 5,
        ..EngineConfig::default()
    };
    let engine = WorkflowEngine::new(graph, InMemoryCheckpointStore::new(), config);

    let err = engine
        .start("t1", Message::user("loop"), &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StepLimitExceeded { limit: 5 }));

    let checkpoint = engine.checkpoints().load("t1").await.unwrap().unwrap();
    assert_eq!(checkpoint.status, RunStatus::Failed);
    assert_eq!(checkpoint.steps, 5);
    assert_eq!(checkpoint.state.len(), 6);
}
