//! Suspendable run loop.
//!
//! The engine drives a [`CompiledGraph`] for one run at a time per run id:
//!
//! 1. Load the run's checkpoint (if any) and build a private working state.
//! 2. Execute the current node under the cancellation token and the node
//!    deadline, apply its update, and route to the next node.
//! 3. Persist a `Running` checkpoint naming that next node.
//! 4. On `Suspend`, persist state + node + pending request and return.
//! 5. On the terminal, persist the completed state and return.
//! 6. On a fatal error, record the failure (unless the error leaves the
//!    checkpoint intact) and surface it.
//!
//! A cancelled or timed-out node commits nothing of its own; the run stays
//! at the last completed node and [`WorkflowEngine::recover`] (or a retried
//! [`WorkflowEngine::resume`]) picks it up from there, so a capability that
//! already ran is never invoked again.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tollgate_types::approval::{ApprovalRequest, Resume};
use tollgate_types::config::EngineConfig;
use tollgate_types::event::WorkflowEvent;
use tollgate_types::llm::LlmError;
use tollgate_types::message::Message;
use tollgate_types::workflow::{
    Checkpoint, RunStatus, StateError, StateUpdate, WorkflowState,
};

use crate::agent::prompt::PromptError;
use crate::event::EventBus;
use crate::repository::checkpoint::CheckpointStore;

use super::checkpoint::{CheckpointError, CheckpointManager, Lineage};
use super::graph::{CompiledGraph, END};
use super::node::{NodeContext, NodeError, NodeOutput, ResumeInput};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// A resume that does not line up with the run's outstanding suspension.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CheckpointMismatch {
    #[error("run '{run_id}' has no outstanding suspension to resume")]
    NothingToResume { run_id: String },

    #[error("run '{run_id}' is waiting on request {expected}, not {received}")]
    WrongRequest {
        run_id: String,
        expected: Uuid,
        received: Uuid,
    },
}

/// Errors surfaced by [`WorkflowEngine::start`] and [`WorkflowEngine::resume`].
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("capability not found: {0}")]
    CapabilityNotFound(String),

    #[error("malformed decision: {0}")]
    MalformedDecision(String),

    #[error(transparent)]
    CheckpointMismatch(#[from] CheckpointMismatch),

    #[error("invalid route from '{from}' to '{to}'")]
    InvalidRoute { from: String, to: String },

    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u32 },

    #[error("run cancelled")]
    Cancelled,

    #[error("node '{node}' timed out after {timeout_secs}s")]
    NodeTimeout { node: String, timeout_secs: u64 },

    #[error("node '{0}' has no tool call to act on")]
    NoToolCall(String),

    #[error("node '{0}' is not part of the graph")]
    UnknownNode(String),

    #[error("run '{0}' is suspended or was interrupted; resume or recover it instead")]
    RunInProgress(String),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("prompt error: {0}")]
    Prompt(#[from] PromptError),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),
}

impl EngineError {
    fn from_node(node: &str, err: NodeError) -> Self {
        match err {
            NodeError::CapabilityNotFound(name) => EngineError::CapabilityNotFound(name),
            NodeError::MalformedDecision(reason) => EngineError::MalformedDecision(reason),
            NodeError::NoToolCall => EngineError::NoToolCall(node.to_string()),
            NodeError::Llm(e) => EngineError::Llm(e),
            NodeError::Prompt(e) => EngineError::Prompt(e),
        }
    }

    /// Whether this error aborts the run for good (checkpoint marked failed).
    ///
    /// Decision errors, mismatches, cancellation and timeouts leave the last
    /// checkpoint untouched so the caller can retry.
    pub fn is_fatal_to_run(&self) -> bool {
        matches!(
            self,
            EngineError::CapabilityNotFound(_)
                | EngineError::InvalidRoute { .. }
                | EngineError::StepLimitExceeded { .. }
                | EngineError::NoToolCall(_)
                | EngineError::UnknownNode(_)
                | EngineError::Llm(_)
                | EngineError::Prompt(_)
                | EngineError::State(_)
        )
    }
}

// ---------------------------------------------------------------------------
// Outcome and statistics
// ---------------------------------------------------------------------------

/// Where an invocation left the run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    /// `Suspended` or `Completed`; failures surface as errors.
    pub status: RunStatus,
    pub state: WorkflowState,
    /// The request awaiting a human decision, when suspended.
    pub pending: Option<ApprovalRequest>,
    /// Node executions performed by this invocation.
    pub steps: u32,
    /// Batch elements dropped because only the first decision counts.
    pub discarded_decisions: usize,
}

impl RunOutcome {
    pub fn is_suspended(&self) -> bool {
        self.status == RunStatus::Suspended
    }

    /// Final assistant answer, when the run completed.
    pub fn answer(&self) -> Option<&Message> {
        if self.status == RunStatus::Completed {
            self.state.last_assistant()
        } else {
            None
        }
    }
}

/// Process-lifetime counters.
#[derive(Debug, Default)]
pub struct EngineStats {
    runs_started: AtomicU64,
    runs_resumed: AtomicU64,
    suspensions: AtomicU64,
    completions: AtomicU64,
    failures: AtomicU64,
    discarded_decisions: AtomicU64,
}

impl EngineStats {
    pub fn runs_started(&self) -> u64 {
        self.runs_started.load(Ordering::Relaxed)
    }

    pub fn runs_resumed(&self) -> u64 {
        self.runs_resumed.load(Ordering::Relaxed)
    }

    pub fn suspensions(&self) -> u64 {
        self.suspensions.load(Ordering::Relaxed)
    }

    pub fn completions(&self) -> u64 {
        self.completions.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn discarded_decisions(&self) -> u64 {
        self.discarded_decisions.load(Ordering::Relaxed)
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Drives runs of a compiled graph, persisting through a checkpoint store.
pub struct WorkflowEngine<S: CheckpointStore> {
    graph: CompiledGraph,
    checkpoints: CheckpointManager<S>,
    config: EngineConfig,
    events: EventBus,
    run_locks: DashMap<String, Arc<Mutex<()>>>,
    stats: EngineStats,
}

impl<S: CheckpointStore> WorkflowEngine<S> {
    pub fn new(graph: CompiledGraph, store: S, config: EngineConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        Self {
            graph,
            checkpoints: CheckpointManager::new(store),
            config,
            events,
            run_locks: DashMap::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn checkpoints(&self) -> &CheckpointManager<S> {
        &self.checkpoints
    }

    pub fn graph(&self) -> &CompiledGraph {
        &self.graph
    }

    /// Start a run, or continue a finished thread with a new user message.
    ///
    /// Runs until the terminal or the first suspension. Starting a run that
    /// is suspended or was interrupted mid-invocation is refused with
    /// [`EngineError::RunInProgress`].
    pub async fn start(
        &self,
        run_id: &str,
        message: Message,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let _lease = self.lease(run_id).await;

        let (mut state, lineage, continued) = match self.checkpoints.load(run_id).await? {
            Some(checkpoint) if checkpoint.is_suspended() || checkpoint.is_interrupted() => {
                return Err(EngineError::RunInProgress(run_id.to_string()));
            }
            Some(checkpoint) => {
                let lineage = Lineage::of(&checkpoint);
                (checkpoint.state, lineage, true)
            }
            None => (WorkflowState::new(), Lineage::fresh(), false),
        };
        state.apply(StateUpdate::append(message))?;

        self.stats.runs_started.fetch_add(1, Ordering::Relaxed);
        tracing::info!(run_id, continued, "run started");
        self.events.publish(WorkflowEvent::RunStarted {
            run_id: run_id.to_string(),
            continued,
        });

        let entry = self.graph.entry().to_string();
        self.drive(run_id, state, entry, None, lineage, cancel).await
    }

    /// Resume a suspended run with a human decision.
    ///
    /// The decision must answer the run's outstanding request. When it is a
    /// batch only the first element is applied; the rest are counted in the
    /// outcome, the engine statistics and a `DecisionsDiscarded` event.
    ///
    /// Retrying a decision whose invocation was interrupted after the
    /// decision node completed continues the run from where it stopped; the
    /// decision is not applied a second time.
    pub async fn resume(
        &self,
        run_id: &str,
        resume: Resume,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let _lease = self.lease(run_id).await;

        let nothing = || CheckpointMismatch::NothingToResume {
            run_id: run_id.to_string(),
        };

        let checkpoint = self.checkpoints.load(run_id).await?.ok_or_else(nothing)?;
        if checkpoint.is_interrupted() {
            let resolved = checkpoint.resolved.ok_or_else(nothing)?;
            if let Some(received) = resume.request_id {
                if received != resolved {
                    return Err(self.wrong_request(run_id, resolved, received).into());
                }
            }
            tracing::info!(
                run_id,
                request_id = %resolved,
                "decision already applied; continuing interrupted run"
            );
            return self.continue_interrupted(run_id, checkpoint, cancel).await;
        }
        if !checkpoint.is_suspended() {
            return Err(nothing().into());
        }

        let lineage = Lineage::of(&checkpoint);
        let Checkpoint {
            state,
            next_node,
            pending,
            ..
        } = checkpoint;
        let (Some(request), Some(node)) = (pending, next_node) else {
            return Err(nothing().into());
        };

        if let Some(received) = resume.request_id {
            if received != request.id {
                return Err(self.wrong_request(run_id, request.id, received).into());
            }
        }

        let (response, discarded) = resume
            .value
            .into_authoritative()
            .map_err(|e| EngineError::MalformedDecision(e.to_string()))?;

        if discarded > 0 {
            tracing::warn!(
                run_id,
                request_id = %request.id,
                discarded,
                "decision batch had extra elements; only the first was applied"
            );
            self.stats
                .discarded_decisions
                .fetch_add(discarded as u64, Ordering::Relaxed);
            self.events.publish(WorkflowEvent::DecisionsDiscarded {
                run_id: run_id.to_string(),
                request_id: request.id,
                discarded,
            });
        }

        self.stats.runs_resumed.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            run_id,
            request_id = %request.id,
            decision = %response.kind(),
            "resuming run"
        );
        self.events.publish(WorkflowEvent::RunResumed {
            run_id: run_id.to_string(),
            request_id: request.id,
            decision: response.kind(),
        });

        let input = ResumeInput { request, response };
        let mut outcome = self
            .drive(run_id, state, node, Some(input), lineage, cancel)
            .await?;
        outcome.discarded_decisions = discarded;
        Ok(outcome)
    }

    /// Continue a run whose last invocation stopped between nodes (cancelled,
    /// timed out, or lost with its process).
    pub async fn recover(
        &self,
        run_id: &str,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let _lease = self.lease(run_id).await;

        let checkpoint = self
            .checkpoints
            .load(run_id)
            .await?
            .filter(Checkpoint::is_interrupted)
            .ok_or_else(|| CheckpointMismatch::NothingToResume {
                run_id: run_id.to_string(),
            })?;
        self.continue_interrupted(run_id, checkpoint, cancel).await
    }

    /// Persisted history of a run.
    pub async fn state(&self, run_id: &str) -> Result<Option<WorkflowState>, EngineError> {
        Ok(self.checkpoints.load(run_id).await?.map(|c| c.state))
    }

    /// The request a suspended run is waiting on.
    pub async fn pending(&self, run_id: &str) -> Result<Option<ApprovalRequest>, EngineError> {
        Ok(self
            .checkpoints
            .load(run_id)
            .await?
            .filter(Checkpoint::is_suspended)
            .and_then(|c| c.pending))
    }

    /// Forget a run entirely. Returns `true` if a checkpoint existed.
    pub async fn delete(&self, run_id: &str) -> Result<bool, EngineError> {
        let _lease = self.lease(run_id).await;

        let existed = self
            .checkpoints
            .store()
            .delete(run_id)
            .await
            .map_err(|e| CheckpointError::Repository(e.to_string()))?;
        tracing::debug!(run_id, existed, "deleted run");
        Ok(existed)
    }

    /// Runs with an invocation in flight or queued in this process.
    pub fn active_runs(&self) -> usize {
        self.run_locks.len()
    }

    /// Exclusive access to a run within this process. The lock entry is
    /// dropped with the last lease that references it.
    async fn lease(&self, run_id: &str) -> RunLease<'_> {
        let lock = Arc::clone(self.run_locks.entry(run_id.to_string()).or_default().value());
        let guard = lock.lock_owned().await;
        RunLease {
            locks: &self.run_locks,
            run_id: run_id.to_string(),
            guard: Some(guard),
        }
    }

    fn wrong_request(&self, run_id: &str, expected: Uuid, received: Uuid) -> CheckpointMismatch {
        tracing::warn!(
            run_id,
            expected = %expected,
            received = %received,
            "rejected decision addressed to another request"
        );
        CheckpointMismatch::WrongRequest {
            run_id: run_id.to_string(),
            expected,
            received,
        }
    }

    async fn continue_interrupted(
        &self,
        run_id: &str,
        checkpoint: Checkpoint,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let lineage = Lineage::of(&checkpoint);
        let Some(node) = checkpoint.next_node else {
            return Err(CheckpointMismatch::NothingToResume {
                run_id: run_id.to_string(),
            }
            .into());
        };

        tracing::info!(run_id, node = %node, "recovering interrupted run");
        self.events.publish(WorkflowEvent::RunRecovered {
            run_id: run_id.to_string(),
            node: node.clone(),
        });

        let cursor = Cursor {
            node,
            resume: None,
            resolved: checkpoint.resolved,
        };
        self.run(run_id, checkpoint.state, cursor, lineage, cancel).await
    }

    // -----------------------------------------------------------------------
    // Run loop
    // -----------------------------------------------------------------------

    async fn drive(
        &self,
        run_id: &str,
        state: WorkflowState,
        node: String,
        resume: Option<ResumeInput>,
        lineage: Lineage,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let cursor = Cursor {
            node,
            resolved: resume.as_ref().map(|input| input.request.id),
            resume,
        };
        self.run(run_id, state, cursor, lineage, cancel).await
    }

    async fn run(
        &self,
        run_id: &str,
        mut state: WorkflowState,
        cursor: Cursor,
        mut lineage: Lineage,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome, EngineError> {
        let Cursor {
            mut node,
            mut resume,
            resolved,
        } = cursor;
        let mut steps: u32 = 0;

        loop {
            if node == END {
                let checkpoint = self
                    .checkpoints
                    .save_completed(run_id, &state, &mut lineage, steps)
                    .await?;

                self.stats.completions.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    run_id,
                    steps,
                    messages = state.len(),
                    "run completed"
                );
                self.events.publish(WorkflowEvent::RunCompleted {
                    run_id: run_id.to_string(),
                    steps: checkpoint.steps,
                    messages: state.len(),
                });

                return Ok(RunOutcome {
                    run_id: run_id.to_string(),
                    status: RunStatus::Completed,
                    state,
                    pending: None,
                    steps,
                    discarded_decisions: 0,
                });
            }

            if steps >= self.config.max_steps {
                let err = EngineError::StepLimitExceeded {
                    limit: self.config.max_steps,
                };
                return Err(self.abort(run_id, &state, &mut lineage, steps, err).await);
            }
            steps += 1;

            let started = Instant::now();
            let output = match self
                .step(run_id, &node, &state, resume.take().as_ref(), cancel)
                .await
            {
                Ok(output) => output,
                Err(err) => return Err(self.abort(run_id, &state, &mut lineage, steps, err).await),
            };
            let duration_ms = started.elapsed().as_millis() as u64;

            let (update, goto) = match output {
                NodeOutput::Suspend { request, update } => {
                    if let Err(err) = state.apply(update) {
                        return Err(self.abort(run_id, &state, &mut lineage, steps, err.into()).await);
                    }
                    self.checkpoints
                        .save_suspended(run_id, &state, &node, &request, &mut lineage, steps)
                        .await?;

                    self.stats.suspensions.fetch_add(1, Ordering::Relaxed);
                    tracing::info!(
                        run_id,
                        node = %node,
                        request_id = %request.id,
                        capability = %request.capability,
                        "run suspended awaiting decision"
                    );
                    self.events.publish(WorkflowEvent::RunSuspended {
                        run_id: run_id.to_string(),
                        request_id: request.id,
                        capability: request.capability.clone(),
                    });

                    return Ok(RunOutcome {
                        run_id: run_id.to_string(),
                        status: RunStatus::Suspended,
                        state,
                        pending: Some(request),
                        steps,
                        discarded_decisions: 0,
                    });
                }
                NodeOutput::Update(update) => (update, None),
                NodeOutput::Command { goto, update } => (update, Some(goto)),
            };

            if let Err(err) = state.apply(update) {
                return Err(self.abort(run_id, &state, &mut lineage, steps, err.into()).await);
            }

            let next = match self.graph.next(&node, goto.as_deref(), &state) {
                Ok(next) => next,
                Err(violation) => {
                    let err = EngineError::InvalidRoute {
                        from: violation.from,
                        to: violation.to,
                    };
                    return Err(self.abort(run_id, &state, &mut lineage, steps, err).await);
                }
            };

            // The terminal is written as a completion on the next turn.
            if next != END {
                self.checkpoints
                    .save_running(run_id, &state, &next, resolved, &mut lineage, steps)
                    .await?;
            }

            tracing::debug!(run_id, node = %node, next = %next, duration_ms, "node completed");
            self.events.publish(WorkflowEvent::NodeCompleted {
                run_id: run_id.to_string(),
                node: node.clone(),
                next: next.clone(),
                duration_ms,
            });
            node = next;
        }
    }

    /// Run one node under the cancellation token and the node deadline.
    async fn step(
        &self,
        run_id: &str,
        node: &str,
        state: &WorkflowState,
        resume: Option<&ResumeInput>,
        cancel: &CancellationToken,
    ) -> Result<NodeOutput, EngineError> {
        let handler = self
            .graph
            .node(node)
            .ok_or_else(|| EngineError::UnknownNode(node.to_string()))?;

        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        let ctx = NodeContext {
            run_id,
            state,
            resume,
            cancel,
        };
        let timeout_secs = self.config.node_timeout_secs;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = tokio::time::timeout(Duration::from_secs(timeout_secs), handler.run_boxed(ctx)) => {
                match result {
                    Ok(output) => output.map_err(|e| EngineError::from_node(node, e)),
                    Err(_) => Err(EngineError::NodeTimeout {
                        node: node.to_string(),
                        timeout_secs,
                    }),
                }
            }
        }
    }

    /// Record a fatal error against the run (when it is one) and hand it back.
    async fn abort(
        &self,
        run_id: &str,
        state: &WorkflowState,
        lineage: &mut Lineage,
        steps: u32,
        err: EngineError,
    ) -> EngineError {
        if !err.is_fatal_to_run() {
            tracing::warn!(
                run_id,
                error = %err,
                "invocation aborted; run stays at its last completed node"
            );
            return err;
        }

        let message = err.to_string();
        if let Err(store_err) = self
            .checkpoints
            .save_failed(run_id, state, lineage, steps, &message)
            .await
        {
            tracing::error!(run_id, error = %store_err, "failed to record run failure");
        }

        self.stats.failures.fetch_add(1, Ordering::Relaxed);
        tracing::error!(run_id, error = %message, "run failed");
        self.events.publish(WorkflowEvent::RunFailed {
            run_id: run_id.to_string(),
            error: message,
        });
        err
    }
}

/// Where an invocation enters the graph.
struct Cursor {
    node: String,
    /// Decision for `node`; consumed by the first step.
    resume: Option<ResumeInput>,
    /// Request whose decision this invocation is carrying out.
    resolved: Option<Uuid>,
}

/// Holds a run's in-process lock; prunes the lock entry on drop.
struct RunLease<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    run_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RunLease<'_> {
    fn drop(&mut self) {
        // Release first so the guard's reference does not count as a waiter.
        drop(self.guard.take());
        self.locks
            .remove_if(&self.run_id, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl<S: CheckpointStore> std::fmt::Debug for WorkflowEngine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("graph", &self.graph)
            .field("max_steps", &self.config.max_steps)
            .field("active_runs", &self.active_runs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InMemoryCheckpointStore;
    use crate::workflow::graph::GraphBuilder;
    use crate::workflow::node::Node;
    use std::sync::atomic::AtomicBool;
    use tollgate_types::approval::{ApprovalResponse, DecisionKind};
    use serde_json::Map;

    /// Appends one assistant message per visit.
    struct Say(&'static str);

    impl Node for Say {
        async fn run<'a>(&'a self, _ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
            Ok(NodeOutput::Update(StateUpdate::append(Message::assistant(self.0))))
        }
    }

    /// Suspends on first entry, then commands its way to the terminal.
    struct Gate;

    impl Node for Gate {
        async fn run<'a>(&'a self, ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
            match ctx.resume {
                None => Ok(NodeOutput::Suspend {
                    request: ApprovalRequest {
                        id: Uuid::now_v7(),
                        tool_call_id: "call-1".to_string(),
                        capability: "noop".to_string(),
                        arguments: Map::new(),
                        allowed: vec![DecisionKind::Accept],
                        description: "gate".to_string(),
                    },
                    update: StateUpdate::append(Message::assistant("waiting")),
                }),
                Some(input) if input.response == ApprovalResponse::Accept => {
                    Ok(NodeOutput::command(END, StateUpdate::none()))
                }
                Some(_) => Err(NodeError::MalformedDecision("only accept".to_string())),
            }
        }
    }

    /// Blocks until cancelled on its first visit; appends on later ones.
    struct StallOnce(AtomicBool);

    impl Node for StallOnce {
        async fn run<'a>(&'a self, ctx: NodeContext<'a>) -> Result<NodeOutput, NodeError> {
            if !self.0.swap(true, Ordering::SeqCst) {
                ctx.cancel.cancelled().await;
            }
            Ok(NodeOutput::Update(StateUpdate::append(Message::assistant("done"))))
        }
    }

    fn gate_engine() -> WorkflowEngine<InMemoryCheckpointStore> {
        let graph = GraphBuilder::new()
            .add_node("gate", Gate)
            .set_entry("gate")
            .allow_commands("gate", &[END])
            .compile()
            .unwrap();
        WorkflowEngine::new(graph, InMemoryCheckpointStore::new(), EngineConfig::default())
    }

    #[tokio::test]
    async fn suspend_commits_update_with_checkpoint() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();

        let outcome = engine.start("t1", Message::user("go"), &cancel).await.unwrap();
        assert!(outcome.is_suspended());
        assert_eq!(outcome.steps, 1);

        let stored = engine.state("t1").await.unwrap().unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored.messages()[1].content, "waiting");
        assert_eq!(engine.pending("t1").await.unwrap(), outcome.pending);
    }

    #[tokio::test]
    async fn resume_without_suspension_is_rejected() {
        let engine = gate_engine();
        let err = engine
            .resume("nobody", Resume::new(ApprovalResponse::Accept), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CheckpointMismatch(CheckpointMismatch::NothingToResume { .. })
        ));
    }

    #[tokio::test]
    async fn start_on_suspended_run_is_refused() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();
        engine.start("t1", Message::user("go"), &cancel).await.unwrap();

        let err = engine.start("t1", Message::user("again"), &cancel).await.unwrap_err();
        assert!(matches!(err, EngineError::RunInProgress(_)));
        assert_eq!(engine.state("t1").await.unwrap().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn malformed_decision_leaves_checkpoint_intact() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();
        let suspended = engine.start("t1", Message::user("go"), &cancel).await.unwrap();

        let err = engine
            .resume("t1", Resume::new(ApprovalResponse::Ignore), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::MalformedDecision(_)));
        assert!(!err.is_fatal_to_run());
        assert_eq!(engine.pending("t1").await.unwrap(), suspended.pending);

        let done = engine
            .resume("t1", Resume::new(ApprovalResponse::Accept), &cancel)
            .await
            .unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert!(engine.pending("t1").await.unwrap().is_none());
        assert_eq!(engine.stats().completions(), 1);
    }

    #[tokio::test]
    async fn completed_thread_continues_on_start() {
        let graph = GraphBuilder::new()
            .add_node("say", Say("hello"))
            .set_entry("say")
            .add_edge("say", END)
            .compile()
            .unwrap();
        let engine =
            WorkflowEngine::new(graph, InMemoryCheckpointStore::new(), EngineConfig::default());
        let cancel = CancellationToken::new();
        let mut rx = engine.events().subscribe();

        let first = engine.start("t1", Message::user("hi"), &cancel).await.unwrap();
        assert_eq!(first.answer().unwrap().content, "hello");

        let second = engine.start("t1", Message::user("again"), &cancel).await.unwrap();
        assert_eq!(second.state.len(), 4);
        let stored = engine.checkpoints().load("t1").await.unwrap().unwrap();
        assert_eq!(stored.steps, 2);

        assert!(matches!(
            rx.recv().await.unwrap(),
            WorkflowEvent::RunStarted { continued: false, .. }
        ));
    }

    #[tokio::test]
    async fn delete_forgets_run() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();
        engine.start("t1", Message::user("go"), &cancel).await.unwrap();

        assert!(engine.delete("t1").await.unwrap());
        assert!(engine.state("t1").await.unwrap().is_none());
        assert!(!engine.delete("t1").await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_run_recovers_from_last_completed_node() {
        let graph = GraphBuilder::new()
            .add_node("say", Say("hello"))
            .add_node("stall", StallOnce(AtomicBool::new(false)))
            .set_entry("say")
            .add_edge("say", "stall")
            .add_edge("stall", END)
            .compile()
            .unwrap();
        let engine =
            WorkflowEngine::new(graph, InMemoryCheckpointStore::new(), EngineConfig::default());
        let mut rx = engine.events().subscribe();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let (result, _) = tokio::join!(
            engine.start("t1", Message::user("hi"), &cancel),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                trigger.cancel();
            }
        );
        assert!(matches!(result, Err(EngineError::Cancelled)));

        let stored = engine.checkpoints().load("t1").await.unwrap().unwrap();
        assert!(stored.is_interrupted());
        assert_eq!(stored.next_node.as_deref(), Some("stall"));
        assert_eq!(stored.state.len(), 2);
        assert!(stored.resolved.is_none());
        assert!(engine.pending("t1").await.unwrap().is_none());

        let fresh = CancellationToken::new();
        let err = engine.start("t1", Message::user("again"), &fresh).await.unwrap_err();
        assert!(matches!(err, EngineError::RunInProgress(_)));
        // No decision was in flight, so there is nothing for a decision to answer.
        let err = engine
            .resume("t1", Resume::new(ApprovalResponse::Accept), &fresh)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            EngineError::CheckpointMismatch(CheckpointMismatch::NothingToResume { .. })
        ));

        let done = engine.recover("t1", &fresh).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.steps, 1);
        assert_eq!(done.state.len(), 3);
        assert_eq!(done.answer().unwrap().content, "done");
        assert_eq!(engine.checkpoints().load("t1").await.unwrap().unwrap().steps, 2);

        let mut saw_recovery = false;
        while let Ok(event) = rx.try_recv() {
            saw_recovery |= matches!(
                event,
                WorkflowEvent::RunRecovered { ref node, .. } if node == "stall"
            );
        }
        assert!(saw_recovery);
    }

    #[tokio::test]
    async fn recover_without_interruption_is_rejected() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();
        engine.start("t1", Message::user("go"), &cancel).await.unwrap();

        let err = engine.recover("t1", &cancel).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::CheckpointMismatch(CheckpointMismatch::NothingToResume { .. })
        ));
    }

    #[tokio::test]
    async fn run_locks_are_released_after_each_call() {
        let engine = gate_engine();
        let cancel = CancellationToken::new();

        engine.start("t1", Message::user("go"), &cancel).await.unwrap();
        engine.start("t2", Message::user("go"), &cancel).await.unwrap();
        assert_eq!(engine.active_runs(), 0);

        engine
            .resume("t1", Resume::new(ApprovalResponse::Accept), &cancel)
            .await
            .unwrap();
        engine
            .resume("t2", Resume::new(ApprovalResponse::Ignore), &cancel)
            .await
            .unwrap_err();
        assert_eq!(engine.active_runs(), 0);

        engine.delete("t1").await.unwrap();
        assert_eq!(engine.active_runs(), 0);
    }

    #[tokio::test]
    async fn queued_callers_share_one_lock_entry() {
        let engine = Arc::new(gate_engine());
        let cancel = CancellationToken::new();
        engine.start("t1", Message::user("go"), &cancel).await.unwrap();

        let lease = engine.lease("t1").await;
        let waiter = {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move { engine.delete("t1").await })
        };
        tokio::task::yield_now().await;
        assert_eq!(engine.active_runs(), 1);

        drop(lease);
        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(engine.active_runs(), 0);
    }

    #[test]
    fn fatality_classification() {
        assert!(EngineError::CapabilityNotFound("x".into()).is_fatal_to_run());
        assert!(EngineError::StepLimitExceeded { limit: 3 }.is_fatal_to_run());
        assert!(!EngineError::Cancelled.is_fatal_to_run());
        assert!(!EngineError::RunInProgress("t".into()).is_fatal_to_run());
        assert!(
            !EngineError::Checkpoint(CheckpointError::Conflict { run_id: "t".into() })
                .is_fatal_to_run()
        );
        assert!(
            !EngineError::NodeTimeout {
                node: "n".into(),
                timeout_secs: 1
            }
            .is_fatal_to_run()
        );
    }
}
