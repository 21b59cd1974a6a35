//! Scripted providers shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{Map, Value, json};
use tokio_util::sync::CancellationToken;

use tollgate_types::llm::{CompletionRequest, LlmError};
use tollgate_types::message::{Message, ToolCall};
use tollgate_types::tool::{ToolError, ToolSchema};

use crate::llm::LlmProvider;
use crate::tool::ToolProvider;

pub type CallLog = Arc<Mutex<Vec<(String, Map<String, Value>)>>>;

pub fn args(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

// ---------------------------------------------------------------------------
// MockTools
// ---------------------------------------------------------------------------

pub struct MockTools {
    schemas: Vec<ToolSchema>,
    results: HashMap<String, Result<Value, String>>,
    fail_discovery: bool,
    calls: CallLog,
}

impl MockTools {
    pub fn new() -> Self {
        Self {
            schemas: Vec::new(),
            results: HashMap::new(),
            fail_discovery: false,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_tool(mut self, name: &str, input_schema: Value) -> Self {
        self.schemas
            .push(ToolSchema::new(name, format!("{name} capability"), input_schema));
        self
    }

    pub fn with_result(mut self, name: &str, value: Value) -> Self {
        self.results.insert(name.to_string(), Ok(value));
        self
    }

    pub fn with_failure(mut self, name: &str, message: &str) -> Self {
        self.results
            .insert(name.to_string(), Err(message.to_string()));
        self
    }

    pub fn failing_discovery(mut self) -> Self {
        self.fail_discovery = true;
        self
    }

    pub fn calls(&self) -> CallLog {
        Arc::clone(&self.calls)
    }
}

impl ToolProvider for MockTools {
    fn name(&self) -> &str {
        "mock"
    }

    async fn discover(&self) -> Result<Vec<ToolSchema>, ToolError> {
        if self.fail_discovery {
            return Err(ToolError::Connection("server not running".to_string()));
        }
        Ok(self.schemas.clone())
    }

    async fn invoke(
        &self,
        name: &str,
        arguments: &Map<String, Value>,
        _cancel: &CancellationToken,
    ) -> Result<Value, ToolError> {
        self.calls
            .lock()
            .unwrap()
            .push((name.to_string(), arguments.clone()));

        match self.results.get(name) {
            Some(Ok(value)) => Ok(value.clone()),
            Some(Err(message)) => Err(ToolError::Execution {
                capability: name.to_string(),
                message: message.clone(),
            }),
            None if self.schemas.iter().any(|s| s.name == name) => Ok(json!({"ok": true})),
            None => Err(ToolError::NotFound(name.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ScriptedLlm
// ---------------------------------------------------------------------------

enum Mode {
    /// Play back replies in order; once exhausted, fail or wait for cancellation.
    /// A `None` entry waits for cancellation once.
    Script {
        queue: Mutex<VecDeque<Option<Message>>>,
        hang_when_done: bool,
    },
    /// Propose a fresh call to the named capability on every turn.
    Loop(String),
}

pub struct ScriptedLlm {
    mode: Mode,
    turn: AtomicUsize,
    requests: Arc<Mutex<Vec<CompletionRequest>>>,
}

impl ScriptedLlm {
    pub fn new(replies: Vec<Message>) -> Self {
        Self::with_stalls(replies.into_iter().map(Some).collect())
    }

    /// Play back `replies`, then block until cancelled.
    pub fn then_hang(replies: Vec<Message>) -> Self {
        Self::with_mode(Mode::Script {
            queue: Mutex::new(replies.into_iter().map(Some).collect()),
            hang_when_done: true,
        })
    }

    /// Like [`ScriptedLlm::new`], but each `None` turn blocks until cancelled.
    pub fn with_stalls(turns: Vec<Option<Message>>) -> Self {
        Self::with_mode(Mode::Script {
            queue: Mutex::new(turns.into()),
            hang_when_done: false,
        })
    }

    pub fn looping(capability: &str) -> Self {
        Self::with_mode(Mode::Loop(capability.to_string()))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            turn: AtomicUsize::new(0),
            requests: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Arc<Mutex<Vec<CompletionRequest>>> {
        Arc::clone(&self.requests)
    }
}

impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(
        &self,
        request: &CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<Message, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let turn = self.turn.fetch_add(1, Ordering::SeqCst);

        match &self.mode {
            Mode::Script {
                queue,
                hang_when_done,
            } => {
                let next = queue.lock().unwrap().pop_front();
                match next {
                    Some(Some(reply)) => Ok(reply),
                    Some(None) => stall(cancel).await,
                    None if *hang_when_done => stall(cancel).await,
                    None => Err(LlmError::Provider {
                        message: "script exhausted".to_string(),
                    }),
                }
            }
            Mode::Loop(capability) => Ok(Message::assistant_with_calls(
                "",
                vec![ToolCall::new(format!("loop-{turn}"), capability.clone(), Map::new())],
            )),
        }
    }
}

async fn stall(cancel: &CancellationToken) -> Result<Message, LlmError> {
    cancel.cancelled().await;
    Err(LlmError::Provider {
        message: "cancelled".to_string(),
    })
}
