use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_ai::{RelayError, Tool, Turn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::state::ConversationState;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<ToolOutput, RelayError>> + Send>>;

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    async fn execute(&self, tool_call_id: String, args: Value) -> Result<ToolOutput, RelayError>;
}

#[async_trait]
impl<F> ToolExecutor for F
where
    F: Fn(String, Value) -> ToolFuture + Send + Sync + 'static,
{
    async fn execute(&self, tool_call_id: String, args: Value) -> Result<ToolOutput, RelayError> {
        (self)(tool_call_id, args).await
    }
}

pub type ToolExecuteFn = Arc<dyn ToolExecutor>;

#[derive(Clone, Debug, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub details: Value,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            details: Value::Null,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }
}

/// A named tool: schema for argument validation plus the executor behind it.
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    /// Upper bound for one execution; exceeding it yields an error result turn.
    pub timeout: Option<Duration>,
    pub execute: ToolExecuteFn,
}

impl ToolDefinition {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: Value,
        execute: ToolExecuteFn,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            timeout: None,
            execute,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn to_llm_tool(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

/// Loop state labels. Stored in checkpoints as the phase to enter next.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Consult,
    Execute,
    Grade,
    Rewrite,
    Generate,
    Terminate,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Consult => "consult",
            Phase::Execute => "execute",
            Phase::Grade => "grade",
            Phase::Rewrite => "rewrite",
            Phase::Generate => "generate",
            Phase::Terminate => "terminate",
        }
    }

    pub(crate) fn is_retrieval_only(self) -> bool {
        matches!(self, Phase::Grade | Phase::Rewrite | Phase::Generate)
    }
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct CancelSignal {
    cancelled: Arc<AtomicBool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Requests that a running loop stop at the next step boundary.
pub struct CancelHandle {
    signal: CancelSignal,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self {
            signal: CancelSignal {
                cancelled: Arc::new(AtomicBool::new(false)),
            },
        }
    }

    pub fn signal(&self) -> CancelSignal {
        self.signal.clone()
    }

    pub fn cancel(&self) {
        self.signal.cancelled.store(true, Ordering::SeqCst);
    }
}

impl Default for CancelHandle {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LoopMetrics {
    pub step_count: usize,
    pub model_request_count: usize,
    pub model_request_total_ms: u64,
    pub tool_execution_count: usize,
    pub tool_execution_total_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LoopStatus {
    Completed,
    /// Paused before `before`; a checkpoint holds the state to resume from.
    Interrupted {
        before: Phase,
    },
    /// Stopped between steps; `next` is the phase a resume would enter.
    Cancelled {
        next: Phase,
    },
}

#[derive(Clone, Debug)]
pub struct LoopOutcome {
    pub status: LoopStatus,
    pub thread_id: Option<String>,
    pub state: ConversationState,
    pub metrics: LoopMetrics,
}

impl LoopOutcome {
    pub fn last_turn(&self) -> Option<&Turn> {
        self.state.last()
    }

    pub fn final_text(&self) -> Option<&str> {
        self.last_turn().map(Turn::text)
    }
}

#[derive(Clone, Debug)]
pub enum LoopEvent {
    LoopStart {
        thread_id: Option<String>,
        phase: Phase,
        resumed: bool,
    },
    StepStart {
        step: u64,
        phase: Phase,
        participant: Option<String>,
    },
    TurnAppended {
        turn: Turn,
    },
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        args: Value,
    },
    ToolExecutionEnd {
        tool_call_id: String,
        tool_name: String,
        is_error: bool,
        duration_ms: u64,
    },
    CheckpointSaved {
        thread_id: String,
        step: u64,
        next: Phase,
    },
    Interrupted {
        before: Phase,
    },
    LoopEnd {
        status: LoopStatus,
        metrics: LoopMetrics,
    },
}

pub type LoopEventSink = Arc<dyn Fn(LoopEvent) + Send + Sync>;

#[derive(Clone, Default)]
pub struct RunOptions {
    pub thread_id: Option<String>,
    pub cancel: Option<CancelSignal>,
}

impl RunOptions {
    pub fn thread(thread_id: impl Into<String>) -> Self {
        Self {
            thread_id: Some(thread_id.into()),
            cancel: None,
        }
    }

    pub fn with_cancel(mut self, cancel: CancelSignal) -> Self {
        self.cancel = Some(cancel);
        self
    }
}
