//! Checkpointed consult/execute control loop built on top of `relay-ai`.

mod checkpoint;
mod control_loop;
mod handoff;
mod retrieval;
mod routing;
mod state;
mod tool_exec;
mod types;

pub use checkpoint::{
    Checkpoint, CheckpointError, Checkpointer, CheckpointerRef, FileCheckpointer,
    MemoryCheckpointer,
};
pub use control_loop::{
    ControlLoop, ControlLoopBuilder, LoopConfig, LoopError, LoopMode, DEFAULT_RECURSION_LIMIT,
};
pub use handoff::{HandoffConfig, Participant, ParticipantId, DEFAULT_SENTINEL};
pub use retrieval::{
    relevance_tool, verdict_of, verdict_turn, Grader, GraderRef, ModelGrader, RelevanceVerdict,
    RELEVANCE_TOOL_NAME,
};
pub use routing::{
    check_relevance, latest_tool_calls, route_after_tools, route_handoff, route_tool_calls, Route,
};
pub use state::{ConversationState, ProtocolViolation};
pub use types::{
    CancelHandle, CancelSignal, LoopEvent, LoopEventSink, LoopMetrics, LoopOutcome, LoopStatus,
    Phase, RunOptions, ToolDefinition, ToolExecuteFn, ToolExecutor, ToolFuture, ToolOutput,
};
