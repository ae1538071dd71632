//! Pure routing decisions over conversation state. Same state in, same route out.

use relay_ai::{ToolCall, Turn};

use crate::handoff::{HandoffConfig, ParticipantId};
use crate::retrieval::{verdict_of, RelevanceVerdict};
use crate::state::{ConversationState, ProtocolViolation};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Execute,
    Terminate,
    /// Consult the given participant next.
    Consult(ParticipantId),
}

/// Tool calls of the latest turn, which must be an assistant turn.
pub fn latest_tool_calls(state: &ConversationState) -> Result<&[ToolCall], ProtocolViolation> {
    match state.last() {
        Some(Turn::Assistant { tool_calls, .. }) => Ok(tool_calls),
        Some(other) => Err(ProtocolViolation::new(format!(
            "routing expects an assistant turn, found a {} turn",
            other.role()
        ))),
        None => Err(ProtocolViolation::new("routing on an empty conversation")),
    }
}

/// Single-agent edge after CONSULT: tool requests go to EXECUTE, anything else ends the loop.
pub fn route_tool_calls(state: &ConversationState) -> Result<Route, ProtocolViolation> {
    if latest_tool_calls(state)?.is_empty() {
        Ok(Route::Terminate)
    } else {
        Ok(Route::Execute)
    }
}

/// Handoff edge after `current` was consulted.
pub fn route_handoff(
    state: &ConversationState,
    handoff: &HandoffConfig,
    current: ParticipantId,
) -> Result<Route, ProtocolViolation> {
    if !latest_tool_calls(state)?.is_empty() {
        return Ok(Route::Execute);
    }
    let text = state.last().map(Turn::text).unwrap_or_default();
    if handoff.sentinel().is_some_and(|sentinel| text.contains(sentinel)) {
        return Ok(Route::Terminate);
    }
    Ok(handoff
        .next_after(current)
        .map(Route::Consult)
        .unwrap_or(Route::Terminate))
}

/// Participant that issued the tool requests just executed; results go back to it.
pub fn route_after_tools(
    state: &ConversationState,
    handoff: &HandoffConfig,
) -> Result<ParticipantId, ProtocolViolation> {
    let requester = state
        .turns()
        .iter()
        .rev()
        .find(|turn| matches!(turn, Turn::Assistant { .. }))
        .ok_or_else(|| ProtocolViolation::new("tool results without a requesting assistant turn"))?;
    let label = requester
        .sender()
        .ok_or_else(|| ProtocolViolation::new("tool requests carry no sender"))?;
    handoff
        .find(label)
        .ok_or_else(|| ProtocolViolation::new(format!("sender '{label}' is not on the roster")))
}

/// Reads the grading verdict recorded as the latest turn.
pub fn check_relevance(state: &ConversationState) -> Result<RelevanceVerdict, ProtocolViolation> {
    let last = state
        .last()
        .ok_or_else(|| ProtocolViolation::new("relevance check on an empty conversation"))?;
    verdict_of(last).ok_or_else(|| {
        ProtocolViolation::new("relevance check expects a grading turn with a relevance score")
    })
}
