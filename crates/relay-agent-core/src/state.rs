use relay_ai::{ToolCall, Turn};
use serde::{Deserialize, Serialize};

/// A structural wiring bug: a turn or routing decision that does not fit the protocol.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct ProtocolViolation(pub String);

impl ProtocolViolation {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Append-only conversation history.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Turn>", into = "Vec<Turn>")]
pub struct ConversationState {
    turns: Vec<Turn>,
}

impl ConversationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_turns(turns: Vec<Turn>) -> Result<Self, ProtocolViolation> {
        let mut state = Self::new();
        state.extend(turns)?;
        Ok(state)
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.last()
    }

    pub fn append(&mut self, turn: Turn) -> Result<(), ProtocolViolation> {
        if let Turn::ToolResult { tool_call_id, .. } = &turn {
            self.check_tool_result(tool_call_id)?;
        }
        self.turns.push(turn);
        Ok(())
    }

    pub fn extend(&mut self, turns: impl IntoIterator<Item = Turn>) -> Result<(), ProtocolViolation> {
        for turn in turns {
            self.append(turn)?;
        }
        Ok(())
    }

    /// Content of the first user turn, the question the conversation started from.
    pub fn first_user_text(&self) -> Option<&str> {
        self.turns.iter().find_map(|turn| match turn {
            Turn::User { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    pub fn last_tool_result(&self) -> Option<&Turn> {
        self.turns
            .iter()
            .rev()
            .find(|turn| matches!(turn, Turn::ToolResult { .. }))
    }

    /// Requests of the latest assistant turn that no tool result answers yet, in declared order.
    pub fn unresolved_calls(&self) -> Vec<&ToolCall> {
        let Some((index, calls)) = self.open_assistant_turn() else {
            return vec![];
        };
        let resolved = self.resolved_ids_after(index);
        calls
            .iter()
            .filter(|call| !resolved.contains(&call.id.as_str()))
            .collect()
    }

    pub fn into_turns(self) -> Vec<Turn> {
        self.turns
    }

    fn check_tool_result(&self, tool_call_id: &str) -> Result<(), ProtocolViolation> {
        let Some((index, calls)) = self.open_assistant_turn() else {
            return Err(ProtocolViolation::new(format!(
                "tool result '{tool_call_id}' does not follow an assistant turn"
            )));
        };
        let requested = calls.iter().filter(|call| call.id == tool_call_id).count();
        let answered = self
            .resolved_ids_after(index)
            .into_iter()
            .filter(|id| *id == tool_call_id)
            .count();
        if requested.saturating_sub(answered) != 1 || answered > 0 {
            return Err(ProtocolViolation::new(format!(
                "tool result '{tool_call_id}' must answer exactly one unresolved request of the preceding assistant turn"
            )));
        }
        Ok(())
    }

    /// The assistant turn immediately preceding the trailing run of tool results.
    fn open_assistant_turn(&self) -> Option<(usize, &[ToolCall])> {
        let index = self
            .turns
            .iter()
            .rposition(|turn| !matches!(turn, Turn::ToolResult { .. }))?;
        match &self.turns[index] {
            Turn::Assistant { tool_calls, .. } => Some((index, tool_calls.as_slice())),
            _ => None,
        }
    }

    fn resolved_ids_after(&self, index: usize) -> Vec<&str> {
        self.turns[index + 1..]
            .iter()
            .filter_map(|turn| match turn {
                Turn::ToolResult { tool_call_id, .. } => Some(tool_call_id.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl TryFrom<Vec<Turn>> for ConversationState {
    type Error = ProtocolViolation;

    fn try_from(turns: Vec<Turn>) -> Result<Self, Self::Error> {
        Self::from_turns(turns)
    }
}

impl From<ConversationState> for Vec<Turn> {
    fn from(state: ConversationState) -> Self {
        state.turns
    }
}
