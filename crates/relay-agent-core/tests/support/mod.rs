#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use relay_agent_core::{LoopEvent, LoopEventSink, ToolDefinition, ToolFuture, ToolOutput};
use relay_ai::{ConsultRequest, ModelCollaborator, RelayError, ToolCall, Turn};
use serde_json::{json, Value};

/// Replays canned replies in order and records every request it receives.
pub struct ScriptedModel {
    replies: Mutex<VecDeque<Result<Turn, RelayError>>>,
    requests: Mutex<Vec<ConsultRequest>>,
}

impl ScriptedModel {
    pub fn new(replies: Vec<Turn>) -> Arc<Self> {
        Self::with_results(replies.into_iter().map(Ok).collect())
    }

    pub fn with_results(replies: Vec<Result<Turn, RelayError>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(vec![]),
        })
    }

    pub fn requests(&self) -> Vec<ConsultRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    pub fn remaining(&self) -> usize {
        self.replies.lock().expect("replies lock").len()
    }
}

#[async_trait]
impl ModelCollaborator for ScriptedModel {
    async fn consult(&self, request: ConsultRequest) -> Result<Turn, RelayError> {
        self.requests.lock().expect("requests lock").push(request);
        self.replies
            .lock()
            .expect("replies lock")
            .pop_front()
            .unwrap_or_else(|| Ok(Turn::assistant("script exhausted")))
    }
}

pub fn call(id: &str, name: &str, arguments: Value) -> ToolCall {
    ToolCall::new(id, name, arguments)
}

pub fn calls(tool_calls: Vec<ToolCall>) -> Turn {
    Turn::assistant_with_calls("", tool_calls)
}

pub fn weather_tool() -> ToolDefinition {
    ToolDefinition::new(
        "get_weather",
        "Call to get the current weather.",
        json!({
            "type": "object",
            "properties": {"location": {"type": "string", "description": "Location to get the weather for."}},
            "required": ["location"]
        }),
        Arc::new(|_id: String, args: Value| -> ToolFuture {
            Box::pin(async move {
                let location = args["location"].as_str().unwrap_or_default().to_lowercase();
                let text = if location == "sf" || location == "san francisco" {
                    "It's 60 degrees and foggy."
                } else {
                    "It's 90 degrees and sunny."
                };
                Ok(ToolOutput::text(text))
            })
        }),
    )
}

pub fn coolest_cities_tool() -> ToolDefinition {
    ToolDefinition::new(
        "get_coolest_cities",
        "Get a list of coolest cities",
        json!({
            "type": "object",
            "properties": {"noOp": {"type": "string", "description": "No-op parameter."}}
        }),
        Arc::new(|_id: String, _args: Value| -> ToolFuture {
            Box::pin(async move { Ok(ToolOutput::text("nyc, sf")) })
        }),
    )
}

/// Sleeps for `delay_ms` from the arguments, then echoes `text`.
pub fn sleepy_echo_tool() -> ToolDefinition {
    ToolDefinition::new(
        "sleepy_echo",
        "Echo after a delay.",
        json!({
            "type": "object",
            "properties": {
                "text": {"type": "string"},
                "delay_ms": {"type": "integer"}
            },
            "required": ["text", "delay_ms"]
        }),
        Arc::new(|_id: String, args: Value| -> ToolFuture {
            Box::pin(async move {
                let delay = args["delay_ms"].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(delay)).await;
                Ok(ToolOutput::text(args["text"].as_str().unwrap_or_default()))
            })
        }),
    )
}

pub fn recording_sink() -> (LoopEventSink, Arc<Mutex<Vec<LoopEvent>>>) {
    let events = Arc::new(Mutex::new(Vec::new()));
    let events_in_sink = events.clone();
    let sink: LoopEventSink = Arc::new(move |event| {
        events_in_sink.lock().expect("events lock").push(event);
    });
    (sink, events)
}

pub fn tool_result_texts(turns: &[Turn]) -> Vec<(String, String, bool)> {
    turns
        .iter()
        .filter_map(|turn| match turn {
            Turn::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => Some((tool_call_id.clone(), content.clone(), *is_error)),
            _ => None,
        })
        .collect()
}
