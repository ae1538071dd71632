use std::time::Instant;

use futures_util::future::join_all;
use relay_ai::{
    now_millis, validate_tool_call, RelayError, RelayErrorCode, Tool, ToolCall, Turn,
};
use serde_json::json;
use tracing::{debug, warn};

use crate::types::{LoopEvent, LoopEventSink, ToolDefinition, ToolOutput};

pub(crate) struct ToolBatchOutcome {
    /// One result turn per request, in the order the requests were declared.
    pub(crate) results: Vec<Turn>,
    pub(crate) executed_count: usize,
    pub(crate) executed_total_duration_ms: u64,
}

pub(crate) async fn execute_tool_calls(
    tools: &[ToolDefinition],
    calls: &[ToolCall],
    parallel: bool,
    events: Option<&LoopEventSink>,
) -> ToolBatchOutcome {
    ToolExecutionRunner::new(tools, events).run(calls, parallel).await
}

struct ToolExecutionRunner<'a> {
    tools: &'a [ToolDefinition],
    llm_tools: Vec<Tool>,
    events: Option<&'a LoopEventSink>,
}

impl<'a> ToolExecutionRunner<'a> {
    fn new(tools: &'a [ToolDefinition], events: Option<&'a LoopEventSink>) -> Self {
        Self {
            tools,
            llm_tools: tools.iter().map(ToolDefinition::to_llm_tool).collect(),
            events,
        }
    }

    async fn run(&self, calls: &[ToolCall], parallel: bool) -> ToolBatchOutcome {
        let finished = if parallel {
            join_all(calls.iter().map(|call| self.execute_single_call(call))).await
        } else {
            let mut finished = Vec::with_capacity(calls.len());
            for call in calls {
                finished.push(self.execute_single_call(call).await);
            }
            finished
        };

        let executed_total_duration_ms = finished
            .iter()
            .fold(0u64, |total, (_, duration_ms)| total.saturating_add(*duration_ms));
        ToolBatchOutcome {
            executed_count: finished.len(),
            executed_total_duration_ms,
            results: finished.into_iter().map(|(turn, _)| turn).collect(),
        }
    }

    async fn execute_single_call(&self, call: &ToolCall) -> (Turn, u64) {
        self.emit(LoopEvent::ToolExecutionStart {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            args: call.arguments.clone(),
        });

        let started = Instant::now();
        let execution = self.dispatch(call).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        let is_error = execution.is_err();
        let output = match execution {
            Ok(output) => output,
            Err(error) => {
                warn!(
                    tool_call_id = call.id.as_str(),
                    tool_name = call.name.as_str(),
                    code = ?error.code,
                    error = error.message.as_str(),
                    "tool call failed"
                );
                tool_error_output(error)
            }
        };
        debug!(
            tool_call_id = call.id.as_str(),
            tool_name = call.name.as_str(),
            duration_ms,
            is_error,
            "tool execution finished"
        );

        self.emit(LoopEvent::ToolExecutionEnd {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            is_error,
            duration_ms,
        });

        let turn = Turn::ToolResult {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            content: output.content,
            details: (!output.details.is_null()).then_some(output.details),
            is_error,
            timestamp: now_millis(),
        };
        (turn, duration_ms)
    }

    async fn dispatch(&self, call: &ToolCall) -> Result<ToolOutput, RelayError> {
        let args = validate_tool_call(&self.llm_tools, call)?;
        let Some(tool) = self.tools.iter().find(|tool| tool.name == call.name) else {
            return Err(relay_ai::tool_not_found(&call.name));
        };

        let execution = tool.execute.execute(call.id.clone(), args);
        match tool.timeout {
            Some(limit) => match tokio::time::timeout(limit, execution).await {
                Ok(result) => result,
                Err(_) => Err(RelayError::new(
                    RelayErrorCode::ToolExecutionFailed,
                    format!("Tool {} timed out after {}ms", call.name, limit.as_millis()),
                )),
            },
            None => execution.await,
        }
    }

    fn emit(&self, event: LoopEvent) {
        if let Some(events) = self.events {
            events(event);
        }
    }
}

fn tool_error_output(error: RelayError) -> ToolOutput {
    ToolOutput::text(error.message.clone()).with_details(json!({ "error": error }))
}
