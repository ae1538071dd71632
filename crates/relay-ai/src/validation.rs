use jsonschema::JSONSchema;
use serde_json::{json, Value};

use crate::error::{RelayError, RelayErrorCode};
use crate::types::{Tool, ToolCall};

/// Resolves `tool_call` against `tools` by exact name and checks its arguments.
///
/// Error messages end up in a tool-result turn, so they are written for the
/// model to act on: they name the offending tool and what to change.
pub fn validate_tool_call(tools: &[Tool], tool_call: &ToolCall) -> Result<Value, RelayError> {
    let Some(tool) = tools.iter().find(|tool| tool.name == tool_call.name) else {
        let available: Vec<&str> = tools.iter().map(|tool| tool.name.as_str()).collect();
        let hint = if available.is_empty() {
            "no tools are offered in this step".to_string()
        } else {
            format!("call one of: {}", available.join(", "))
        };
        let error = tool_not_found(&tool_call.name);
        return Err(RelayError {
            message: format!("{}; {hint}", error.message),
            ..error
        }
        .with_details(json!({
            "toolName": tool_call.name,
            "toolCallId": tool_call.id,
            "availableTools": available,
        })));
    };

    validate_tool_arguments(tool, tool_call)
}

pub fn validate_tool_arguments(tool: &Tool, tool_call: &ToolCall) -> Result<Value, RelayError> {
    let schema = JSONSchema::compile(&tool.parameters).map_err(|error| {
        RelayError::new(
            RelayErrorCode::SchemaInvalid,
            format!("Tool '{}' declares an unusable argument schema: {error}", tool.name),
        )
        .with_details(json!({ "toolName": tool.name }))
    })?;

    let violations: Vec<(String, String)> = match schema.validate(&tool_call.arguments) {
        Ok(()) => return Ok(tool_call.arguments.clone()),
        Err(errors) => errors
            .map(|error| (error.instance_path.to_string(), error.to_string()))
            .collect(),
    };

    let described = violations
        .iter()
        .map(|(path, message)| describe_violation(path, message))
        .collect::<Vec<_>>()
        .join("; ");
    Err(RelayError::new(
        RelayErrorCode::ToolArgumentsInvalid,
        format!(
            "Arguments for tool '{}' do not match its schema ({described}); fix them and call again",
            tool.name
        ),
    )
    .with_details(json!({
        "toolName": tool.name,
        "toolCallId": tool_call.id,
        "arguments": tool_call.arguments,
        "violations": violations
            .iter()
            .map(|(path, message)| json!({ "path": path, "message": message }))
            .collect::<Vec<_>>(),
    })))
}

fn describe_violation(path: &str, message: &str) -> String {
    if path.is_empty() {
        message.to_string()
    } else {
        format!("{path}: {message}")
    }
}

pub fn tool_not_found(tool_name: &str) -> RelayError {
    RelayError::new(
        RelayErrorCode::ToolNotFound,
        format!("Tool '{tool_name}' not found"),
    )
}
