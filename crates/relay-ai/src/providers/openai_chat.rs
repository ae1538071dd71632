use std::env;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::common::{build_http_client, http_status_error, join_url, transport_error};
use crate::error::{RelayError, RelayErrorCode};
use crate::model::ModelCollaborator;
use crate::types::{now_millis, ConsultRequest, Tool, ToolCall, Turn};

const PROVIDER: &str = "OpenAI";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq)]
pub struct OpenAiChatConfig {
    pub base_url: String,
    pub model: String,
    pub api_key: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout: Duration,
}

impl OpenAiChatConfig {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            api_key: None,
            temperature: Some(0.0),
            max_tokens: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

/// Non-streaming OpenAI-compatible `chat/completions` client.
pub struct OpenAiChatModel {
    config: OpenAiChatConfig,
    client: Client,
}

impl OpenAiChatModel {
    pub fn new(config: OpenAiChatConfig) -> Result<Self, RelayError> {
        let client = build_http_client(&config.base_url, config.timeout)?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &OpenAiChatConfig {
        &self.config
    }

    fn resolve_api_key(&self) -> Result<String, RelayError> {
        if let Some(api_key) = self.config.api_key.as_ref() {
            if !api_key.trim().is_empty() {
                return Ok(api_key.clone());
            }
        }

        if let Ok(value) = env::var("OPENAI_API_KEY") {
            if !value.trim().is_empty() {
                return Ok(value);
            }
        }

        Err(RelayError::new(
            RelayErrorCode::ProviderAuthMissing,
            "Missing API key. Set `llm.api_key_env` in relay.toml or export OPENAI_API_KEY.",
        ))
    }
}

#[async_trait]
impl ModelCollaborator for OpenAiChatModel {
    async fn consult(&self, request: ConsultRequest) -> Result<Turn, RelayError> {
        let api_key = self.resolve_api_key()?;
        let payload = build_payload(&self.config, &request);
        let endpoint = join_url(&self.config.base_url, "chat/completions");
        debug!(
            model = self.config.model.as_str(),
            turns = request.turns.len(),
            tools = request.tools.len(),
            "sending chat completion request"
        );

        let response = self
            .client
            .post(endpoint.as_str())
            .header("Authorization", format!("Bearer {api_key}"))
            .json(&payload)
            .send()
            .await
            .map_err(|error| transport_error(PROVIDER, error))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|error| transport_error(PROVIDER, error))?;
        if !status.is_success() {
            return Err(http_status_error(PROVIDER, status.as_u16(), &body));
        }

        let value: Value = serde_json::from_str(&body).map_err(|error| {
            RelayError::new(
                RelayErrorCode::ProviderProtocol,
                format!("Invalid {PROVIDER} response JSON: {error}"),
            )
            .with_details(json!({ "body": body }))
        })?;
        parse_response(&value, &self.config.model)
    }
}

fn build_payload(config: &OpenAiChatConfig, request: &ConsultRequest) -> Value {
    let mut payload = json!({
        "model": config.model,
        "messages": convert_turns(request),
    });

    if let Some(max_tokens) = config.max_tokens {
        payload["max_tokens"] = json!(max_tokens);
    }
    if let Some(temperature) = config.temperature {
        payload["temperature"] = json!(temperature);
    }
    if !request.tools.is_empty() {
        payload["tools"] = convert_tools(&request.tools);
    }
    if let Some(tool_name) = &request.tool_choice {
        payload["tool_choice"] = json!({
            "type": "function",
            "function": { "name": tool_name },
        });
    }

    payload
}

fn convert_turns(request: &ConsultRequest) -> Vec<Value> {
    let mut messages = Vec::new();

    if let Some(system_prompt) = &request.system_prompt {
        messages.push(json!({
            "role": "system",
            "content": system_prompt,
        }));
    }

    for turn in &request.turns {
        match turn {
            Turn::User {
                content, sender, ..
            } => {
                let mut message = json!({
                    "role": "user",
                    "content": content,
                });
                if let Some(name) = sender {
                    message["name"] = json!(name);
                }
                messages.push(message);
            }
            Turn::Assistant {
                content,
                tool_calls,
                sender,
                ..
            } => {
                let mut message = json!({
                    "role": "assistant",
                    "content": if content.is_empty() { Value::Null } else { Value::String(content.clone()) },
                });
                if let Some(name) = sender {
                    message["name"] = json!(name);
                }
                if !tool_calls.is_empty() {
                    message["tool_calls"] = Value::Array(
                        tool_calls
                            .iter()
                            .map(|call| {
                                json!({
                                    "id": call.id,
                                    "type": "function",
                                    "function": {
                                        "name": call.name,
                                        "arguments": call.arguments.to_string(),
                                    }
                                })
                            })
                            .collect(),
                    );
                }
                messages.push(message);
            }
            Turn::ToolResult {
                tool_call_id,
                content,
                ..
            } => {
                messages.push(json!({
                    "role": "tool",
                    "tool_call_id": tool_call_id,
                    "content": if content.is_empty() { "(no text result)" } else { content.as_str() },
                }));
            }
        }
    }

    messages
}

fn convert_tools(tools: &[Tool]) -> Value {
    Value::Array(
        tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect(),
    )
}

fn parse_response(value: &Value, model: &str) -> Result<Turn, RelayError> {
    let message = value
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .ok_or_else(|| {
            RelayError::new(
                RelayErrorCode::ProviderProtocol,
                format!("{PROVIDER} response missing choices[0].message"),
            )
            .with_details(value.clone())
        })?;

    let content = message
        .get("content")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let tool_calls = message
        .get("tool_calls")
        .and_then(Value::as_array)
        .map(|calls| {
            calls
                .iter()
                .enumerate()
                .map(|(index, call)| parse_tool_call(index, call))
                .collect::<Result<Vec<_>, _>>()
        })
        .transpose()?
        .unwrap_or_default();

    Ok(Turn::Assistant {
        content,
        tool_calls,
        sender: None,
        model: Some(
            value
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(model)
                .to_string(),
        ),
        timestamp: now_millis(),
    })
}

fn parse_tool_call(index: usize, call: &Value) -> Result<ToolCall, RelayError> {
    let function = call.get("function").ok_or_else(|| {
        RelayError::new(
            RelayErrorCode::ProviderProtocol,
            format!("{PROVIDER} tool call #{index} missing function"),
        )
    })?;
    let name = function
        .get("name")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let id = call
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("call_{index}"));
    // Unparseable arguments stay a raw string so schema validation reports them to the model.
    let arguments = match function.get("arguments") {
        Some(Value::String(raw)) if raw.trim().is_empty() => json!({}),
        Some(Value::String(raw)) => {
            serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.clone()))
        }
        Some(other) => other.clone(),
        None => json!({}),
    };

    Ok(ToolCall {
        id,
        name,
        arguments,
    })
}
