use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_agent_core::{ToolDefinition, ToolExecutor, ToolOutput};
use relay_ai::{RelayError, RelayErrorCode};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::SearchSection;
use crate::retriever::DocumentIndex;

pub const CHAT_SEARCH_RESULT: &str = "Cold, with a low of 13 ℃";
pub const APPROVAL_SEARCH_RESULT: &str =
    "It's sunny in San Francisco, but you better look out if you're a Gemini 😈.";
pub const CHART_RESULT: &str = "Chart has been generated and displayed to the user!";

pub fn create_weather_tool() -> ToolDefinition {
    ToolDefinition::new(
        "get_weather",
        "Call to get the current weather.",
        json!({
            "type": "object",
            "properties": {
                "location": { "type": "string", "description": "Location to get the weather for." }
            },
            "required": ["location"]
        }),
        Arc::new(WeatherToolExecutor),
    )
}

struct WeatherToolExecutor;

#[async_trait]
impl ToolExecutor for WeatherToolExecutor {
    async fn execute(&self, _tool_call_id: String, args: Value) -> Result<ToolOutput, RelayError> {
        let location = get_required_string(&args, "location")?.to_lowercase();
        let report = if matches!(location.as_str(), "sf" | "san francisco") {
            "It's 60 degrees and foggy."
        } else {
            "It's 90 degrees and sunny."
        };
        Ok(ToolOutput::text(report))
    }
}

pub fn create_coolest_cities_tool() -> ToolDefinition {
    ToolDefinition::new(
        "get_coolest_cities",
        "Get a list of coolest cities",
        json!({
            "type": "object",
            "properties": {
                "noOp": { "type": "string", "description": "No-op parameter." }
            }
        }),
        Arc::new(FixedAnswerExecutor("nyc, sf")),
    )
}

/// Placeholder web search that always returns `answer`.
pub fn create_search_tool(answer: &'static str) -> ToolDefinition {
    ToolDefinition::new(
        "search",
        "Call to surf the web.",
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The query to use in your search." }
            },
            "required": ["query"]
        }),
        Arc::new(FixedAnswerExecutor(answer)),
    )
}

pub fn create_bar_chart_tool() -> ToolDefinition {
    ToolDefinition::new(
        "generate_bar_chart",
        "Generates a bar chart from an array of data points using D3.js and displays it for the user.",
        json!({
            "type": "object",
            "properties": {
                "data": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "label": { "type": "string" },
                            "value": { "type": "number" }
                        },
                        "required": ["label", "value"]
                    }
                }
            },
            "required": ["data"]
        }),
        Arc::new(FixedAnswerExecutor(CHART_RESULT)),
    )
}

struct FixedAnswerExecutor(&'static str);

#[async_trait]
impl ToolExecutor for FixedAnswerExecutor {
    async fn execute(&self, _tool_call_id: String, _args: Value) -> Result<ToolOutput, RelayError> {
        Ok(ToolOutput::text(self.0))
    }
}

pub fn create_tavily_tool(config: &SearchSection) -> Result<ToolDefinition, String> {
    let client = Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|error| format!("build search client failed: {error}"))?;
    Ok(ToolDefinition::new(
        "tavily_search",
        "A search engine optimized for comprehensive, accurate, and trusted results. \
         Useful for when you need to answer questions about current events. \
         Input should be a search query.",
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "The search query." }
            },
            "required": ["query"]
        }),
        Arc::new(TavilyToolExecutor {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key_env: config.api_key_env.clone(),
            max_results: config.max_results,
        }),
    ))
}

struct TavilyToolExecutor {
    client: Client,
    base_url: String,
    api_key_env: String,
    max_results: u32,
}

#[async_trait]
impl ToolExecutor for TavilyToolExecutor {
    async fn execute(&self, _tool_call_id: String, args: Value) -> Result<ToolOutput, RelayError> {
        let query = get_required_string(&args, "query")?;
        let api_key = std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| {
                tool_execution_failed(format!("search is unavailable: {} is not set", self.api_key_env))
            })?;

        let response = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&json!({
                "api_key": api_key,
                "query": query,
                "max_results": self.max_results,
            }))
            .send()
            .await
            .map_err(|error| tool_execution_failed(format!("search request failed: {error}")))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|error| tool_execution_failed(format!("search response unreadable: {error}")))?;
        if !status.is_success() {
            return Err(tool_execution_failed(format!("search HTTP {status}: {body}")));
        }

        let results: Vec<Value> = body
            .get("results")
            .and_then(Value::as_array)
            .map(|results| {
                results
                    .iter()
                    .map(|result| {
                        json!({
                            "url": result.get("url").cloned().unwrap_or(Value::Null),
                            "content": result.get("content").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(ToolOutput::text(Value::Array(results.clone()).to_string())
            .with_details(json!({ "query": query, "resultCount": results.len() })))
    }
}

pub fn create_retriever_tool(index: Arc<DocumentIndex>, top_k: usize) -> ToolDefinition {
    ToolDefinition::new(
        "retrieve_blog_posts",
        "Search and return information about Lilian Weng blog posts on LLM agents, \
         prompt engineering, and adversarial attacks on LLMs.",
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look up in the blog posts." }
            },
            "required": ["query"]
        }),
        Arc::new(RetrieverToolExecutor { index, top_k }),
    )
}

struct RetrieverToolExecutor {
    index: Arc<DocumentIndex>,
    top_k: usize,
}

#[async_trait]
impl ToolExecutor for RetrieverToolExecutor {
    async fn execute(&self, _tool_call_id: String, args: Value) -> Result<ToolOutput, RelayError> {
        let query = get_required_string(&args, "query")?;
        let hits = self.index.search(&query, self.top_k);
        let sources: Vec<&str> = hits.iter().map(|chunk| chunk.source.as_str()).collect();
        let content = hits
            .iter()
            .map(|chunk| chunk.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        Ok(ToolOutput::text(content).with_details(json!({ "sources": sources })))
    }
}

fn get_required_string(args: &Value, key: &str) -> Result<String, RelayError> {
    args.get(key)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| {
            RelayError::new(
                RelayErrorCode::ToolArgumentsInvalid,
                format!("Missing required string argument `{key}`"),
            )
        })
}

fn tool_execution_failed(message: impl Into<String>) -> RelayError {
    RelayError::new(RelayErrorCode::ToolExecutionFailed, message)
}
