use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayErrorCode {
    ToolNotFound,
    ToolArgumentsInvalid,
    ToolExecutionFailed,
    SchemaInvalid,
    ProviderAuthMissing,
    ProviderHttp,
    ProviderProtocol,
    UpstreamUnavailable,
    RateLimited,
}

impl RelayErrorCode {
    /// Failures raised while dispatching a tool call. The loop turns these into
    /// error result turns instead of aborting.
    pub fn is_tool_failure(&self) -> bool {
        matches!(
            self,
            Self::ToolNotFound
                | Self::ToolArgumentsInvalid
                | Self::ToolExecutionFailed
                | Self::SchemaInvalid
        )
    }

    /// Upstream failures a caller may retry. The loop itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::UpstreamUnavailable | Self::RateLimited)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayError {
    pub code: RelayErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl RelayError {
    pub fn new(code: RelayErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn as_compact_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                "{{\"code\":\"provider_protocol\",\"message\":\"{}\"}}",
                self.message.replace('\"', "\\\"")
            )
        })
    }
}

impl Display for RelayError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RelayError {}
