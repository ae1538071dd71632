//! Conversation data model and model collaborators for relay.

mod error;
mod model;
mod providers;
mod types;
mod validation;

pub use error::{RelayError, RelayErrorCode};
pub use model::{ModelCollaborator, ModelFuture, ModelRef};
pub use providers::{OpenAiChatConfig, OpenAiChatModel, DEFAULT_REQUEST_TIMEOUT};
pub use types::{now_millis, ConsultRequest, Role, Tool, ToolCall, Turn};
pub use validation::{tool_not_found, validate_tool_arguments, validate_tool_call};
