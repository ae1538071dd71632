mod common;
mod openai_chat;

pub use openai_chat::{OpenAiChatConfig, OpenAiChatModel, DEFAULT_REQUEST_TIMEOUT};
