//! `relay` command-line front end: configuration, demo tools and one runner per sub-command.

mod commands;
mod config;
mod retriever;
mod tools;

pub use commands::{
    console_sink, render_event, render_turn, research_team, run_agent, run_approve, run_chat,
    run_rag, run_resume, run_team, run_tools, CommandContext,
};
pub use config::{
    relay_home, CheckpointSection, LlmSection, LoopSection, RelayConfig, RetrievalSection,
    SearchSection, DEFAULT_CONFIG_FILE,
};
pub use retriever::{split_text, DocumentChunk, DocumentIndex};
pub use tools::{
    create_bar_chart_tool, create_coolest_cities_tool, create_retriever_tool, create_search_tool,
    create_tavily_tool, create_weather_tool, APPROVAL_SEARCH_RESULT, CHART_RESULT,
    CHAT_SEARCH_RESULT,
};
