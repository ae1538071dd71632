use std::path::{Path, PathBuf};
use std::time::Duration;

use relay_ai::{OpenAiChatConfig, DEFAULT_REQUEST_TIMEOUT};
use relay_agent_core::LoopConfig;
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "relay.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RelayConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub search: SearchSection,
    #[serde(default, rename = "loop")]
    pub control: LoopSection,
    #[serde(default)]
    pub checkpoint: CheckpointSection,
    #[serde(default)]
    pub retrieval: RetrievalSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    pub base_url: String,
    pub model: String,
    /// Inline key; prefer `api_key_env`.
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            api_key: None,
            api_key_env: "OPENAI_API_KEY".to_string(),
            temperature: Some(0.0),
            max_tokens: None,
            timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub base_url: String,
    pub api_key_env: String,
    pub max_results: u32,
    pub timeout_secs: u64,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            base_url: "https://api.tavily.com".to_string(),
            api_key_env: "TAVILY_API_KEY".to_string(),
            max_results: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopSection {
    pub recursion_limit: Option<usize>,
    pub parallel_tool_calls: bool,
    pub tool_timeout_secs: Option<u64>,
}

impl Default for LoopSection {
    fn default() -> Self {
        Self {
            recursion_limit: None,
            parallel_tool_calls: true,
            tool_timeout_secs: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CheckpointSection {
    /// Defaults to `~/.relay/threads`.
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalSection {
    pub docs_dir: PathBuf,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub top_k: usize,
}

impl Default for RetrievalSection {
    fn default() -> Self {
        Self {
            docs_dir: PathBuf::from("docs"),
            chunk_size: 500,
            chunk_overlap: 50,
            top_k: 10,
        }
    }
}

impl RelayConfig {
    /// Reads `path`; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, String> {
        match std::fs::read_to_string(path) {
            Ok(content) => Self::from_toml_str(&content)
                .map_err(|error| format!("parse {} failed: {error}", path.display())),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(error) => Err(format!("read {} failed: {error}", path.display())),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self, String> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config = toml::from_str::<Self>(content).map_err(|error| error.to_string())?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), String> {
        if self.llm.model.trim().is_empty() {
            return Err("llm.model must not be empty".to_string());
        }
        if self.retrieval.chunk_size == 0 {
            return Err("retrieval.chunk_size must be at least 1".to_string());
        }
        if self.retrieval.chunk_overlap >= self.retrieval.chunk_size {
            return Err("retrieval.chunk_overlap must be smaller than chunk_size".to_string());
        }
        if self.control.recursion_limit == Some(0) {
            return Err("loop.recursion_limit must be at least 1".to_string());
        }
        Ok(())
    }

    pub fn model_config(&self) -> OpenAiChatConfig {
        let mut config = OpenAiChatConfig::new(self.llm.base_url.clone(), self.llm.model.clone());
        config.api_key = self
            .llm
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.llm.api_key_env).ok());
        config.temperature = self.llm.temperature;
        config.max_tokens = self.llm.max_tokens;
        config.timeout = self
            .llm
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        config
    }

    /// Loop settings, with `default_limit` used when the file sets none.
    pub fn loop_config(&self, default_limit: usize) -> LoopConfig {
        LoopConfig {
            recursion_limit: self.control.recursion_limit.unwrap_or(default_limit),
            parallel_tool_calls: self.control.parallel_tool_calls,
            ..LoopConfig::default()
        }
    }

    pub fn tool_timeout(&self) -> Option<Duration> {
        self.control.tool_timeout_secs.map(Duration::from_secs)
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.checkpoint
            .dir
            .clone()
            .unwrap_or_else(|| relay_home().join("threads"))
    }
}

pub fn relay_home() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".relay")
}
