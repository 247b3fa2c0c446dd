use crate::errors::{AgentError, AgentResult};

pub const OPENAI_DEFAULT_HOST: &str = "https://api.openai.com";
pub const OPENAI_DEFAULT_MODEL: &str = "gpt-4o";
pub const DEEPSEEK_DEFAULT_HOST: &str = "https://api.deepseek.com";
pub const DEEPSEEK_DEFAULT_MODEL: &str = "deepseek-chat";
pub const ANTHROPIC_DEFAULT_HOST: &str = "https://api.anthropic.com";
pub const ANTHROPIC_DEFAULT_MODEL: &str = "claude-3-5-sonnet-latest";
pub const ANTHROPIC_DEFAULT_MAX_TOKENS: i32 = 4096;

// Unified enum to wrap different provider configurations
#[derive(Debug, Clone)]
pub enum ProviderConfig {
    OpenAi(OpenAiProviderConfig),
    OpenAiResponses(OpenAiProviderConfig),
    Anthropic(AnthropicProviderConfig),
    DeepSeek(OpenAiProviderConfig),
}

/// Settings for any OpenAI-compatible endpoint
#[derive(Debug, Clone)]
pub struct OpenAiProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl OpenAiProviderConfig {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            host: OPENAI_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: OPENAI_DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    /// DeepSeek speaks the chat completions protocol on its own host
    pub fn deepseek<K: Into<String>>(api_key: K) -> Self {
        Self {
            host: DEEPSEEK_DEFAULT_HOST.to_string(),
            model: DEEPSEEK_DEFAULT_MODEL.to_string(),
            ..Self::new(api_key)
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = model.into();
        self
    }

    pub fn from_env() -> AgentResult<Self> {
        let mut config = Self::new(required_env("OPENAI_API_KEY")?);
        if let Some(host) = optional_env("OPENAI_HOST") {
            config.host = host;
        }
        if let Some(model) = optional_env("OPENAI_MODEL") {
            config.model = model;
        }
        Ok(config)
    }

    pub fn deepseek_from_env() -> AgentResult<Self> {
        let mut config = Self::deepseek(required_env("DEEPSEEK_API_KEY")?);
        if let Some(host) = optional_env("DEEPSEEK_HOST") {
            config.host = host;
        }
        if let Some(model) = optional_env("DEEPSEEK_MODEL") {
            config.model = model;
        }
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct AnthropicProviderConfig {
    pub host: String,
    pub api_key: String,
    pub model: String,
    pub temperature: Option<f32>,
    pub max_tokens: Option<i32>,
}

impl AnthropicProviderConfig {
    pub fn new<K: Into<String>>(api_key: K) -> Self {
        Self {
            host: ANTHROPIC_DEFAULT_HOST.to_string(),
            api_key: api_key.into(),
            model: ANTHROPIC_DEFAULT_MODEL.to_string(),
            temperature: None,
            max_tokens: None,
        }
    }

    pub fn with_host<S: Into<String>>(mut self, host: S) -> Self {
        self.host = host.into();
        self
    }

    pub fn from_env() -> AgentResult<Self> {
        let mut config = Self::new(required_env("ANTHROPIC_API_KEY")?);
        if let Some(host) = optional_env("ANTHROPIC_HOST") {
            config.host = host;
        }
        if let Some(model) = optional_env("ANTHROPIC_MODEL") {
            config.model = model;
        }
        Ok(config)
    }
}

fn required_env(key: &str) -> AgentResult<String> {
    optional_env(key).ok_or_else(|| {
        AgentError::Provider(format!("Environment variable {} must be set", key))
    })
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.is_empty())
}
