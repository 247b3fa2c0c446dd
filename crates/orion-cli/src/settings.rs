use std::path::{Path, PathBuf};

use config::{Config, Environment, File};
use orion::agent::{AgentConfig, ToolErrorPolicy};
use orion::bridge::BridgeConfig;
use orion::providers::configs::{
    AnthropicProviderConfig, OpenAiProviderConfig, ProviderConfig,
};
use serde::Deserialize;
use thiserror::Error;

const ENV_PREFIX: &str = "ORION";

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Missing setting. Set the {env_var} environment variable or add it to the config file")]
    MissingEnvVar { env_var: String },
    #[error("Configuration error: {0}")]
    Other(#[from] config::ConfigError),
}

/// `provider.api_key` -> `ORION_PROVIDER__API_KEY`
pub fn to_env_var(field: &str) -> String {
    format!(
        "{}_{}",
        ENV_PREFIX,
        field.replace('.', "__").to_uppercase()
    )
}

#[derive(Debug, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_agent_name")]
    pub name: String,
    #[serde(default)]
    pub system_message: String,
    #[serde(default)]
    pub stop_on_first_tool_round: bool,
    #[serde(default)]
    pub tool_error_policy: ToolErrorPolicy,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            name: default_agent_name(),
            system_message: String::new(),
            stop_on_first_tool_round: false,
            tool_error_policy: ToolErrorPolicy::default(),
        }
    }
}

impl AgentSettings {
    pub fn into_config(self) -> AgentConfig {
        AgentConfig::new(self.name)
            .with_system_message(self.system_message)
            .stop_on_first_tool_round(self.stop_on_first_tool_round)
            .with_tool_error_policy(self.tool_error_policy)
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum ProviderSettings {
    #[serde(rename = "openai")]
    OpenAi {
        api_key: String,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    #[serde(rename = "openai_responses")]
    OpenAiResponses {
        api_key: String,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    #[serde(rename = "anthropic")]
    Anthropic {
        api_key: String,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
    #[serde(rename = "deepseek")]
    DeepSeek {
        api_key: String,
        #[serde(default)]
        host: Option<String>,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        temperature: Option<f32>,
        #[serde(default)]
        max_tokens: Option<i32>,
    },
}

fn openai_compatible(
    base: OpenAiProviderConfig,
    host: Option<String>,
    model: Option<String>,
    temperature: Option<f32>,
    max_tokens: Option<i32>,
) -> OpenAiProviderConfig {
    OpenAiProviderConfig {
        host: host.unwrap_or(base.host),
        model: model.unwrap_or(base.model),
        temperature,
        max_tokens,
        ..base
    }
}

impl ProviderSettings {
    pub fn into_config(self) -> ProviderConfig {
        match self {
            ProviderSettings::OpenAi {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::OpenAi(openai_compatible(
                OpenAiProviderConfig::new(api_key),
                host,
                model,
                temperature,
                max_tokens,
            )),
            ProviderSettings::OpenAiResponses {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::OpenAiResponses(openai_compatible(
                OpenAiProviderConfig::new(api_key),
                host,
                model,
                temperature,
                max_tokens,
            )),
            ProviderSettings::DeepSeek {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
            } => ProviderConfig::DeepSeek(openai_compatible(
                OpenAiProviderConfig::deepseek(api_key),
                host,
                model,
                temperature,
                max_tokens,
            )),
            ProviderSettings::Anthropic {
                api_key,
                host,
                model,
                temperature,
                max_tokens,
            } => {
                let base = AnthropicProviderConfig::new(api_key);
                ProviderConfig::Anthropic(AnthropicProviderConfig {
                    host: host.unwrap_or(base.host),
                    model: model.unwrap_or(base.model),
                    temperature,
                    max_tokens,
                    api_key: base.api_key,
                })
            }
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub agent: AgentSettings,
    pub provider: ProviderSettings,
    #[serde(default)]
    pub bridges: Vec<BridgeConfig>,
}

/// `orion.toml` in the user's config directory
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("orion").join("orion.toml"))
}

impl Settings {
    /// Load defaults, then the config file, then `ORION_` environment variables
    pub fn new(config_path: Option<&Path>) -> Result<Self, SettingsError> {
        let path = config_path
            .map(Path::to_path_buf)
            .or_else(default_config_path);
        Self::load_and_validate(path.as_deref(), config_path.is_some())
    }

    fn load_and_validate(path: Option<&Path>, required: bool) -> Result<Self, SettingsError> {
        let mut builder = Config::builder()
            .set_default("agent.name", default_agent_name())?
            .set_default("provider.type", "openai")?;

        if let Some(path) = path {
            tracing::debug!(path = %path.display(), required, "loading config file");
            builder = builder.add_source(File::from(path).required(required));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        match config.try_deserialize::<Self>() {
            Ok(settings) => Ok(settings),
            Err(err) => {
                tracing::debug!("Configuration error: {:?}", &err);
                let message = err.to_string();
                if let Some(field) = missing_field(&message) {
                    // api_key is the only required field without a default
                    let key = match field {
                        "api_key" => "provider.api_key".to_string(),
                        other => other.to_string(),
                    };
                    Err(SettingsError::MissingEnvVar {
                        env_var: to_env_var(&key),
                    })
                } else if let config::ConfigError::NotFound(field) = &err {
                    Err(SettingsError::MissingEnvVar {
                        env_var: to_env_var(field),
                    })
                } else {
                    Err(SettingsError::Other(err))
                }
            }
        }
    }
}

/// Pull the field name out of serde's "missing field `x`" message
fn missing_field(message: &str) -> Option<&str> {
    let start = message.find("missing field `")? + "missing field `".len();
    let rest = &message[start..];
    let end = rest.find('`')?;
    Some(&rest[..end])
}

fn default_agent_name() -> String {
    "orion".to_string()
}
