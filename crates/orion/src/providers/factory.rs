use super::{
    anthropic::AnthropicProvider, base::Provider, configs::ProviderConfig, openai::OpenAiProvider,
    openai_responses::OpenAiResponsesProvider,
};
use crate::errors::AgentResult;

pub fn get_provider(config: ProviderConfig) -> AgentResult<Box<dyn Provider + Send + Sync>> {
    match config {
        ProviderConfig::OpenAi(openai_config) | ProviderConfig::DeepSeek(openai_config) => {
            Ok(Box::new(OpenAiProvider::new(openai_config)?))
        }
        ProviderConfig::OpenAiResponses(openai_config) => {
            Ok(Box::new(OpenAiResponsesProvider::new(openai_config)?))
        }
        ProviderConfig::Anthropic(anthropic_config) => {
            Ok(Box::new(AnthropicProvider::new(anthropic_config)?))
        }
    }
}
