//! LLM provider implementations

pub mod anthropic;
pub mod gemini;
pub mod openai;

use anyhow::Result;
use async_trait::async_trait;

/// A hosted model that turns a prompt into text
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Send a prompt and return the model's reply
    async fn complete(&self, prompt: &str) -> Result<String>;

    /// Provider name (for logging and error messages)
    fn name(&self) -> &str;

    fn default_model(&self) -> &str;
}

pub const SUPPORTED_PROVIDERS: &[&str] = &["openai", "anthropic", "gemini"];

/// Create a provider from its name.
///
/// `api_base` replaces the provider's endpoint root (OpenAI-compatible
/// servers, proxies). Only an OpenAI-compatible endpoint may run without a key.
pub fn create_provider(
    provider_name: &str,
    api_key: Option<String>,
    model: Option<String>,
    api_base: Option<String>,
) -> Result<Box<dyn LlmProvider>> {
    let name = provider_name.to_lowercase();
    if !SUPPORTED_PROVIDERS.contains(&name.as_str()) {
        anyhow::bail!(
            "Unknown provider: {}. Supported: {}",
            provider_name,
            SUPPORTED_PROVIDERS.join(", ")
        );
    }

    let api_base = api_base.filter(|b| !b.trim().is_empty());
    let require_key = |key: Option<String>| -> Result<String> {
        key.filter(|k| !k.is_empty()).ok_or_else(|| {
            let env_var = format!("{}_API_KEY", name.to_uppercase());
            anyhow::anyhow!(
                "API key not found for provider '{}'.\n\
                 \n\
                 Either:\n\
                 1. Pass --api-key\n\
                 2. Set {}_api_key under [credentials] in config.toml\n\
                 3. Set the {} environment variable\n\
                 \n\
                 Example: export {}=...",
                name,
                name,
                env_var,
                env_var
            )
        })
    };

    match name.as_str() {
        "openai" => {
            // Local OpenAI-compatible servers often need no key
            let key = match (&api_base, api_key) {
                (Some(_), key) => key.unwrap_or_default(),
                (None, key) => require_key(key)?,
            };
            Ok(Box::new(openai::OpenAiProvider::new(key, model, api_base)?))
        }
        "anthropic" => Ok(Box::new(anthropic::AnthropicProvider::new(require_key(api_key)?, model, api_base)?)),
        _ => Ok(Box::new(gemini::GeminiProvider::new(require_key(api_key)?, model, api_base)?)),
    }
}

/// Pull a provider's error message out of a JSON error body, falling back to the raw text
pub(crate) fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.to_string())
}
