//! Settings resolution for elaboration
//!
//! Every setting resolves as flag > config file > environment > built-in
//! default. Empty strings count as unset at every level.

use std::time::Duration;

use crate::config::AppConfig;
use crate::models::ModelParams;

pub const DEFAULT_PROVIDER: &str = "gemini";
pub const DEFAULT_MODEL: &str = "gemini/gemini-2.5-flash";
pub const MODEL_ENV: &str = "SCOPECACHE_MODEL";
pub const API_BASE_ENV: &str = "SCOPECACHE_API_BASE";

/// First non-empty value of flag, file, env
pub fn resolve_setting(flag: Option<&str>, file: Option<&str>, env: Option<&str>) -> Option<String> {
    [flag, file, env]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

/// Split `provider/model`. A bare model name belongs to the default provider.
pub fn parse_model(spec: &str) -> (String, String) {
    let spec = spec.trim();
    match spec.split_once('/') {
        Some((provider, model)) if !provider.is_empty() && !model.is_empty() => {
            (provider.to_lowercase(), model.to_string())
        }
        _ => (DEFAULT_PROVIDER.to_string(), spec.to_string()),
    }
}

/// Environment variables holding a provider's key, in lookup order
pub fn api_key_env_vars(provider: &str) -> Vec<String> {
    let provider = provider.to_lowercase();
    let mut vars = vec![format!("{}_API_KEY", provider.to_uppercase())];
    if provider == "gemini" {
        vars.push("GOOGLE_API_KEY".to_string());
    }
    vars
}

/// Command-line overrides for one elaboration run
#[derive(Debug, Clone, Default)]
pub struct ElaborationOverrides {
    pub model: Option<String>,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
    pub context_window_lines: Option<usize>,
    pub timeout_secs: Option<u64>,
}

/// Fully resolved elaboration settings
#[derive(Debug, Clone)]
pub struct ElaborationSettings {
    pub params: ModelParams,
    /// Kept out of `ModelParams` so it never reaches a cache key
    pub api_key: Option<String>,
    pub context_window_lines: usize,
    pub timeout: Option<Duration>,
}

impl ElaborationSettings {
    pub fn resolve(overrides: &ElaborationOverrides, config: &AppConfig) -> Self {
        Self::resolve_with_env(overrides, config, |name| std::env::var(name).ok())
    }

    /// Resolution with an injected environment lookup
    pub fn resolve_with_env(
        overrides: &ElaborationOverrides,
        config: &AppConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let model_spec = resolve_setting(
            overrides.model.as_deref(),
            config.elaborate.model.as_deref(),
            env(MODEL_ENV).as_deref(),
        )
        .unwrap_or_else(|| DEFAULT_MODEL.to_string());
        let (provider, model) = parse_model(&model_spec);

        let api_base = resolve_setting(
            overrides.api_base.as_deref(),
            config.elaborate.api_base.as_deref(),
            env(API_BASE_ENV).as_deref(),
        );

        let env_key = api_key_env_vars(&provider)
            .iter()
            .find_map(|var| env(var).filter(|v| !v.trim().is_empty()));
        let api_key = resolve_setting(
            overrides.api_key.as_deref(),
            config.credentials.api_key_for(&provider),
            env_key.as_deref(),
        );

        let timeout_secs = overrides.timeout_secs.unwrap_or(config.elaborate.timeout_secs);

        Self {
            params: ModelParams { provider, model, api_base },
            api_key,
            context_window_lines: overrides
                .context_window_lines
                .unwrap_or(config.elaborate.context_window_lines),
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
        }
    }
}
