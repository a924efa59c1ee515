//! Elaboration collaborator
//!
//! Explains a single finding with a hosted model. The coordinator treats
//! everything here as an opaque, possibly slow, possibly failing function:
//! it builds an `ElaborationRequest`, awaits an `Elaborator` under a timeout
//! and caches only non-empty successes.

pub mod config;
pub mod context;
pub mod prompt;
pub mod providers;
pub mod report;

use anyhow::Result;
use async_trait::async_trait;
use std::path::PathBuf;

use crate::models::ModelParams;

pub use config::{ElaborationOverrides, ElaborationSettings};
pub use providers::{create_provider, LlmProvider};

/// Everything the model sees about one finding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElaborationRequest {
    pub file_path: PathBuf,
    pub line_number: usize,
    pub match_text: String,
    /// Rendered snippet with the hit marked
    pub snippet: String,
    /// Wider window read from the source file, when readable
    pub wider_context: Option<String>,
    pub params: ModelParams,
}

impl ElaborationRequest {
    /// `path:line`, used in logs and errors
    pub fn target(&self) -> String {
        format!("{}:{}", self.file_path.display(), self.line_number)
    }
}

/// Turns a request into explanatory text
#[async_trait]
pub trait Elaborator: Send + Sync {
    async fn elaborate(&self, request: &ElaborationRequest) -> Result<String>;
}

/// Elaborator backed by a hosted LLM provider
pub struct LlmElaborator {
    api_key: Option<String>,
}

impl LlmElaborator {
    pub fn new(api_key: Option<String>) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl Elaborator for LlmElaborator {
    async fn elaborate(&self, request: &ElaborationRequest) -> Result<String> {
        let params = &request.params;
        let provider = create_provider(
            &params.provider,
            self.api_key.clone(),
            Some(params.model.clone()),
            params.api_base.clone(),
        )?;

        log::debug!(
            "Elaborating {} with {}/{}",
            request.target(),
            provider.name(),
            params.model
        );

        let text = provider.complete(&prompt::build_prompt(request)).await?;
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_format() {
        let request = ElaborationRequest {
            file_path: PathBuf::from("/repo/a.py"),
            line_number: 7,
            match_text: String::new(),
            snippet: String::new(),
            wider_context: None,
            params: ModelParams {
                provider: "gemini".into(),
                model: "m".into(),
                api_base: None,
            },
        };
        assert_eq!(request.target(), "/repo/a.py:7");
    }

    #[tokio::test]
    async fn test_llm_elaborator_unknown_provider_fails_fast() {
        let request = ElaborationRequest {
            file_path: PathBuf::from("/repo/a.py"),
            line_number: 1,
            match_text: String::new(),
            snippet: "   1: >>> x <<<".into(),
            wider_context: None,
            params: ModelParams {
                provider: "nope".into(),
                model: "m".into(),
                api_base: None,
            },
        };
        let err = LlmElaborator::new(Some("k".into())).elaborate(&request).await.unwrap_err();
        assert!(err.to_string().contains("Unknown provider"));
    }
}
