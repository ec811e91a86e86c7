//! Generative text backend.
//!
//! The orchestrator sends one prompt per cycle and gets back one raw text
//! block. Errors are `Err`; a reply with no text is `Ok("")`, so callers can
//! tell a failed call from an empty answer.

pub mod request;

use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::error::AppError;
use crate::settings::BackendSettings;

pub trait TextBackend: Send + Sync {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, AppError>>;
}

/// Any server speaking the OpenAI chat-completions protocol.
pub struct OpenAiCompatibleBackend {
    client: reqwest::Client,
    settings: BackendSettings,
}

impl OpenAiCompatibleBackend {
    pub fn new(settings: BackendSettings) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self { client, settings })
    }

    async fn complete(&self, prompt: &str) -> Result<String, AppError> {
        let url = request::chat_completions_endpoint(&self.settings.base_url);
        let body = request::build_chat_body(&self.settings, prompt);

        tracing::debug!(
            target: "backend",
            "POST {} model={} prompt_chars={}",
            url,
            self.settings.model,
            prompt.chars().count()
        );

        let mut req = self.client.post(&url).json(&body);
        if let Some(key) = self.settings.api_key.as_deref().filter(|k| !k.is_empty()) {
            req = req.bearer_auth(key);
        }

        let response = req.send().await?;
        let status = response.status();
        let raw = response.text().await?;
        let data: Value = serde_json::from_str(&raw).unwrap_or(Value::String(raw));

        if !status.is_success() {
            let message = request::extract_error_message(&data)
                .unwrap_or_else(|| format!("backend returned HTTP {}", status.as_u16()));
            tracing::warn!(target: "backend", "completion failed ({}): {}", status, message);
            return Err(AppError::Generation(message));
        }

        Ok(request::extract_text(&data).unwrap_or_default())
    }
}

impl TextBackend for OpenAiCompatibleBackend {
    fn generate<'a>(&'a self, prompt: &'a str) -> BoxFuture<'a, Result<String, AppError>> {
        self.complete(prompt).boxed()
    }
}
