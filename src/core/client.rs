//! External translation API client

use async_trait::async_trait;
use reqwest::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::core::config::TranslatorConfig;
use crate::core::errors::{Result, TranslationError};
use crate::core::models::{TranslationRequest, TranslationResult};

/// Calling contract of the external translation service.
///
/// Implementations classify failures as `RateLimited`, `Transient` or
/// `Terminal` so callers can decide whether to retry.
#[async_trait]
pub trait TranslationApi: Send + Sync {
    async fn translate(&self, request: &TranslationRequest) -> Result<TranslationResult>;
}

/// HTTP client for an OpenAI-compatible chat completions endpoint
#[derive(Debug, Clone)]
pub struct AsyncTranslator {
    client: reqwest::Client,
    config: Arc<TranslatorConfig>,
}

impl AsyncTranslator {
    /// Create a new async translator
    pub fn new(config: TranslatorConfig) -> Result<Self> {
        config.validate()?;

        let timeout = Duration::from_millis(config.timeout_ms);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .pool_idle_timeout(Some(Duration::from_secs(30)))
            .pool_max_idle_per_host(config.max_concurrent)
            .build()?;

        Ok(Self {
            client,
            config: Arc::new(config),
        })
    }

    /// Create from environment
    pub fn from_env() -> Result<Self> {
        let config = TranslatorConfig::load()?;
        Self::new(config)
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    /// Build the chat completion body for one chunk
    fn build_body(&self, request: &TranslationRequest) -> serde_json::Value {
        let mut system = format!(
            "You are a professional literary translator. Translate the user's text into {} \
             using a {} tone. Return only the translation.",
            request.target_lang, request.tone
        );
        if let Some(context) = &request.context_text {
            system.push_str(
                "\n\nThe following passages were translated immediately before this text. \
                 Keep terminology, names and narrative voice consistent with them; do not \
                 repeat them in your answer.\n\n",
            );
            system.push_str(context);
        }

        serde_json::json!({
            "model": self.config.model,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": request.chunk_text }
            ]
        })
    }

    /// Send actual HTTP request
    async fn send_request(&self, request: &TranslationRequest) -> Result<TranslationResult> {
        let body = self.build_body(request);

        let response = self
            .client
            .post(&self.config.api_endpoint)
            .header("Authorization", format!("Bearer {}", self.config.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| TranslationError::transient(format!("network error: {}", e)))?;

        let status = response.status();
        if status.is_success() {
            let json: serde_json::Value = response
                .json()
                .await
                .map_err(|e| TranslationError::transient(format!("invalid response: {}", e)))?;
            return parse_completion(&json, &self.config.model);
        }

        let retry_after_ms = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let error_text = response.text().await.unwrap_or_default();

        Err(classify_status(status, retry_after_ms, error_text))
    }
}

#[async_trait]
impl TranslationApi for AsyncTranslator {
    async fn translate(&self, request: &TranslationRequest) -> Result<TranslationResult> {
        debug!(
            chars = request.chunk_text.len(),
            has_context = request.context_text.is_some(),
            "Sending translation request"
        );
        let result = self.send_request(request).await;
        if let Err(e) = &result {
            warn!(kind = %e.kind(), "Translation request failed: {}", e);
        }
        result
    }
}

/// Map an HTTP failure onto the error taxonomy
fn classify_status(
    status: StatusCode,
    retry_after_ms: Option<u64>,
    message: String,
) -> TranslationError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return TranslationError::RateLimited {
            message: format!("provider throttled: {}", message),
            retry_after_ms,
        };
    }

    if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        return TranslationError::transient(format!("{} - {}", status.as_u16(), message));
    }

    TranslationError::terminal(format!("{} - {}", status.as_u16(), message))
}

/// Pull the translation and usage out of a chat completion response
fn parse_completion(json: &serde_json::Value, model: &str) -> Result<TranslationResult> {
    let translated_text = json["choices"]
        .get(0)
        .and_then(|c| c["message"]["content"].as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| TranslationError::transient("no translation in response"))?;

    let input_tokens = json["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as u32;
    let output_tokens = json["usage"]["completion_tokens"].as_u64().unwrap_or(0) as u32;

    Ok(TranslationResult {
        translated_text,
        input_tokens,
        output_tokens,
        model_used: json["model"].as_str().unwrap_or(model).to_string(),
        request_id: json["id"].as_str().map(|s| s.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::errors::ErrorKind;
    use serde_json::json;

    fn translator() -> AsyncTranslator {
        let mut config = TranslatorConfig {
            api_key: "test_key".to_string(),
            api_endpoint: "https://test.com/v1/chat/completions".to_string(),
            ..Default::default()
        };
        config.fill_default_buckets();
        AsyncTranslator::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_translator_creation() {
        assert_eq!(translator().model(), "gpt-4o-mini");
    }

    #[test]
    fn test_status_classification() {
        let limited = classify_status(StatusCode::TOO_MANY_REQUESTS, Some(3000), "slow down".into());
        assert_eq!(limited.kind(), ErrorKind::RateLimited);
        assert!(matches!(
            limited,
            TranslationError::RateLimited {
                retry_after_ms: Some(3000),
                ..
            }
        ));

        let unavailable = classify_status(StatusCode::BAD_GATEWAY, None, String::new());
        assert_eq!(unavailable.kind(), ErrorKind::Transient);

        let invalid = classify_status(StatusCode::UNPROCESSABLE_ENTITY, None, "bad".into());
        assert_eq!(invalid.kind(), ErrorKind::Terminal);
    }

    #[test]
    fn test_parse_completion() {
        let body = json!({
            "id": "chatcmpl-1",
            "model": "gpt-4o-mini",
            "choices": [{ "message": { "role": "assistant", "content": " Bonjour \n" } }],
            "usage": { "prompt_tokens": 120, "completion_tokens": 40 }
        });

        let result = parse_completion(&body, "fallback").unwrap();
        assert_eq!(result.translated_text, "Bonjour");
        assert_eq!(result.total_tokens(), 160);
        assert_eq!(result.request_id.as_deref(), Some("chatcmpl-1"));
    }

    #[test]
    fn test_empty_completion_is_transient() {
        let body = json!({ "choices": [] });
        let err = parse_completion(&body, "m").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
    }

    #[test]
    fn test_context_goes_into_system_prompt() {
        let request = TranslationRequest::new("Hello", "French")
            .with_tone("formal")
            .with_context("Bonjour.");
        let body = translator().build_body(&request);

        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.contains("French"));
        assert!(system.contains("formal"));
        assert!(system.ends_with("Bonjour."));
        assert_eq!(body["messages"][1]["content"], "Hello");
    }
}
