use crate::error::ProviderError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::json;
use std::time::Duration;
use tracing::debug;

/// Boundary to the model serving the fleet's inference calls. The
/// executor never talks HTTP directly, so tests swap in scripted
/// providers.
#[async_trait]
pub trait InferenceProvider: Send + Sync {
    async fn generate(&self, prompt: &str, model_id: &str) -> Result<String, ProviderError>;
}

/// OpenAI-compatible chat completion client.
pub struct HttpProvider {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into(),
            api_key,
            client,
        }
    }
}

#[async_trait]
impl InferenceProvider for HttpProvider {
    async fn generate(&self, prompt: &str, model_id: &str) -> Result<String, ProviderError> {
        let body = json!({
            "model": model_id,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let mut request = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Unknown(e.to_string())
            }
        })?;

        match response.status() {
            StatusCode::TOO_MANY_REQUESTS => return Err(ProviderError::RateLimited),
            StatusCode::NOT_FOUND => return Err(ProviderError::InvalidModel(model_id.into())),
            status if !status.is_success() => {
                return Err(ProviderError::Unknown(format!(
                    "provider returned {status}"
                )));
            }
            _ => {}
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ProviderError::Unknown(e.to_string()))?;
        payload["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_owned)
            .ok_or_else(|| ProviderError::Unknown("malformed provider response".into()))
    }
}

/// Offline provider that reflects the prompt back. Used in tests and on
/// nodes running without model access.
#[derive(Debug, Default)]
pub struct EchoProvider;

#[async_trait]
impl InferenceProvider for EchoProvider {
    async fn generate(&self, prompt: &str, model_id: &str) -> Result<String, ProviderError> {
        debug!(model_id, "echo provider serving request");
        let head: String = prompt.chars().take(120).collect();
        Ok(format!("[{model_id}] {head}"))
    }
}
