//! Ollama Client
//!
//! HTTP boundary to the Ollama-compatible generation backend. Every failure
//! mode collapses to `false`/empty/`None` so callers never see transport
//! errors, only "no usable output".

use async_trait::async_trait;
use std::time::Duration;
use tracing::error;

/// Short timeout for the availability probe.
const AVAILABILITY_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for a single generate call.
#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub temperature: f32,
    pub top_p: f32,
    pub repeat_penalty: f32,
    pub max_tokens: usize,
    pub timeout: Duration,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            temperature: 0.05,
            top_p: 0.9,
            repeat_penalty: 1.1,
            max_tokens: 400,
            timeout: Duration::from_secs(120),
        }
    }
}

/// Remote text-generation service.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Probe the backend; `false` on any network, timeout or non-200 error.
    async fn is_available(&self) -> bool;

    /// Available model identifiers, or empty on failure.
    async fn list_models(&self) -> Vec<String>;

    /// Whether `model_name` is an exact or substring match of a listed model.
    async fn model_available(&self, model_name: &str) -> bool {
        self.list_models()
            .await
            .iter()
            .any(|model| model.contains(model_name))
    }

    /// Single non-streaming generate call; `None` on any failure.
    async fn generate(&self, model: &str, prompt: &str, options: &GenerateOptions) -> Option<String>;
}

/// Client for an Ollama server.
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl GenerationBackend for OllamaClient {
    async fn is_available(&self) -> bool {
        match self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(AVAILABILITY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(response) => response.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    async fn list_models(&self) -> Vec<String> {
        let response = match self.client.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(r) => r,
            Err(e) => {
                error!("Failed to list models: {}", e);
                return Vec::new();
            }
        };
        if response.status() != reqwest::StatusCode::OK {
            return Vec::new();
        }
        let data: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to parse model list: {}", e);
                return Vec::new();
            }
        };
        data.get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()).map(String::from))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn generate(&self, model: &str, prompt: &str, options: &GenerateOptions) -> Option<String> {
        let payload = serde_json::json!({
            "model": model,
            "prompt": prompt,
            "stream": false,
            "options": {
                "temperature": options.temperature,
                "top_p": options.top_p,
                "repeat_penalty": options.repeat_penalty,
                "num_predict": options.max_tokens,
            }
        });

        let response = match self
            .client
            .post(format!("{}/api/generate", self.base_url))
            .json(&payload)
            .timeout(options.timeout)
            .send()
            .await
        {
            Ok(r) => r,
            Err(e) => {
                error!("Generation request failed: {}", e);
                return None;
            }
        };

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            error!("Generation backend error ({}): {}", status, body);
            return None;
        }

        let data: serde_json::Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                error!("Failed to parse generation response: {}", e);
                return None;
            }
        };
        data.get("response").and_then(|r| r.as_str()).map(|s| s.trim().to_string())
    }
}
