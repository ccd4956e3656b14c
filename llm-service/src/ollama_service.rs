//! Thin Ollama client for text generation and embeddings.
//!
//! Two endpoints, both non-streaming:
//! - `POST {endpoint}/api/generate`, optionally with `format="json"` so
//!   Ollama constrains decoding to valid JSON (the shape of that JSON is
//!   still the caller's problem)
//! - `POST {endpoint}/api/embeddings`
//!
//! Every response goes through one status gate before decoding; a non-2xx
//! body is clipped into the error so logs stay readable.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::LlmModelConfig;
use crate::error_handler::{ConfigError, LlmError, make_snippet, validate_http_endpoint};

/// Result alias for Ollama operations.
pub type Result<T> = std::result::Result<T, LlmError>;

/// Reusable client bound to one `(endpoint, model, timeout)` config.
pub struct OllamaService {
    client: reqwest::Client,
    cfg: LlmModelConfig,
    url_generate: String,
    url_embeddings: String,
}

impl OllamaService {
    /// Creates a new service from the given config.
    ///
    /// # Errors
    /// - [`ConfigError::EmptyModel`] if the model name is blank
    /// - [`ConfigError::InvalidFormat`] if the endpoint is not http(s)
    /// - [`LlmError::HttpTransport`] if the HTTP client cannot be built
    pub fn new(cfg: LlmModelConfig) -> Result<Self> {
        if cfg.model.trim().is_empty() {
            return Err(ConfigError::EmptyModel.into());
        }
        let endpoint = cfg.endpoint.trim();
        validate_http_endpoint("endpoint", endpoint)?;

        let timeout = cfg
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| Duration::from_secs(60));

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        let base = endpoint.trim_end_matches('/').to_string();
        let url_generate = format!("{}/api/generate", base);
        let url_embeddings = format!("{}/api/embeddings", base);

        Ok(Self {
            client,
            cfg,
            url_generate,
            url_embeddings,
        })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    /// Free-text generation.
    pub async fn generate(&self, prompt: &str) -> Result<String> {
        self.generate_inner(prompt, None).await
    }

    /// Generation constrained to valid JSON (`format="json"`).
    pub async fn generate_json(&self, prompt: &str) -> Result<String> {
        self.generate_inner(prompt, Some("json")).await
    }

    async fn generate_inner(&self, prompt: &str, format: Option<&str>) -> Result<String> {
        let body = GenerateRequest::from_cfg(&self.cfg, prompt, format);
        debug!(
            model = %self.cfg.model,
            url = %self.url_generate,
            json_mode = format.is_some(),
            "generate request"
        );

        let resp = self
            .client
            .post(&self.url_generate)
            .json(&body)
            .send()
            .await?;
        let resp = reject_bad_status(resp, &self.url_generate).await?;

        let decoded: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| LlmError::Decode(format!("generate response has the wrong shape: {e}")))?;
        Ok(decoded.response)
    }

    /// Retrieves an embedding for `input`.
    pub async fn embeddings(&self, input: &str) -> Result<Vec<f32>> {
        let body = EmbeddingsRequest {
            model: &self.cfg.model,
            prompt: input,
        };
        debug!(
            model = %self.cfg.model,
            url = %self.url_embeddings,
            input_len = input.len(),
            "embeddings request"
        );

        let resp = self
            .client
            .post(&self.url_embeddings)
            .json(&body)
            .send()
            .await?;
        let resp = reject_bad_status(resp, &self.url_embeddings).await?;

        let decoded: EmbeddingsResponse = resp.json().await.map_err(|e| {
            LlmError::Decode(format!("embeddings response has the wrong shape: {e}"))
        })?;
        Ok(decoded.embedding)
    }
}

/// Pass a 2xx response through; turn anything else into [`LlmError::HttpStatus`]
/// carrying a clipped body snippet.
async fn reject_bad_status(resp: reqwest::Response, url: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(LlmError::HttpStatus {
        status,
        url: url.to_string(),
        snippet: make_snippet(&body),
    })
}

// Request/response shapes for the two endpoints.

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    options: Option<GenerateOptions>,
}

impl<'a> GenerateRequest<'a> {
    fn from_cfg(cfg: &'a LlmModelConfig, prompt: &'a str, format: Option<&'a str>) -> Self {
        let options = GenerateOptions {
            temperature: cfg.temperature,
            top_p: cfg.top_p,
            num_predict: cfg.max_tokens,
        };

        Self {
            model: &cfg.model,
            prompt,
            stream: false,
            format,
            options: Some(options),
        }
    }
}

/// Subset of Ollama `options` this pipeline tunes.
#[derive(Debug, Default, Serialize)]
struct GenerateOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_predict: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    embedding: Vec<f32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(model: &str, endpoint: &str) -> LlmModelConfig {
        LlmModelConfig {
            model: model.into(),
            endpoint: endpoint.into(),
            max_tokens: None,
            temperature: Some(0.0),
            top_p: None,
            timeout_secs: Some(5),
        }
    }

    #[test]
    fn rejects_empty_model() {
        assert!(OllamaService::new(cfg("", "http://localhost:11434")).is_err());
    }

    #[test]
    fn rejects_schemeless_endpoint() {
        assert!(OllamaService::new(cfg("m", "localhost:11434")).is_err());
    }

    #[test]
    fn json_mode_sets_format_field() {
        let c = cfg("m", "http://localhost:11434");
        let req = GenerateRequest::from_cfg(&c, "hello", Some("json"));
        let v: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&req).unwrap()).unwrap();
        assert_eq!(v["format"], "json");
        assert_eq!(v["stream"], false);
    }
}
