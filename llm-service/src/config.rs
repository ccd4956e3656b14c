//! Model configs loaded strictly from environment variables.
//!
//! Two roles are used by the pipeline:
//! - **reasoner**  → `REASONER_MODEL` (support rerank + judging)
//! - **embedding** → `EMB_MODEL`
//!
//! Both share the Ollama endpoint resolved from `OLLAMA_URL` (or
//! `OLLAMA_PORT` → `http://localhost:{port}`).

use crate::error_handler::{ConfigError, LlmError, env_opt_u64, must_env, validate_http_endpoint};

/// Configuration for one Ollama model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct LlmModelConfig {
    /// Model identifier (e.g. `"qwen3:14b"`, `"nomic-embed-text"`).
    pub model: String,

    /// Ollama endpoint base URL.
    pub endpoint: String,

    /// Maximum number of tokens to generate.
    pub max_tokens: Option<u32>,

    /// Sampling temperature.
    pub temperature: Option<f32>,

    /// Nucleus sampling parameter.
    pub top_p: Option<f32>,

    /// Request timeout in seconds.
    pub timeout_secs: Option<u64>,
}

/// Resolves the Ollama endpoint strictly from environment.
///
/// Precedence: `OLLAMA_URL` if present and non-empty, else `OLLAMA_PORT`,
/// else the conventional local default.
fn ollama_endpoint() -> Result<String, ConfigError> {
    if let Ok(url) = std::env::var("OLLAMA_URL") {
        if !url.trim().is_empty() {
            validate_http_endpoint("OLLAMA_URL", url.trim())?;
            return Ok(url.trim().to_string());
        }
    }
    if let Ok(port) = std::env::var("OLLAMA_PORT") {
        if !port.trim().is_empty() {
            let _ = port
                .parse::<u16>()
                .map_err(|_| ConfigError::InvalidNumber {
                    var: "OLLAMA_PORT",
                    reason: "expected u16 (1..=65535)",
                })?;
            return Ok(format!("http://localhost:{port}"));
        }
    }
    Ok("http://127.0.0.1:11434".to_string())
}

/// Config for the **reasoner** model used by rerank and judge prompts.
///
/// Low temperature: the caller expects strict JSON, not creativity.
/// Deadline defaults to 120 s (long scenes with several supports).
pub fn config_reasoner() -> Result<LlmModelConfig, LlmError> {
    let endpoint = ollama_endpoint()?;
    let model = must_env("REASONER_MODEL")?;
    let max_tokens = env_opt_u64("LLM_MAX_TOKENS")?.map(|v| v as u32);

    Ok(LlmModelConfig {
        model,
        endpoint,
        max_tokens,
        temperature: Some(0.1),
        top_p: None,
        timeout_secs: Some(120),
    })
}

/// Config for the **embedding** model. Deadline defaults to 30 s.
pub fn config_embedding() -> Result<LlmModelConfig, LlmError> {
    let endpoint = ollama_endpoint()?;
    let model = must_env("EMB_MODEL")?;

    Ok(LlmModelConfig {
        model,
        endpoint,
        max_tokens: None,
        temperature: Some(0.0),
        top_p: None,
        timeout_secs: Some(30),
    })
}
