//! Shared LLM service for the trope mining pipeline.
//!
//! Two active profiles backed by a local Ollama server:
//! - **reasoner**  — support reranking and judging (JSON-mode generation)
//! - **embedding** — vector generation for chunks, scenes, and tropes
//!
//! Construct [`LlmServiceProfiles`] once, wrap in `Arc`, and pass clones to
//! dependents. Underlying HTTP clients are cached per configuration.

pub mod config;
pub mod error_handler;
pub mod health_service;
pub mod ollama_service;
pub mod service_profiles;

pub use config::{LlmModelConfig, config_embedding, config_reasoner};
pub use error_handler::{ConfigError, LlmError};
pub use health_service::{HealthService, HealthStatus};
pub use ollama_service::OllamaService;
pub use service_profiles::LlmServiceProfiles;
