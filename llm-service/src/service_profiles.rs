//! Shared LLM service with two active profiles: `reasoner` and `embedding`.
//!
//! - Lives in the same Tokio runtime as the application.
//! - Construct once, wrap in `Arc`, pass clones to dependents.
//! - Caches underlying HTTP clients per config (endpoint+model+timeout).

use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::Arc,
    time::Instant,
};

use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::LlmModelConfig;
use crate::error_handler::LlmError;
use crate::health_service::{HealthService, HealthStatus};
use crate::ollama_service::OllamaService;

/// Manages the two logical profiles used by the judging pipeline.
pub struct LlmServiceProfiles {
    reasoner: LlmModelConfig,
    embedding: LlmModelConfig,

    clients: RwLock<HashMap<ClientKey, Arc<OllamaService>>>,

    health: HealthService,
}

impl LlmServiceProfiles {
    /// Creates a new service with the two profiles.
    pub fn new(
        reasoner: LlmModelConfig,
        embedding: LlmModelConfig,
        health_timeout_secs: Option<u64>,
    ) -> Result<Self, LlmError> {
        info!(
            reasoner.model = %reasoner.model,
            reasoner.endpoint = %reasoner.endpoint,
            embedding.model = %embedding.model,
            embedding.endpoint = %embedding.endpoint,
            health_timeout_secs,
            "LlmServiceProfiles initialized"
        );

        Ok(Self {
            reasoner,
            embedding,
            clients: RwLock::new(HashMap::new()),
            health: HealthService::new(health_timeout_secs)?,
        })
    }

    /// Strict-JSON generation with the **reasoner** profile.
    pub async fn complete_json(&self, prompt: &str) -> Result<String, LlmError> {
        let started = Instant::now();
        let cli = self.get_or_init(&self.reasoner).await?;
        let out = cli.generate_json(prompt).await;
        if out.is_ok() {
            info!(
                model = %self.reasoner.model,
                prompt_len = prompt.len(),
                latency_ms = started.elapsed().as_millis(),
                "reasoner generation completed"
            );
        }
        out
    }

    /// Computes an embedding with the **embedding** profile.
    pub async fn embed(&self, input: &str) -> Result<Vec<f32>, LlmError> {
        let started = Instant::now();
        let cli = self.get_or_init(&self.embedding).await?;
        let out = cli.embeddings(input).await;
        if out.is_ok() {
            info!(
                model = %self.embedding.model,
                input_len = input.len(),
                latency_ms = started.elapsed().as_millis(),
                "embedding completed"
            );
        }
        out
    }

    /// Returns a health snapshot for both profiles (deduplicated).
    pub async fn health_all(&self) -> Vec<HealthStatus> {
        let mut list = vec![self.reasoner.clone()];
        if self.embedding != self.reasoner {
            list.push(self.embedding.clone());
        }
        debug!(profiles = list.len(), "running health checks");
        self.health.check_many(&list).await
    }

    /// Returns references to the current profiles `(reasoner, embedding)`.
    pub fn profiles(&self) -> (&LlmModelConfig, &LlmModelConfig) {
        (&self.reasoner, &self.embedding)
    }

    /* --------------------- Internals --------------------- */

    async fn get_or_init(&self, cfg: &LlmModelConfig) -> Result<Arc<OllamaService>, LlmError> {
        let key = ClientKey::from(cfg);

        if let Some(cli) = self.clients.read().await.get(&key).cloned() {
            debug!(model = %cfg.model, "client cache hit");
            return Ok(cli);
        }

        debug!(model = %cfg.model, "client cache miss (initializing)");
        let cli = Arc::new(OllamaService::new(cfg.clone())?);
        let mut w = self.clients.write().await;
        let entry = w.entry(key).or_insert(cli);
        Ok(entry.clone())
    }
}

/// Internal cache key to identify unique client configs.
#[derive(Clone, Eq, PartialEq, Debug)]
struct ClientKey {
    endpoint: String,
    model: String,
    timeout: Option<u64>,
}

impl From<&LlmModelConfig> for ClientKey {
    fn from(cfg: &LlmModelConfig) -> Self {
        Self {
            endpoint: cfg.endpoint.clone(),
            model: cfg.model.clone(),
            timeout: cfg.timeout_secs,
        }
    }
}

impl Hash for ClientKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.endpoint.hash(state);
        self.model.hash(state);
        self.timeout.hash(state);
    }
}
