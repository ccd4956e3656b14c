//! Reasoner seam: the one interface the rerank and judge stages call.
//!
//! Production wires [`OllamaReasoner`] over the shared service profiles;
//! tests stub the trait with canned JSON.

use std::sync::Arc;

use llm_service::LlmServiceProfiles;

use crate::errors::JudgeError;

/// JSON-mode completion backend.
pub trait Reasoner: Send + Sync {
    /// Model identifier stamped onto findings.
    fn model(&self) -> &str;

    fn complete_json<'a>(
        &'a self,
        prompt: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<String, JudgeError>> + Send + 'a>,
    >;
}

/// Production reasoner over the shared Ollama profiles.
pub struct OllamaReasoner {
    svc: Arc<LlmServiceProfiles>,
    model: String,
}

impl OllamaReasoner {
    pub fn new(svc: Arc<LlmServiceProfiles>) -> Self {
        let model = svc.profiles().0.model.clone();
        Self { svc, model }
    }
}

impl Reasoner for OllamaReasoner {
    fn model(&self) -> &str {
        &self.model
    }

    fn complete_json<'a>(
        &'a self,
        prompt: &'a str,
    ) -> std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<String, JudgeError>> + Send + 'a>,
    > {
        Box::pin(async move { Ok(self.svc.complete_json(prompt).await?) })
    }
}
