//! Trope miner orchestrator: judge one work end to end.
//!
//! Usage: `trope-miner <work_id>` with configuration from the environment
//! (see `JudgeConfig::from_env`). Exit codes: 0 success, 2 configuration
//! error, 3 external service unavailable, 4 database error.

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use text_store::TropeStore;
use trope_judge::{CancelFlag, JudgeConfig, JudgeError, OllamaReasoner, run_work};
use vector_store::{CachedEmbedder, QdrantFacade, VectorConfig};

#[tokio::main]
async fn main() -> ExitCode {
    // Load environment variables from .env when present.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("run failed: {e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}

async fn run() -> Result<(), JudgeError> {
    let work_id = std::env::args()
        .nth(1)
        .ok_or_else(|| JudgeError::Config("usage: trope-miner <work_id>".into()))?;
    let db_path = std::env::var("DB_PATH")
        .map_err(|_| JudgeError::Config("DB_PATH is required".into()))?;

    let cfg = JudgeConfig::from_env()?;
    let reasoner_cfg =
        llm_service::config_reasoner().map_err(|e| JudgeError::Config(e.to_string()))?;
    let embedding_cfg =
        llm_service::config_embedding().map_err(|e| JudgeError::Config(e.to_string()))?;
    let vcfg = VectorConfig::from_env().map_err(|e| JudgeError::Config(e.to_string()))?;

    let svc = Arc::new(
        llm_service::LlmServiceProfiles::new(reasoner_cfg, embedding_cfg, Some(10))
            .map_err(|e| JudgeError::Config(e.to_string()))?,
    );

    // One reachability probe before the run; a missing model is survivable
    // (Ollama may pull lazily), an unreachable endpoint is not.
    for status in svc.health_all().await {
        if !status.ok {
            warn!(endpoint = %status.endpoint, model = %status.model, "{}", status.message);
        }
    }

    let facade = QdrantFacade::new(&vcfg)?;
    let embedder = CachedEmbedder::new(
        svc.clone(),
        vcfg.embedding_dim,
        CachedEmbedder::DEFAULT_CACHE_CAP,
    );
    let reasoner = OllamaReasoner::new(svc);
    let mut store = TropeStore::open(&db_path)?;

    let cancel = CancelFlag::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, finishing the current scene");
                cancel.cancel();
            }
        });
    }

    let summary = run_work(
        &mut store,
        &cfg,
        &facade,
        &embedder,
        &reasoner,
        &work_id,
        &cancel,
    )
    .await?;

    info!(
        run_id = %summary.run_id,
        scenes = summary.scenes_total,
        judged = summary.scenes_with_candidates,
        candidates = summary.candidates_inserted,
        findings = summary.findings_written,
        flagged = summary.findings_flagged,
        deleted = summary.findings_deleted,
        "trope mining run finished"
    );
    Ok(())
}
