//! Bounded retry with exponential backoff for external calls.
//!
//! Transient transport failures retry up to 3 attempts; parse and
//! configuration errors surface immediately.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use llm_service::LlmError;
use vector_store::VectorError;

const BASE_DELAY_MS: u64 = 500;

/// Run `op` up to `attempts` times, sleeping `500ms * 2^n` between tries.
/// Errors rejected by `is_transient` are returned without retrying.
pub async fn with_retry<T, E, F, Fut>(
    what: &str,
    attempts: u32,
    op: F,
    is_transient: fn(&E) -> bool,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt + 1 < attempts && is_transient(&e) => {
                let delay = BASE_DELAY_MS * 2u64.pow(attempt);
                warn!(
                    op = what,
                    attempt = attempt + 1,
                    delay_ms = delay,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Vector-layer errors worth retrying: transport and timeout, not shape.
pub fn is_transient_vector(e: &VectorError) -> bool {
    matches!(
        e,
        VectorError::Qdrant(_) | VectorError::EmbedUnavailable(_) | VectorError::Timeout { .. }
    )
}

/// LLM-layer errors worth retrying: transport and 5xx, not decode.
pub fn is_transient_llm(e: &LlmError) -> bool {
    match e {
        LlmError::HttpTransport(_) => true,
        LlmError::HttpStatus { status, .. } => status.is_server_error(),
        _ => false,
    }
}

/// Pipeline-level predicate, delegating to the layer the error came from.
pub fn is_transient_judge(e: &crate::errors::JudgeError) -> bool {
    match e {
        crate::errors::JudgeError::Llm(inner) => is_transient_llm(inner),
        crate::errors::JudgeError::Vector(inner) => is_transient_vector(inner),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_up_to_limit() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retry(
            "test",
            3,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("boom")
            },
            |_| true,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_transient_errors_fail_fast() {
        let calls = AtomicU32::new(0);
        let result: Result<(), &str> = with_retry(
            "test",
            3,
            || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("parse")
            },
            |_| false,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_transient_failure() {
        let calls = AtomicU32::new(0);
        let result = with_retry(
            "test",
            3,
            || async {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("boom")
                } else {
                    Ok(42)
                }
            },
            |_| true,
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
