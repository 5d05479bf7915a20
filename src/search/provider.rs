//! Embedding provider trait and the retry wrapper used around every call.
//!
//! The engine never constructs a provider itself; the composing
//! application injects one (or none, which puts the service in degraded
//! mode).

use crate::core::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, warn};

/// Trait for embedding providers.
///
/// Implementations should be Send + Sync to allow use in async contexts.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Identifier of the model producing the vectors
    fn model_name(&self) -> &str;

    /// Dimension of every returned vector
    fn dimensions(&self) -> usize;

    /// Embed document fragments, one vector per input in the same order
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// Embed a search query
    async fn embed_one(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| Error::Provider("provider returned no vector for query".to_string()))
    }
}

/// Timeout and retry policy for provider calls.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Deadline for a single attempt
    pub timeout: Duration,
    /// Attempts made after the first one fails
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
    /// Upper bound for any single delay
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            initial_backoff: Duration::from_millis(250),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay_ms = self.initial_backoff.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32);
        let delay_ms = delay_ms.min(self.max_backoff.as_millis() as f64) as u64;
        Duration::from_millis(delay_ms)
    }

    /// Run `call` until it succeeds, fails permanently, or retries run out.
    ///
    /// Each attempt is bounded by `timeout`. When every attempt timed out
    /// the result is [`Error::ProviderTimeout`].
    pub async fn run<T, F, Fut>(&self, what: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let attempts = self.max_retries + 1;
        let mut last_error = None;

        for attempt in 0..attempts {
            let error = match tokio::time::timeout(self.timeout, call()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_retryable() => return Err(e),
                Ok(Err(e)) => e,
                Err(_) => Error::ProviderTimeout {
                    attempts: attempt + 1,
                    timeout_ms: self.timeout.as_millis() as u64,
                },
            };

            if attempt + 1 < attempts {
                let delay = self.delay_for_attempt(attempt);
                warn!(
                    "{} failed (attempt {}/{}): {}; retrying in {:?}",
                    what,
                    attempt + 1,
                    attempts,
                    error,
                    delay
                );
                tokio::time::sleep(delay).await;
            } else {
                debug!("{} failed on final attempt {}: {}", what, attempt + 1, error);
            }
            last_error = Some(error);
        }

        Err(match last_error {
            Some(Error::ProviderTimeout { timeout_ms, .. }) => Error::ProviderTimeout {
                attempts,
                timeout_ms,
            },
            Some(e) => e,
            None => Error::Provider(format!("{} was never attempted", what)),
        })
    }
}

/// Check a provider response against the request it answers
pub fn validate_vectors(vectors: &[Vec<f32>], expected_count: usize, dimensions: usize) -> Result<()> {
    if vectors.len() != expected_count {
        return Err(Error::Provider(format!(
            "expected {} vectors, provider returned {}",
            expected_count,
            vectors.len()
        )));
    }
    if let Some(bad) = vectors.iter().find(|v| v.len() != dimensions) {
        return Err(Error::DimensionMismatch {
            expected: dimensions,
            actual: bad.len(),
        });
    }
    if vectors.iter().flatten().any(|x| !x.is_finite()) {
        return Err(Error::Provider(
            "provider returned a non-finite vector component".to_string(),
        ));
    }
    Ok(())
}

/// Embed a batch with timeout, retries and response validation
pub async fn embed_batch_with_retry(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
    policy: &RetryPolicy,
) -> Result<Vec<Vec<f32>>> {
    let vectors = policy
        .run("embedding batch", move || provider.embed_batch(texts))
        .await?;
    validate_vectors(&vectors, texts.len(), provider.dimensions())?;
    Ok(vectors)
}

/// Embed a query with timeout, retries and response validation
pub async fn embed_query_with_retry(
    provider: &dyn EmbeddingProvider,
    query: &str,
    policy: &RetryPolicy,
) -> Result<Vec<f32>> {
    let vector = policy.run("query embedding", move || provider.embed_one(query)).await?;
    validate_vectors(std::slice::from_ref(&vector), 1, provider.dimensions())?;
    Ok(vector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
        delay: Duration,
    }

    impl Flaky {
        fn new(failures: u32, delay: Duration) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Flaky {
        fn model_name(&self) -> &str {
            "flaky"
        }

        fn dimensions(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(Error::Provider("transient".to_string()));
            }
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            timeout: Duration::from_millis(200),
            max_retries,
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        }
    }

    #[test]
    fn test_delay_for_attempt_is_capped() {
        let policy = RetryPolicy {
            initial_backoff: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_backoff: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failure() {
        let provider = Flaky::new(2, Duration::ZERO);
        let texts = vec!["a".to_string(), "b".to_string()];
        let vectors = embed_batch_with_retry(&provider, &texts, &fast_policy(2))
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_retries() {
        let provider = Flaky::new(5, Duration::ZERO);
        let texts = vec!["a".to_string()];
        let result = embed_batch_with_retry(&provider, &texts, &fast_policy(1)).await;
        assert!(matches!(result, Err(Error::Provider(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_timeout_surfaces_as_provider_timeout() {
        let provider = Flaky::new(0, Duration::from_secs(5));
        let policy = RetryPolicy {
            timeout: Duration::from_millis(20),
            max_retries: 1,
            initial_backoff: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let result = embed_query_with_retry(&provider, "q", &policy).await;
        match result {
            Err(Error::ProviderTimeout { attempts, timeout_ms }) => {
                assert_eq!(attempts, 2);
                assert_eq!(timeout_ms, 20);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unavailable_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = fast_policy(3)
            .run("lookup", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::ProviderUnavailable("no model".to_string())) }
            })
            .await;
        assert!(matches!(result, Err(Error::ProviderUnavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_validate_vectors() {
        assert!(validate_vectors(&[vec![0.0, 1.0]], 1, 2).is_ok());
        assert!(matches!(
            validate_vectors(&[vec![0.0, 1.0]], 2, 2),
            Err(Error::Provider(_))
        ));
        assert!(matches!(
            validate_vectors(&[vec![0.0]], 1, 2),
            Err(Error::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }

    #[test]
    fn test_validate_vectors_rejects_non_finite_components() {
        assert!(matches!(
            validate_vectors(&[vec![0.0, 1.0], vec![f32::NAN, 0.0]], 2, 2),
            Err(Error::Provider(_))
        ));
        assert!(matches!(
            validate_vectors(&[vec![f32::NEG_INFINITY, 1.0]], 1, 2),
            Err(Error::Provider(_))
        ));
    }
}
