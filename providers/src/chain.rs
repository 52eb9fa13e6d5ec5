use crate::Identified;
use crate::error::{ErrorKind, ProviderError};
use futures::future::BoxFuture;
use log::{debug, warn};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Retry budget for a single provider before the chain advances to the next
/// fallback. Timeouts are enforced here; the underlying client's own timeout,
/// if any, is not trusted.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub retries_per_provider: u32,
    pub initial_backoff: Duration,
    pub call_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries_per_provider: 2,
            initial_backoff: Duration::from_millis(500),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// One call to one provider, successful or not. The pipeline persists every
/// one of these as an audit row.
#[derive(Debug, Clone)]
pub struct ProviderAttempt {
    pub provider: String,
    pub elapsed_ms: i64,
    pub fallback_used: bool,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

/// The terminal result of driving a provider chain: the value or the last
/// error, which provider was asked last, total wall-clock time, and the
/// per-attempt history.
#[derive(Debug)]
pub struct ChainOutcome<T> {
    pub result: Result<T, ProviderError>,
    pub provider: String,
    pub elapsed_ms: i64,
    pub fallback_used: bool,
    pub attempts: Vec<ProviderAttempt>,
}

/// An ordered list of providers for one stage kind: primary first, fallbacks
/// after. Bound from configuration at startup.
pub struct Chain<P: ?Sized> {
    providers: Vec<Arc<P>>,
    policy: RetryPolicy,
}

impl<P: ?Sized> Clone for Chain<P> {
    fn clone(&self) -> Self {
        Self {
            providers: self.providers.clone(),
            policy: self.policy.clone(),
        }
    }
}

impl<P: Identified + ?Sized + Send + Sync> Chain<P> {
    pub fn new(providers: Vec<Arc<P>>, policy: RetryPolicy) -> Self {
        Self { providers, policy }
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub fn provider_ids(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.id()).collect()
    }

    /// Drive the chain: try the primary with the per-provider retry budget,
    /// advance to the next fallback on retriable exhaustion, stop immediately
    /// on a non-retriable error. The outcome always reports the last provider
    /// asked and the full attempt history.
    pub async fn invoke<'a, T, F>(&'a self, mut call: F) -> ChainOutcome<T>
    where
        F: FnMut(&'a P) -> BoxFuture<'a, Result<T, ProviderError>>,
    {
        let started = Instant::now();
        let mut attempts: Vec<ProviderAttempt> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut last_provider = String::new();
        let mut last_was_fallback = false;

        for (provider_index, provider) in self.providers.iter().enumerate() {
            let is_fallback = provider_index > 0;
            let mut backoff = self.policy.initial_backoff;

            for attempt in 0..=self.policy.retries_per_provider {
                let attempt_started = Instant::now();
                let result = match tokio::time::timeout(
                    self.policy.call_timeout,
                    call(provider.as_ref()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ProviderError::timeout(
                        provider.id(),
                        self.policy.call_timeout.as_millis(),
                    )),
                };
                let attempt_ms = attempt_started.elapsed().as_millis() as i64;
                last_provider = provider.id().to_string();
                last_was_fallback = is_fallback;

                match result {
                    Ok(value) => {
                        attempts.push(ProviderAttempt {
                            provider: last_provider.clone(),
                            elapsed_ms: attempt_ms,
                            fallback_used: is_fallback,
                            error_kind: None,
                            error_message: None,
                        });
                        return ChainOutcome {
                            result: Ok(value),
                            provider: last_provider,
                            elapsed_ms: started.elapsed().as_millis() as i64,
                            fallback_used: is_fallback,
                            attempts,
                        };
                    }
                    Err(err) => {
                        warn!(
                            "Provider {} attempt {} failed: {err}",
                            provider.id(),
                            attempt + 1,
                        );
                        attempts.push(ProviderAttempt {
                            provider: last_provider.clone(),
                            elapsed_ms: attempt_ms,
                            fallback_used: is_fallback,
                            error_kind: Some(err.kind),
                            error_message: Some(err.message.clone()),
                        });

                        if !err.kind.is_retriable() {
                            // A structural refusal. Retrying or falling back
                            // will not change the request.
                            return ChainOutcome {
                                result: Err(err),
                                provider: last_provider,
                                elapsed_ms: started.elapsed().as_millis() as i64,
                                fallback_used: is_fallback,
                                attempts,
                            };
                        }
                        last_error = Some(err);

                        if attempt < self.policy.retries_per_provider {
                            let delay = jittered(backoff);
                            debug!(
                                "Retrying provider {} in {}ms",
                                provider.id(),
                                delay.as_millis(),
                            );
                            tokio::time::sleep(delay).await;
                            backoff *= 2;
                        }
                    }
                }
            }
        }

        let error = last_error.unwrap_or_else(|| {
            ProviderError::new(ErrorKind::Permanent, "none", "no providers configured")
        });

        ChainOutcome {
            result: Err(error),
            provider: last_provider,
            elapsed_ms: started.elapsed().as_millis() as i64,
            fallback_used: last_was_fallback,
            attempts,
        }
    }
}

fn jittered(base: Duration) -> Duration {
    base.mul_f64(rand::thread_rng().gen_range(0.5..1.5))
}
