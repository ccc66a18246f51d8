//! Per-client admission control guarding the analyze entry point.
//!
//! One interface, two backends: a shared redis counter so limits hold across
//! replicas, and a process-local keyed limiter. Losing the shared store must
//! never admit unconditionally; every shared-path failure falls back to the
//! local counter.

use std::num::NonZeroU32;
use std::time::Duration;

use governor::clock::{Clock, DefaultClock};
use governor::{DefaultKeyedRateLimiter, Quota};
use redis::aio::ConnectionManager;

use crate::config::AdmissionConfig;

const SHARED_KEY_PREFIX: &str = "vigil:admit";

/// Request refused before any pipeline work started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionRejection {
    pub retry_after: Duration,
}

pub struct AdmissionController {
    limit: u32,
    window: Duration,
    shared: Option<ConnectionManager>,
    local: DefaultKeyedRateLimiter<String>,
}

impl AdmissionController {
    /// Build the controller, attaching the shared counter store when a URL is
    /// configured and reachable. Unreachable stores degrade to local counting
    /// with a warning rather than failing startup.
    pub async fn connect(config: &AdmissionConfig, redis_url: Option<&str>) -> Self {
        let shared = match redis_url {
            Some(url) => match open_shared_store(url).await {
                Ok(manager) => Some(manager),
                Err(error) => {
                    tracing::warn!(
                        %error,
                        "admission counter store unavailable; using process-local counters"
                    );
                    None
                }
            },
            None => None,
        };

        Self::with_shared(config, shared)
    }

    fn with_shared(config: &AdmissionConfig, shared: Option<ConnectionManager>) -> Self {
        let window = Duration::from_secs(config.window_secs.get());
        Self {
            limit: config.max_requests.get(),
            window,
            shared,
            local: build_local_limiter(config.max_requests, window),
        }
    }

    /// Admit or reject one request for the given client identity. Must be
    /// called before fingerprinting, retrieval, or inference.
    pub async fn admit(&self, client: &str) -> Result<(), AdmissionRejection> {
        debug_assert!(!client.is_empty());
        if let Some(manager) = &self.shared {
            match self.check_shared(manager, client).await {
                Ok(decision) => return decision,
                Err(error) => {
                    tracing::warn!(
                        %error,
                        client,
                        "shared admission check failed; falling back to local counters"
                    );
                }
            }
        }

        self.check_local(client)
    }

    async fn check_shared(
        &self,
        manager: &ConnectionManager,
        client: &str,
    ) -> Result<Result<(), AdmissionRejection>, redis::RedisError> {
        let key = format!("{SHARED_KEY_PREFIX}:{client}");
        let mut conn = manager.clone();

        let count: i64 = redis::cmd("INCR").arg(&key).query_async(&mut conn).await?;
        if count == 1 {
            let _: i64 = redis::cmd("PEXPIRE")
                .arg(&key)
                .arg(self.window.as_millis() as u64)
                .query_async(&mut conn)
                .await?;
        }

        if count > i64::from(self.limit) {
            let ttl_ms: i64 = redis::cmd("PTTL").arg(&key).query_async(&mut conn).await?;
            let retry_after = if ttl_ms > 0 {
                Duration::from_millis(ttl_ms as u64)
            } else {
                self.window
            };
            return Ok(Err(AdmissionRejection { retry_after }));
        }

        Ok(Ok(()))
    }

    fn check_local(&self, client: &str) -> Result<(), AdmissionRejection> {
        match self.local.check_key(&client.to_string()) {
            Ok(()) => Ok(()),
            Err(negative) => {
                let now = DefaultClock::default().now();
                Err(AdmissionRejection {
                    retry_after: negative.wait_time_from(now),
                })
            }
        }
    }
}

async fn open_shared_store(url: &str) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(url)?;
    let mut manager = ConnectionManager::new(client).await?;
    let _: String = redis::cmd("PING").query_async(&mut manager).await?;
    Ok(manager)
}

fn build_local_limiter(
    max_requests: NonZeroU32,
    window: Duration,
) -> DefaultKeyedRateLimiter<String> {
    debug_assert!(window > Duration::ZERO);
    // Replenish `max_requests` cells per window on average, allowing the full
    // quota as an immediate burst so the Nth request in a quiet window passes
    // and the (N+1)th is refused.
    #[allow(deprecated)]
    let quota = Quota::new(max_requests, window)
        .expect("admission window must be non-zero")
        .allow_burst(max_requests);
    DefaultKeyedRateLimiter::keyed(quota)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_controller() -> AdmissionController {
        AdmissionController::with_shared(&AdmissionConfig::default(), None)
    }

    #[tokio::test]
    async fn sixth_request_in_window_is_rejected() {
        let controller = local_controller();
        for attempt in 1..=5 {
            assert!(
                controller.admit("203.0.113.7").await.is_ok(),
                "request {attempt} must be admitted"
            );
        }

        let rejection = controller
            .admit("203.0.113.7")
            .await
            .expect_err("sixth request must be refused");
        assert!(rejection.retry_after > Duration::ZERO);
    }

    #[tokio::test]
    async fn clients_are_counted_independently() {
        let controller = local_controller();
        for _ in 0..5 {
            controller.admit("198.51.100.1").await.expect("first client");
        }
        assert!(controller.admit("198.51.100.1").await.is_err());
        assert!(
            controller.admit("198.51.100.2").await.is_ok(),
            "a different client identity must not share the window"
        );
    }
}
