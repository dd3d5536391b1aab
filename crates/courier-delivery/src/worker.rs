//! Delivery worker: claims due deliveries and drives each through one attempt.

use std::{sync::Arc, time::Duration};

use courier_core::{
    BrokerStorage, ClaimRequest, ClaimedDelivery, Clock, Completion, CoreError, Delivery,
    DeliveryTransition,
};
use tokio::{sync::RwLock, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::{
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, ErrorCategory, Result},
    executor::WebhookExecutor,
    metrics,
};

/// Individual worker that processes webhook deliveries.
///
/// Workers share nothing but the store: claim leases are the only mutual
/// exclusion, so any number of workers in any number of processes can run
/// against the same database.
pub(crate) struct DeliveryWorker {
    id: String,
    storage: Arc<dyn BrokerStorage>,
    config: DeliveryConfig,
    executor: Arc<WebhookExecutor>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl DeliveryWorker {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: String,
        storage: Arc<dyn BrokerStorage>,
        config: DeliveryConfig,
        executor: Arc<WebhookExecutor>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { id, storage, config, executor, stats, cancellation_token, clock }
    }

    /// Main worker loop; claims and processes deliveries until cancelled.
    ///
    /// Claim failures never end the loop. Retryable ones back off
    /// exponentially from `store_retry_base_delay` up to `max_store_backoff`;
    /// anything else waits the full `max_store_backoff`.
    pub(crate) async fn run(self: Arc<Self>) -> Result<()> {
        info!(worker_id = %self.id, "delivery worker starting");
        let mut consecutive_failures: u32 = 0;

        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = %self.id, "delivery worker received shutdown signal");
                break;
            }

            let wait = match self.process_batch().await {
                Ok(processed) => {
                    consecutive_failures = 0;
                    (processed == 0).then_some(self.config.poll_interval)
                },
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    let backoff = self.failure_backoff(&error, consecutive_failures);
                    error!(
                        worker_id = %self.id,
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        consecutive_failures,
                        backoff_ms = backoff.as_millis(),
                        "failed to claim deliveries"
                    );
                    Some(backoff)
                },
            };

            if let Some(wait) = wait {
                tokio::select! {
                    () = self.clock.sleep(wait) => {}
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        info!(worker_id = %self.id, "delivery worker stopped");
        Ok(())
    }

    /// Claims one batch and processes it concurrently.
    ///
    /// Returns the number of deliveries claimed. A failure of one delivery is
    /// logged and never affects its siblings.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseError` if the claim itself fails.
    pub(crate) async fn process_batch(self: &Arc<Self>) -> Result<usize> {
        let request = ClaimRequest {
            worker_id: self.id.clone(),
            now: self.clock.now_utc(),
            limit: self.config.batch_size,
            lease_grace: self.config.lease_grace,
        };
        let claimed = match self.storage.claim_due(request).await {
            Ok(claimed) => claimed,
            Err(e) => {
                self.record_store_error("claim").await;
                return Err(DeliveryError::from(e));
            },
        };

        let batch_size = claimed.len();
        if batch_size == 0 {
            return Ok(0);
        }
        debug!(worker_id = %self.id, batch_size, "processing delivery batch");

        let mut tasks = JoinSet::new();
        for claimed_delivery in claimed {
            let worker = Arc::clone(self);
            tasks.spawn(async move { worker.process_delivery(claimed_delivery).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {},
                Ok(Err(error)) => {
                    error!(
                        worker_id = %self.id,
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "delivery processing failed"
                    );
                },
                Err(join_error) => {
                    error!(worker_id = %self.id, error = %join_error, "delivery task panicked");
                },
            }
        }

        Ok(batch_size)
    }

    async fn process_delivery(&self, claimed: ClaimedDelivery) -> Result<()> {
        let ClaimedDelivery { delivery, message } = claimed;
        let Some(claim_token) = delivery.claim_token else {
            return Err(DeliveryError::internal(format!(
                "claimed delivery {} carries no claim token",
                delivery.id
            )));
        };

        let span = info_span!(
            "delivery",
            worker_id = %self.id,
            delivery_id = %delivery.id,
            attempt = delivery.attempt_count + 1
        );

        async move {
            {
                let mut stats = self.stats.write().await;
                stats.in_flight_deliveries += 1;
                metrics::set_in_flight(stats.in_flight_deliveries);
            }

            let outcome = self.executor.attempt(&delivery, &message).await;
            metrics::record_attempt(outcome.success, outcome.duration);
            let attempt_count = delivery.attempt_count.saturating_add(1);
            let now = self.clock.now_utc();
            let transition = self.config.retry_policy.decide(
                attempt_count,
                delivery.max_delivery_attempts,
                delivery.delivery_attempt_delay(),
                outcome.success,
                now,
            );

            let completion = Completion {
                delivery_id: delivery.id,
                claim_token,
                attempt: outcome.into_attempt(delivery.id, attempt_count, now),
                transition,
                completed_at: now,
            };
            let result = self.complete_with_retry(&delivery, completion).await;

            let mut stats = self.stats.write().await;
            stats.in_flight_deliveries = stats.in_flight_deliveries.saturating_sub(1);
            stats.attempts_made += 1;
            metrics::set_in_flight(stats.in_flight_deliveries);
            result
        }
        .instrument(span)
        .await
    }

    /// Records the attempt, retrying transient store errors a bounded number
    /// of times. A lost claim is logged and dropped; another worker owns the
    /// delivery now.
    async fn complete_with_retry(&self, delivery: &Delivery, completion: Completion) -> Result<()> {
        let transition = completion.transition;
        let mut retries: u32 = 0;

        loop {
            match self.storage.complete_attempt(completion.clone()).await {
                Ok(updated) => {
                    self.record_transition(&transition).await;
                    debug!(
                        status = %updated.status,
                        attempt_count = updated.attempt_count,
                        "delivery attempt recorded"
                    );
                    return Ok(());
                },
                Err(CoreError::ClaimLost(reason)) => {
                    warn!(reason = %reason, "claim lost before attempt was recorded");
                    self.stats.write().await.lost_claims += 1;
                    metrics::record_lost_claim();
                    return Ok(());
                },
                Err(e) => {
                    let error = DeliveryError::from(e);
                    if error.is_retryable() && retries < self.config.max_completion_retries {
                        retries += 1;
                        let backoff = self.store_backoff(retries);
                        warn!(
                            error = %error,
                            retry = retries,
                            backoff_ms = backoff.as_millis(),
                            "failed to record attempt, retrying"
                        );
                        self.record_store_error("complete").await;
                        self.clock.sleep(backoff).await;
                        continue;
                    }

                    error!(
                        delivery_id = %delivery.id,
                        error = %error,
                        category = %ErrorCategory::from(&error),
                        "giving up on recording attempt; delivery is claimable again once its \
                         lease expires"
                    );
                    return Err(error);
                },
            }
        }
    }

    async fn record_transition(&self, transition: &DeliveryTransition) {
        metrics::record_transition(transition);
        let mut stats = self.stats.write().await;
        match transition {
            DeliveryTransition::Succeeded => stats.successful_deliveries += 1,
            DeliveryTransition::Retry { .. } => stats.retries_scheduled += 1,
            DeliveryTransition::Failed => stats.permanent_failures += 1,
        }
    }

    async fn record_store_error(&self, operation: &'static str) {
        self.stats.write().await.store_errors += 1;
        metrics::record_store_error(operation);
    }

    fn failure_backoff(&self, error: &DeliveryError, failures: u32) -> Duration {
        if error.is_retryable() {
            self.store_backoff(failures)
        } else {
            self.config.max_store_backoff
        }
    }

    fn store_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.config
            .store_retry_base_delay
            .saturating_mul(2_u32.pow(exponent))
            .min(self.config.max_store_backoff)
    }
}

#[cfg(test)]
mod tests {
    use courier_core::MemoryStorage;

    use super::*;
    use crate::client::DeliveryClient;

    fn worker(config: DeliveryConfig) -> DeliveryWorker {
        DeliveryWorker::new(
            "test-0".to_string(),
            Arc::new(MemoryStorage::new()),
            config,
            Arc::new(WebhookExecutor::new(DeliveryClient::with_defaults().unwrap())),
            Arc::new(RwLock::new(EngineStats::default())),
            CancellationToken::new(),
            Arc::new(courier_core::TestClock::new()),
        )
    }

    #[test]
    fn store_backoff_doubles_up_to_cap() {
        let config = DeliveryConfig {
            store_retry_base_delay: Duration::from_millis(100),
            max_store_backoff: Duration::from_millis(1000),
            ..DeliveryConfig::default()
        };
        let worker = worker(config);

        assert_eq!(worker.store_backoff(1), Duration::from_millis(100));
        assert_eq!(worker.store_backoff(2), Duration::from_millis(200));
        assert_eq!(worker.store_backoff(4), Duration::from_millis(800));
        assert_eq!(worker.store_backoff(5), Duration::from_millis(1000));
        assert_eq!(worker.store_backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn permanent_errors_wait_the_full_backoff() {
        let config = DeliveryConfig {
            store_retry_base_delay: Duration::from_millis(100),
            max_store_backoff: Duration::from_millis(1000),
            ..DeliveryConfig::default()
        };
        let worker = worker(config);

        let transient = DeliveryError::from(CoreError::Database("connection reset".into()));
        let permanent = DeliveryError::from(CoreError::invalid("corrupt row"));
        assert_eq!(worker.failure_backoff(&transient, 1), Duration::from_millis(100));
        assert_eq!(worker.failure_backoff(&permanent, 1), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn empty_store_yields_empty_batch() {
        let worker = Arc::new(worker(DeliveryConfig::default()));
        assert_eq!(worker.process_batch().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_worker_exits() {
        let worker = Arc::new(worker(DeliveryConfig::default()));
        worker.cancellation_token.cancel();

        let result =
            tokio::time::timeout(Duration::from_secs(1), Arc::clone(&worker).run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
