//! Worker pool management with structured concurrency.
//!
//! Spawns the configured number of workers under one cancellation token and
//! joins them on shutdown.

use std::{sync::Arc, time::Duration};

use courier_core::{BrokerStorage, Clock};
use tokio::{sync::RwLock, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::{
    engine::{DeliveryConfig, EngineStats},
    error::{DeliveryError, Result},
    executor::WebhookExecutor,
    metrics,
    worker::DeliveryWorker,
};

/// Supervises the delivery workers of one engine instance.
pub(crate) struct WorkerPool {
    instance_id: Uuid,
    storage: Arc<dyn BrokerStorage>,
    config: DeliveryConfig,
    executor: Arc<WebhookExecutor>,
    stats: Arc<RwLock<EngineStats>>,
    cancellation_token: CancellationToken,
    worker_handles: Vec<(String, JoinHandle<Result<()>>)>,
    clock: Arc<dyn Clock>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        instance_id: Uuid,
        storage: Arc<dyn BrokerStorage>,
        config: DeliveryConfig,
        executor: Arc<WebhookExecutor>,
        stats: Arc<RwLock<EngineStats>>,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            instance_id,
            storage,
            config,
            executor,
            stats,
            cancellation_token,
            worker_handles: Vec::new(),
            clock,
        }
    }

    /// Worker identifier; unique across processes sharing a database.
    pub(crate) fn worker_id(instance_id: Uuid, index: usize) -> String {
        format!("{instance_id}-{index}")
    }

    /// Identifier for batches run outside the pool via `process_batch`.
    pub(crate) fn manual_worker_id(instance_id: Uuid) -> String {
        format!("{instance_id}-manual")
    }

    /// Spawns all configured workers. Returns once they are running.
    pub(crate) async fn spawn_workers(&mut self) {
        info!(worker_count = self.config.worker_count, "spawning delivery workers");

        self.stats.write().await.active_workers = self.config.worker_count;
        metrics::set_active_workers(self.config.worker_count);

        for index in 0..self.config.worker_count {
            let worker_id = Self::worker_id(self.instance_id, index);
            let worker = Arc::new(DeliveryWorker::new(
                worker_id.clone(),
                self.storage.clone(),
                self.config.clone(),
                self.executor.clone(),
                self.stats.clone(),
                self.cancellation_token.clone(),
                self.clock.clone(),
            ));

            let span_id = worker_id.clone();
            let handle = tokio::spawn(async move {
                let result = worker.run().await;

                if let Err(ref error) = result {
                    error!(
                        worker_id = %span_id,
                        error = %error,
                        "delivery worker terminated with error"
                    );
                } else {
                    info!(worker_id = %span_id, "delivery worker stopped gracefully");
                }

                result
            });

            self.worker_handles.push((worker_id, handle));
        }

        info!(spawned_workers = self.worker_handles.len(), "all delivery workers spawned");
    }

    /// Cancels all workers and waits for in-flight deliveries to finish.
    ///
    /// # Errors
    ///
    /// Returns `ShutdownTimeout` if the workers do not stop within
    /// `timeout`, and `WorkerPanic` for the first worker that panicked.
    pub(crate) async fn shutdown_graceful(mut self, timeout: Duration) -> Result<()> {
        info!(
            worker_count = self.worker_handles.len(),
            timeout_ms = timeout.as_millis(),
            "initiating graceful worker shutdown"
        );

        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut self.worker_handles);
        let stats = self.stats.clone();
        let shutdown_future = async move {
            let mut first_panic = None;

            for (worker_id, handle) in handles {
                match handle.await {
                    Ok(Ok(())) => {},
                    Ok(Err(error)) => {
                        warn!(
                            worker_id = %worker_id,
                            error = %error,
                            "worker completed with error during shutdown"
                        );
                    },
                    Err(join_error) => {
                        error!(worker_id = %worker_id, error = %join_error, "worker task panicked");
                        first_panic.get_or_insert(DeliveryError::WorkerPanic {
                            worker_id,
                            error: join_error.to_string(),
                        });
                    },
                }
            }

            stats.write().await.active_workers = 0;
            metrics::set_active_workers(0);
            first_panic
        };

        match tokio::time::timeout(timeout, shutdown_future).await {
            Ok(None) => {
                info!("worker pool shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                error!(
                    timeout_ms = timeout.as_millis(),
                    "worker shutdown timed out, some workers may still be running"
                );
                Err(DeliveryError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Returns `true` while any worker task is still running.
    pub(crate) fn has_active_workers(&self) -> bool {
        self.worker_handles.iter().any(|(_, handle)| !handle.is_finished())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active_count =
            self.worker_handles.iter().filter(|(_, handle)| !handle.is_finished()).count();

        if active_count > 0 && !self.cancellation_token.is_cancelled() {
            warn!(
                active_workers = active_count,
                "worker pool dropped without shutdown, cancelling workers"
            );
            self.cancellation_token.cancel();
        }
    }
}
