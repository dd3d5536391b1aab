//! Webhook dispatch for the courier broker.
//!
//! Workers claim due deliveries from a `BrokerStorage` with a lease, attempt
//! each one over HTTP, and record the attempt together with the state change
//! decided by the retry policy.
//!
//! # Architecture
//!
//! 1. **Claim** - a worker leases a batch of due deliveries; no other worker
//!    sees them until the lease lapses or the outcome is recorded
//! 2. **Attempt** - the executor signs a JSON envelope and POSTs it within
//!    the delivery's timeout
//! 3. **Decide** - the retry policy turns the outcome into success, failure
//!    or a rescheduled attempt
//! 4. **Complete** - attempt row and transition commit together, guarded by
//!    the claim token
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use courier_core::{MemoryStorage, RealClock};
//! use courier_delivery::{DeliveryConfig, DeliveryEngine, DeliveryError};
//!
//! # async fn example() -> Result<(), DeliveryError> {
//! let storage = Arc::new(MemoryStorage::new());
//! let mut engine =
//!     DeliveryEngine::new(storage, DeliveryConfig::default(), Arc::new(RealClock::new()))?;
//!
//! engine.start().await?;
//! engine.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod engine;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod retry;
pub mod signing;
mod worker;
mod worker_pool;

pub use client::{ClientConfig, DeliveryClient};
pub use engine::{DeliveryConfig, DeliveryEngine, EngineStats};
pub use error::{DeliveryError, ErrorCategory, Result};
pub use executor::{AttemptOutcome, WebhookExecutor};
pub use retry::{BackoffStrategy, RetryPolicy};

/// Default number of concurrent delivery workers.
pub const DEFAULT_WORKER_COUNT: usize = 3;

/// Default number of deliveries claimed per batch.
pub const DEFAULT_BATCH_SIZE: usize = 10;

/// Default number of local retries when recording an attempt hits a
/// transient store error.
pub const DEFAULT_COMPLETION_RETRIES: u32 = 3;
