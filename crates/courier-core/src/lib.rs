//! Core domain models, storage and fan-out for the courier webhook broker.
//!
//! Provides strongly-typed identifiers and entities (topics, subscriptions,
//! messages, deliveries and their attempts), the error taxonomy, the clock
//! abstraction, closed filter predicates for read paths, and the storage
//! layer that the broker facade and the delivery engine build on.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod models;
pub mod storage;
pub mod time;

pub use broker::{Broker, SubscriptionParams, TopicParams};
pub use error::{CoreError, Result};
pub use filter::{
    Comparison, DeliveryAttemptFilter, DeliveryFilter, ListOptions, MessageFilter,
    SubscriptionFilter, TopicFilter,
};
pub use models::{
    ClaimedDelivery, Delivery, DeliveryAttempt, DeliveryAttemptId, DeliveryId, DeliveryStatus,
    DeliveryTransition, Message, MessageId, Subscription, SubscriptionId, Topic, TopicId,
    MAX_POLICY_DURATION,
};
pub use storage::{BrokerStorage, ClaimRequest, Completion, FanOut, MemoryStorage, Storage};
pub use time::{Clock, RealClock, TestClock};
