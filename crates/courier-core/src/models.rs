//! Core domain models and strongly-typed identifiers.
//!
//! Defines topics, subscriptions, messages, deliveries and delivery attempts,
//! together with newtype ID wrappers for compile-time type safety and the
//! database encoding of the delivery status.

use std::{fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

uuid_id! {
    /// Strongly-typed topic identifier.
    ///
    /// Caller-supplied or generated; immutable once the topic exists.
    TopicId
}

uuid_id! {
    /// Strongly-typed subscription identifier.
    SubscriptionId
}

uuid_id! {
    /// Strongly-typed message identifier.
    MessageId
}

uuid_id! {
    /// Strongly-typed delivery identifier.
    ///
    /// Stable across retries and sent to receivers, who use it to
    /// deduplicate at-least-once deliveries.
    DeliveryId
}

uuid_id! {
    /// Strongly-typed delivery attempt identifier.
    DeliveryAttemptId
}

fn millis(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

/// Converts a duration to whole milliseconds for storage.
pub fn duration_to_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Longest retry delay or attempt timeout a subscription may carry.
pub const MAX_POLICY_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// A named channel that messages are published to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Topic {
    /// Unique identifier for this topic.
    pub id: TopicId,
    /// Human-readable name.
    pub name: String,
    /// When this topic was created.
    pub created_at: DateTime<Utc>,
    /// When this topic was last updated.
    pub updated_at: DateTime<Utc>,
}

/// A webhook endpoint bound to a topic, with its own retry policy.
///
/// The secret token signs outbound requests and is never serialized or
/// printed.
#[derive(Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Subscription {
    /// Unique identifier for this subscription.
    pub id: SubscriptionId,
    /// Topic this subscription listens to.
    pub topic_id: TopicId,
    /// Human-readable name.
    pub name: String,
    /// Destination URL for webhook requests.
    pub url: String,
    /// Key for the request signature.
    #[serde(skip_serializing)]
    pub secret_token: String,
    /// Maximum number of delivery attempts, at least one.
    pub max_delivery_attempts: i32,
    /// Base retry interval in milliseconds.
    pub delivery_attempt_delay_ms: i64,
    /// Per-attempt wall-clock budget in milliseconds.
    pub delivery_attempt_timeout_ms: i64,
    /// When this subscription was created.
    pub created_at: DateTime<Utc>,
    /// When this subscription was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Base retry interval.
    pub fn delivery_attempt_delay(&self) -> Duration {
        millis(self.delivery_attempt_delay_ms)
    }

    /// Per-attempt timeout.
    pub fn delivery_attempt_timeout(&self) -> Duration {
        millis(self.delivery_attempt_timeout_ms)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("topic_id", &self.topic_id)
            .field("name", &self.name)
            .field("url", &self.url)
            .field("secret_token", &"[redacted]")
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("delivery_attempt_delay_ms", &self.delivery_attempt_delay_ms)
            .field("delivery_attempt_timeout_ms", &self.delivery_attempt_timeout_ms)
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// An immutable payload published once to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    /// Unique identifier for this message.
    pub id: MessageId,
    /// Topic the message was published to.
    pub topic_id: TopicId,
    /// MIME type of the payload.
    pub content_type: String,
    /// Opaque payload bytes.
    pub payload: Vec<u8>,
    /// When this message was published.
    pub created_at: DateTime<Utc>,
    /// Equal to `created_at`; messages are never updated.
    pub updated_at: DateTime<Utc>,
}

/// Delivery lifecycle status.
///
/// `Success` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Waiting for an attempt; due once `next_attempt_at` has passed.
    Pending,
    /// An attempt was acknowledged with a 2xx response.
    Success,
    /// All attempts were used without a successful response.
    Failed,
}

impl DeliveryStatus {
    /// Database and wire representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    /// Returns true for `Success` and `Failed`.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("invalid delivery status: {s}")),
        }
    }
}

impl sqlx::Type<PgDb> for DeliveryStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for DeliveryStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        s.parse().map_err(Into::into)
    }
}

impl sqlx::Encode<'_, PgDb> for DeliveryStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// The obligation to deliver one message to one subscription.
///
/// Policy fields are copied from the subscription at fan-out time, so later
/// subscription edits never reshape attempts already scheduled.
#[derive(Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct Delivery {
    /// Unique identifier, stable across retries.
    pub id: DeliveryId,
    /// Message being delivered.
    pub message_id: MessageId,
    /// Subscription the message is delivered to.
    pub subscription_id: SubscriptionId,
    /// Destination URL captured at fan-out.
    pub url: String,
    /// Signing key captured at fan-out.
    #[serde(skip_serializing)]
    pub secret_token: String,
    /// Attempt budget captured at fan-out.
    pub max_delivery_attempts: i32,
    /// Base retry interval in milliseconds captured at fan-out.
    pub delivery_attempt_delay_ms: i64,
    /// Per-attempt timeout in milliseconds captured at fan-out.
    pub delivery_attempt_timeout_ms: i64,
    /// Current lifecycle status.
    pub status: DeliveryStatus,
    /// Number of recorded attempts.
    pub attempt_count: i32,
    /// When the delivery becomes due.
    pub next_attempt_at: DateTime<Utc>,
    /// Worker currently holding the claim.
    pub claimed_by: Option<String>,
    /// Nonce identifying the current claim.
    pub claim_token: Option<Uuid>,
    /// When the current claim lease expires.
    pub claim_expires_at: Option<DateTime<Utc>>,
    /// When this delivery was created.
    pub created_at: DateTime<Utc>,
    /// When this delivery was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Delivery {
    /// Creates a pending delivery for a message and subscription.
    pub fn for_subscription(
        message: &Message,
        subscription: &Subscription,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            message_id: message.id,
            subscription_id: subscription.id,
            url: subscription.url.clone(),
            secret_token: subscription.secret_token.clone(),
            max_delivery_attempts: subscription.max_delivery_attempts,
            delivery_attempt_delay_ms: subscription.delivery_attempt_delay_ms,
            delivery_attempt_timeout_ms: subscription.delivery_attempt_timeout_ms,
            status: DeliveryStatus::Pending,
            attempt_count: 0,
            next_attempt_at: now,
            claimed_by: None,
            claim_token: None,
            claim_expires_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Base retry interval.
    pub fn delivery_attempt_delay(&self) -> Duration {
        millis(self.delivery_attempt_delay_ms)
    }

    /// Per-attempt timeout.
    pub fn delivery_attempt_timeout(&self) -> Duration {
        millis(self.delivery_attempt_timeout_ms)
    }

    /// Returns true once the delivery reached `Success` or `Failed`.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns true if a worker may claim this delivery at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending
            && self.next_attempt_at <= now
            && self.claim_expires_at.is_none_or(|expires| expires <= now)
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("id", &self.id)
            .field("message_id", &self.message_id)
            .field("subscription_id", &self.subscription_id)
            .field("url", &self.url)
            .field("secret_token", &"[redacted]")
            .field("max_delivery_attempts", &self.max_delivery_attempts)
            .field("delivery_attempt_delay_ms", &self.delivery_attempt_delay_ms)
            .field("delivery_attempt_timeout_ms", &self.delivery_attempt_timeout_ms)
            .field("status", &self.status)
            .field("attempt_count", &self.attempt_count)
            .field("next_attempt_at", &self.next_attempt_at)
            .field("claimed_by", &self.claimed_by)
            .field("claim_expires_at", &self.claim_expires_at)
            .finish_non_exhaustive()
    }
}

/// Immutable record of one execution of a delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeliveryAttempt {
    /// Unique identifier for this attempt.
    pub id: DeliveryAttemptId,
    /// Delivery this attempt belongs to.
    pub delivery_id: DeliveryId,
    /// 1-based position in the delivery's attempt history.
    pub attempt_number: i32,
    /// Request line, headers and body as sent.
    pub request: String,
    /// Status line, headers and body as received; empty on transport failure.
    pub response: String,
    /// HTTP status code; absent on transport failure.
    pub response_status_code: Option<i32>,
    /// Measured wall-clock time of the attempt in milliseconds.
    pub execution_duration_ms: i64,
    /// Whether the endpoint acknowledged with a 2xx response.
    pub success: bool,
    /// Transport failure description; absent when a response was received.
    pub error: Option<String>,
    /// When the attempt was recorded.
    pub created_at: DateTime<Utc>,
}

impl DeliveryAttempt {
    /// Measured wall-clock time of the attempt.
    pub fn execution_duration(&self) -> Duration {
        millis(self.execution_duration_ms)
    }
}

/// State change applied to a delivery after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryTransition {
    /// The attempt succeeded; the delivery is finished.
    Succeeded,
    /// The attempt budget is exhausted; the delivery is finished.
    Failed,
    /// The delivery stays pending until `next_attempt_at`.
    Retry {
        /// When the delivery becomes due again.
        next_attempt_at: DateTime<Utc>,
    },
}

impl DeliveryTransition {
    /// Status the delivery holds after this transition.
    pub const fn status(&self) -> DeliveryStatus {
        match self {
            Self::Succeeded => DeliveryStatus::Success,
            Self::Failed => DeliveryStatus::Failed,
            Self::Retry { .. } => DeliveryStatus::Pending,
        }
    }

    /// New `next_attempt_at`, if the transition reschedules the delivery.
    pub const fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { next_attempt_at } => Some(*next_attempt_at),
            Self::Succeeded | Self::Failed => None,
        }
    }
}

/// A delivery claimed by a worker, together with the message to send.
#[derive(Debug, Clone)]
pub struct ClaimedDelivery {
    /// The claimed delivery, carrying the claim lease.
    pub delivery: Delivery,
    /// The message referenced by the delivery.
    pub message: Message,
}

impl ClaimedDelivery {
    /// Nonce that must be presented to record the attempt outcome.
    pub fn claim_token(&self) -> Option<Uuid> {
        self.delivery.claim_token
    }
}
