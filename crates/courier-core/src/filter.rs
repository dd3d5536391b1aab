//! Closed filter predicates and pagination for read paths.
//!
//! Each entity has a fixed set of supported predicates. A predicate renders
//! itself into a `QueryBuilder` with bound parameters for PostgreSQL and can
//! evaluate itself against an in-memory value, so both storage backends
//! answer list queries identically.

use chrono::{DateTime, Utc};
use sqlx::{Postgres, QueryBuilder};

use crate::models::{
    Delivery, DeliveryAttempt, DeliveryId, DeliveryStatus, Message, MessageId, Subscription,
    SubscriptionId, Topic, TopicId,
};

/// Default page size when the caller does not set one.
pub const DEFAULT_LIMIT: i64 = 50;

/// Largest page size a caller can request.
pub const MAX_LIMIT: i64 = 100;

/// Ordering comparison for timestamp predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// Strictly greater than.
    Gt,
    /// Greater than or equal.
    Gte,
    /// Strictly less than.
    Lt,
    /// Less than or equal.
    Lte,
}

impl Comparison {
    const fn sql_operator(self) -> &'static str {
        match self {
            Self::Gt => " > ",
            Self::Gte => " >= ",
            Self::Lt => " < ",
            Self::Lte => " <= ",
        }
    }

    /// Evaluates `left <op> right`.
    pub fn holds<T: PartialOrd>(self, left: &T, right: &T) -> bool {
        match self {
            Self::Gt => left > right,
            Self::Gte => left >= right,
            Self::Lt => left < right,
            Self::Lte => left <= right,
        }
    }
}

/// A predicate over rows of type `T`.
pub trait Filter<T> {
    /// Appends this predicate, without a leading `WHERE`/`AND`, to `query`.
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>);

    /// Evaluates the predicate against an in-memory value.
    fn matches(&self, item: &T) -> bool;
}

fn push_created_at(
    query: &mut QueryBuilder<'_, Postgres>,
    comparison: Comparison,
    value: DateTime<Utc>,
) {
    query.push("created_at").push(comparison.sql_operator()).push_bind(value);
}

/// Predicates supported when listing topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicFilter {
    /// Exact name match.
    Name(String),
    /// Creation time comparison.
    CreatedAt(Comparison, DateTime<Utc>),
}

impl Filter<Topic> for TopicFilter {
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::Name(name) => {
                query.push("name = ").push_bind(name.clone());
            },
            Self::CreatedAt(cmp, at) => push_created_at(query, *cmp, *at),
        }
    }

    fn matches(&self, topic: &Topic) -> bool {
        match self {
            Self::Name(name) => &topic.name == name,
            Self::CreatedAt(cmp, at) => cmp.holds(&topic.created_at, at),
        }
    }
}

/// Predicates supported when listing subscriptions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionFilter {
    /// Subscriptions bound to a topic.
    TopicId(TopicId),
    /// Exact name match.
    Name(String),
    /// Creation time comparison.
    CreatedAt(Comparison, DateTime<Utc>),
}

impl Filter<Subscription> for SubscriptionFilter {
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::TopicId(id) => {
                query.push("topic_id = ").push_bind(*id);
            },
            Self::Name(name) => {
                query.push("name = ").push_bind(name.clone());
            },
            Self::CreatedAt(cmp, at) => push_created_at(query, *cmp, *at),
        }
    }

    fn matches(&self, subscription: &Subscription) -> bool {
        match self {
            Self::TopicId(id) => subscription.topic_id == *id,
            Self::Name(name) => &subscription.name == name,
            Self::CreatedAt(cmp, at) => cmp.holds(&subscription.created_at, at),
        }
    }
}

/// Predicates supported when listing messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    /// Messages published to a topic.
    TopicId(TopicId),
    /// Creation time comparison.
    CreatedAt(Comparison, DateTime<Utc>),
}

impl Filter<Message> for MessageFilter {
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::TopicId(id) => {
                query.push("topic_id = ").push_bind(*id);
            },
            Self::CreatedAt(cmp, at) => push_created_at(query, *cmp, *at),
        }
    }

    fn matches(&self, message: &Message) -> bool {
        match self {
            Self::TopicId(id) => message.topic_id == *id,
            Self::CreatedAt(cmp, at) => cmp.holds(&message.created_at, at),
        }
    }
}

/// Predicates supported when listing deliveries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryFilter {
    /// Deliveries of a message.
    MessageId(MessageId),
    /// Deliveries to a subscription.
    SubscriptionId(SubscriptionId),
    /// Deliveries in a status.
    Status(DeliveryStatus),
    /// Creation time comparison.
    CreatedAt(Comparison, DateTime<Utc>),
}

impl Filter<Delivery> for DeliveryFilter {
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::MessageId(id) => {
                query.push("message_id = ").push_bind(*id);
            },
            Self::SubscriptionId(id) => {
                query.push("subscription_id = ").push_bind(*id);
            },
            Self::Status(status) => {
                query.push("status = ").push_bind(*status);
            },
            Self::CreatedAt(cmp, at) => push_created_at(query, *cmp, *at),
        }
    }

    fn matches(&self, delivery: &Delivery) -> bool {
        match self {
            Self::MessageId(id) => delivery.message_id == *id,
            Self::SubscriptionId(id) => delivery.subscription_id == *id,
            Self::Status(status) => delivery.status == *status,
            Self::CreatedAt(cmp, at) => cmp.holds(&delivery.created_at, at),
        }
    }
}

/// Predicates supported when listing delivery attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryAttemptFilter {
    /// Attempts of a delivery.
    DeliveryId(DeliveryId),
    /// Attempts with the given outcome.
    Success(bool),
    /// Creation time comparison.
    CreatedAt(Comparison, DateTime<Utc>),
}

impl Filter<DeliveryAttempt> for DeliveryAttemptFilter {
    fn push_sql(&self, query: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Self::DeliveryId(id) => {
                query.push("delivery_id = ").push_bind(*id);
            },
            Self::Success(success) => {
                query.push("success = ").push_bind(*success);
            },
            Self::CreatedAt(cmp, at) => push_created_at(query, *cmp, *at),
        }
    }

    fn matches(&self, attempt: &DeliveryAttempt) -> bool {
        match self {
            Self::DeliveryId(id) => attempt.delivery_id == *id,
            Self::Success(success) => attempt.success == *success,
            Self::CreatedAt(cmp, at) => cmp.holds(&attempt.created_at, at),
        }
    }
}

/// Filter set plus a limit/offset window.
///
/// All filters must hold (conjunction). Results are ordered by
/// `(created_at, id)` ascending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListOptions<F> {
    /// Predicates that must all hold.
    pub filters: Vec<F>,
    /// Requested page size; clamped to `1..=MAX_LIMIT`.
    pub limit: i64,
    /// Number of rows to skip; negative values count as zero.
    pub offset: i64,
}

impl<F> Default for ListOptions<F> {
    fn default() -> Self {
        Self { filters: Vec::new(), limit: DEFAULT_LIMIT, offset: 0 }
    }
}

impl<F> ListOptions<F> {
    /// Creates options with no filters and the default window.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a predicate.
    #[must_use]
    pub fn filter(mut self, filter: F) -> Self {
        self.filters.push(filter);
        self
    }

    /// Sets the page size.
    #[must_use]
    pub fn limit(mut self, limit: i64) -> Self {
        self.limit = limit;
        self
    }

    /// Sets the number of rows to skip.
    #[must_use]
    pub fn offset(mut self, offset: i64) -> Self {
        self.offset = offset;
        self
    }

    /// Page size after clamping.
    pub fn effective_limit(&self) -> i64 {
        self.limit.clamp(1, MAX_LIMIT)
    }

    /// Offset after clamping.
    pub fn effective_offset(&self) -> i64 {
        self.offset.max(0)
    }

    /// Builds the full `SELECT` for `table`, including ordering and window.
    pub(crate) fn select_query<T>(&self, table: &str) -> QueryBuilder<'static, Postgres>
    where
        F: Filter<T>,
    {
        let mut query = QueryBuilder::new(format!("SELECT * FROM {table}"));
        for (index, filter) in self.filters.iter().enumerate() {
            query.push(if index == 0 { " WHERE " } else { " AND " });
            filter.push_sql(&mut query);
        }
        query.push(" ORDER BY created_at ASC, id ASC LIMIT ");
        query.push_bind(self.effective_limit());
        query.push(" OFFSET ");
        query.push_bind(self.effective_offset());
        query
    }

    /// Applies the filters and window to an in-memory collection.
    pub fn apply<'a, T, I, K>(&self, items: I, sort_key: impl Fn(&T) -> K) -> Vec<T>
    where
        F: Filter<T>,
        T: Clone + 'a,
        I: IntoIterator<Item = &'a T>,
        K: Ord,
    {
        let mut matching: Vec<T> = items
            .into_iter()
            .filter(|item| self.filters.iter().all(|f| f.matches(item)))
            .cloned()
            .collect();
        matching.sort_by_key(|item| sort_key(item));

        let offset = usize::try_from(self.effective_offset()).unwrap_or(usize::MAX);
        let limit = usize::try_from(self.effective_limit()).unwrap_or(usize::MAX);
        matching.into_iter().skip(offset).take(limit).collect()
    }
}
