//! Repository for subscription database operations.
//!
//! The foreign key from `subscriptions.topic_id` to `topics` is what
//! guarantees a subscription can never be created for a missing topic;
//! violations surface as `NotFound` for the topic.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    filter::{ListOptions, SubscriptionFilter},
    models::{Subscription, SubscriptionId, TopicId},
};

/// Repository for subscription database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new subscription.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` for a duplicate id and `NotFound` if the
    /// topic does not exist.
    pub async fn create(&self, subscription: &Subscription) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r"
            INSERT INTO subscriptions (
                id, topic_id, name, url, secret_token, max_delivery_attempts,
                delivery_attempt_delay_ms, delivery_attempt_timeout_ms, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            ",
        )
        .bind(subscription.id)
        .bind(subscription.topic_id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(&subscription.secret_token)
        .bind(subscription.max_delivery_attempts)
        .bind(subscription.delivery_attempt_delay_ms)
        .bind(subscription.delivery_attempt_timeout_ms)
        .bind(subscription.created_at)
        .bind(subscription.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|err| map_write_error(err, subscription))
    }

    /// Updates every mutable field of an existing subscription.
    ///
    /// Deliveries already fanned out keep the policy captured at their
    /// creation.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the subscription, or a newly referenced topic,
    /// does not exist.
    pub async fn update(&self, subscription: &Subscription) -> Result<Subscription> {
        sqlx::query_as::<_, Subscription>(
            r"
            UPDATE subscriptions SET
                topic_id = $2, name = $3, url = $4, secret_token = $5,
                max_delivery_attempts = $6, delivery_attempt_delay_ms = $7,
                delivery_attempt_timeout_ms = $8, updated_at = $9
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(subscription.id)
        .bind(subscription.topic_id)
        .bind(&subscription.name)
        .bind(&subscription.url)
        .bind(&subscription.secret_token)
        .bind(subscription.max_delivery_attempts)
        .bind(subscription.delivery_attempt_delay_ms)
        .bind(subscription.delivery_attempt_timeout_ms)
        .bind(subscription.updated_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|err| map_write_error(err, subscription))?
        .ok_or_else(|| CoreError::not_found("subscription", subscription.id))
    }

    /// Deletes a subscription; its historical deliveries are kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no subscription has this id.
    pub async fn delete(&self, id: SubscriptionId) -> Result<()> {
        let result = sqlx::query("DELETE FROM subscriptions WHERE id = $1")
            .bind(id)
            .execute(&*self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("subscription", id));
        }
        Ok(())
    }

    /// Finds a subscription by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: SubscriptionId) -> Result<Option<Subscription>> {
        let subscription =
            sqlx::query_as::<_, Subscription>("SELECT * FROM subscriptions WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
        Ok(subscription)
    }

    /// Finds all subscriptions of a topic within a transaction, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_topic_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        topic_id: TopicId,
    ) -> Result<Vec<Subscription>> {
        let subscriptions = sqlx::query_as::<_, Subscription>(
            "SELECT * FROM subscriptions WHERE topic_id = $1 ORDER BY created_at ASC, id ASC",
        )
        .bind(topic_id)
        .fetch_all(&mut **tx)
        .await?;
        Ok(subscriptions)
    }

    /// Lists subscriptions matching all filters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(
        &self,
        options: &ListOptions<SubscriptionFilter>,
    ) -> Result<Vec<Subscription>> {
        let mut query = options.select_query::<Subscription>("subscriptions");
        let subscriptions = query.build_query_as::<Subscription>().fetch_all(&*self.pool).await?;
        Ok(subscriptions)
    }
}

fn map_write_error(err: sqlx::Error, subscription: &Subscription) -> CoreError {
    match err {
        sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
            CoreError::already_exists("subscription", subscription.id)
        },
        sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
            CoreError::not_found("topic", subscription.topic_id)
        },
        other => other.into(),
    }
}
