//! Repository for delivery database operations.
//!
//! Deliveries are the work queue of the dispatch scheduler. Claiming uses
//! `FOR UPDATE SKIP LOCKED` so concurrent workers never select the same row,
//! and stamps a lease so a crashed worker's claim eventually lapses.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    filter::{DeliveryFilter, ListOptions},
    models::{duration_to_millis, Delivery, DeliveryId, DeliveryTransition},
    storage::ClaimRequest,
};

/// Repository for delivery database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts the deliveries planned for a message.
    ///
    /// # Errors
    ///
    /// Returns error if any insert fails; the caller's transaction must then
    /// be rolled back.
    pub async fn create_many_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        deliveries: &[Delivery],
    ) -> Result<()> {
        for delivery in deliveries {
            sqlx::query(
                r"
                INSERT INTO deliveries (
                    id, message_id, subscription_id, url, secret_token,
                    max_delivery_attempts, delivery_attempt_delay_ms, delivery_attempt_timeout_ms,
                    status, attempt_count, next_attempt_at, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ",
            )
            .bind(delivery.id)
            .bind(delivery.message_id)
            .bind(delivery.subscription_id)
            .bind(&delivery.url)
            .bind(&delivery.secret_token)
            .bind(delivery.max_delivery_attempts)
            .bind(delivery.delivery_attempt_delay_ms)
            .bind(delivery.delivery_attempt_timeout_ms)
            .bind(delivery.status)
            .bind(delivery.attempt_count)
            .bind(delivery.next_attempt_at)
            .bind(delivery.created_at)
            .bind(delivery.updated_at)
            .execute(&mut **tx)
            .await?;
        }
        Ok(())
    }

    /// Claims due deliveries for one worker.
    ///
    /// A delivery is due when it is pending, its `next_attempt_at` has
    /// passed, and it carries no live lease. Selection and lease stamping
    /// happen in one statement; rows locked by a concurrent claim are
    /// skipped rather than waited on. Each lease lasts for the delivery's
    /// own attempt timeout plus `lease_grace`.
    ///
    /// Returned deliveries are ordered oldest `next_attempt_at` first.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn claim_due_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        request: &ClaimRequest,
        claim_token: Uuid,
    ) -> Result<Vec<Delivery>> {
        let mut deliveries = sqlx::query_as::<_, Delivery>(
            r"
            WITH due AS (
                SELECT id FROM deliveries
                WHERE status = 'pending'
                  AND next_attempt_at <= $1
                  AND (claim_expires_at IS NULL OR claim_expires_at <= $1)
                ORDER BY next_attempt_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            UPDATE deliveries AS d
            SET claimed_by = $3,
                claim_token = $4,
                claim_expires_at = $1
                    + (d.delivery_attempt_timeout_ms + $5) * INTERVAL '1 millisecond',
                updated_at = $1
            FROM due
            WHERE d.id = due.id
            RETURNING d.*
            ",
        )
        .bind(request.now)
        .bind(i64::try_from(request.limit).unwrap_or(i64::MAX))
        .bind(&request.worker_id)
        .bind(claim_token)
        .bind(duration_to_millis(request.lease_grace))
        .fetch_all(&mut **tx)
        .await?;

        deliveries.sort_by(|a, b| (a.next_attempt_at, a.id).cmp(&(b.next_attempt_at, b.id)));
        Ok(deliveries)
    }

    /// Applies a post-attempt transition if the claim is still held.
    ///
    /// Increments `attempt_count`, sets the new status and schedule, and
    /// clears the lease. Returns `None` when the claim token no longer
    /// matches or the delivery is already terminal, in which case nothing
    /// was written.
    ///
    /// # Errors
    ///
    /// Returns error if the statement fails.
    pub async fn complete_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        delivery_id: DeliveryId,
        claim_token: Uuid,
        transition: &DeliveryTransition,
        completed_at: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>(
            r"
            UPDATE deliveries SET
                status = $3,
                attempt_count = attempt_count + 1,
                next_attempt_at = COALESCE($4, next_attempt_at),
                claimed_by = NULL,
                claim_token = NULL,
                claim_expires_at = NULL,
                updated_at = $5
            WHERE id = $1
              AND claim_token = $2
              AND status = 'pending'
              AND attempt_count < max_delivery_attempts
            RETURNING *
            ",
        )
        .bind(delivery_id)
        .bind(claim_token)
        .bind(transition.status())
        .bind(transition.next_attempt_at())
        .bind(completed_at)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(delivery)
    }

    /// Finds a delivery by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryId) -> Result<Option<Delivery>> {
        let delivery = sqlx::query_as::<_, Delivery>("SELECT * FROM deliveries WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(delivery)
    }

    /// Lists deliveries matching all filters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, options: &ListOptions<DeliveryFilter>) -> Result<Vec<Delivery>> {
        let mut query = options.select_query::<Delivery>("deliveries");
        let deliveries = query.build_query_as::<Delivery>().fetch_all(&*self.pool).await?;
        Ok(deliveries)
    }
}
