//! Repository for delivery attempt database operations.
//!
//! Attempts are an append-only audit trail. Each row captures the request as
//! sent and the response as received, so a delivery's history can be
//! reconstructed and debugged after the fact.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::Result,
    filter::{DeliveryAttemptFilter, ListOptions},
    models::{DeliveryAttempt, DeliveryAttemptId},
};

/// Repository for delivery attempt database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Records an attempt within the transaction that applies its outcome.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails, including a duplicate
    /// `(delivery_id, attempt_number)`.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        attempt: &DeliveryAttempt,
    ) -> Result<DeliveryAttempt> {
        let attempt = sqlx::query_as::<_, DeliveryAttempt>(
            r"
            INSERT INTO delivery_attempts (
                id, delivery_id, attempt_number, request, response, response_status_code,
                execution_duration_ms, success, error, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            ",
        )
        .bind(attempt.id)
        .bind(attempt.delivery_id)
        .bind(attempt.attempt_number)
        .bind(&attempt.request)
        .bind(&attempt.response)
        .bind(attempt.response_status_code)
        .bind(attempt.execution_duration_ms)
        .bind(attempt.success)
        .bind(&attempt.error)
        .bind(attempt.created_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(attempt)
    }

    /// Finds an attempt by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: DeliveryAttemptId) -> Result<Option<DeliveryAttempt>> {
        let attempt =
            sqlx::query_as::<_, DeliveryAttempt>("SELECT * FROM delivery_attempts WHERE id = $1")
                .bind(id)
                .fetch_optional(&*self.pool)
                .await?;
        Ok(attempt)
    }

    /// Lists attempts matching all filters.
    ///
    /// Filtering by delivery id yields the delivery's history in order.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(
        &self,
        options: &ListOptions<DeliveryAttemptFilter>,
    ) -> Result<Vec<DeliveryAttempt>> {
        let mut query = options.select_query::<DeliveryAttempt>("delivery_attempts");
        let attempts = query.build_query_as::<DeliveryAttempt>().fetch_all(&*self.pool).await?;
        Ok(attempts)
    }
}
