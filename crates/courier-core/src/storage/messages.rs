//! Repository for message database operations.
//!
//! Messages are written once by fan-out and never updated. There is no
//! foreign key to `topics`, so published messages survive topic deletion.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::Result,
    filter::{ListOptions, MessageFilter},
    models::{Message, MessageId},
};

/// Repository for message database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a message within the publishing transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &Message,
    ) -> Result<Message> {
        let message = sqlx::query_as::<_, Message>(
            r"
            INSERT INTO messages (id, topic_id, content_type, payload, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            ",
        )
        .bind(message.id)
        .bind(message.topic_id)
        .bind(&message.content_type)
        .bind(&message.payload)
        .bind(message.created_at)
        .bind(message.updated_at)
        .fetch_one(&mut **tx)
        .await?;
        Ok(message)
    }

    /// Finds a message by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: MessageId) -> Result<Option<Message>> {
        let message = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(message)
    }

    /// Loads the messages referenced by a batch of claimed deliveries.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_ids_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ids: &[MessageId],
    ) -> Result<Vec<Message>> {
        let ids: Vec<Uuid> = ids.iter().map(|id| id.0).collect();
        let messages = sqlx::query_as::<_, Message>("SELECT * FROM messages WHERE id = ANY($1)")
            .bind(&ids)
            .fetch_all(&mut **tx)
            .await?;
        Ok(messages)
    }

    /// Lists messages matching all filters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, options: &ListOptions<MessageFilter>) -> Result<Vec<Message>> {
        let mut query = options.select_query::<Message>("messages");
        let messages = query.build_query_as::<Message>().fetch_all(&*self.pool).await?;
        Ok(messages)
    }
}
