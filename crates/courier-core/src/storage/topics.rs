//! Repository for topic database operations.

use std::sync::Arc;

use sqlx::{PgPool, Postgres, Transaction};

use crate::{
    error::{CoreError, Result},
    filter::{ListOptions, TopicFilter},
    models::{Topic, TopicId},
};

/// Repository for topic database operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Inserts a new topic.
    ///
    /// # Errors
    ///
    /// Returns `AlreadyExists` if a topic with the same id exists.
    pub async fn create(&self, topic: &Topic) -> Result<Topic> {
        sqlx::query_as::<_, Topic>(
            r"
            INSERT INTO topics (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            RETURNING *
            ",
        )
        .bind(topic.id)
        .bind(&topic.name)
        .bind(topic.created_at)
        .bind(topic.updated_at)
        .fetch_one(&*self.pool)
        .await
        .map_err(|err| match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                CoreError::already_exists("topic", topic.id)
            },
            other => other.into(),
        })
    }

    /// Updates the name of an existing topic.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no topic has this id.
    pub async fn update(&self, topic: &Topic) -> Result<Topic> {
        sqlx::query_as::<_, Topic>(
            r"
            UPDATE topics SET name = $2, updated_at = $3
            WHERE id = $1
            RETURNING *
            ",
        )
        .bind(topic.id)
        .bind(&topic.name)
        .bind(topic.updated_at)
        .fetch_optional(&*self.pool)
        .await?
        .ok_or_else(|| CoreError::not_found("topic", topic.id))
    }

    /// Deletes a topic and, by cascade, its subscriptions.
    ///
    /// Messages and deliveries published to the topic are kept.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no topic has this id.
    pub async fn delete(&self, id: TopicId) -> Result<()> {
        let result =
            sqlx::query("DELETE FROM topics WHERE id = $1").bind(id).execute(&*self.pool).await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::not_found("topic", id));
        }
        Ok(())
    }

    /// Finds a topic by id.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: TopicId) -> Result<Option<Topic>> {
        let topic = sqlx::query_as::<_, Topic>("SELECT * FROM topics WHERE id = $1")
            .bind(id)
            .fetch_optional(&*self.pool)
            .await?;
        Ok(topic)
    }

    /// Locks a topic row against deletion for the rest of the transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no topic has this id.
    pub async fn lock_for_share_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        id: TopicId,
    ) -> Result<()> {
        let found: Option<TopicId> =
            sqlx::query_scalar("SELECT id FROM topics WHERE id = $1 FOR SHARE")
                .bind(id)
                .fetch_optional(&mut **tx)
                .await?;

        found.map(|_| ()).ok_or_else(|| CoreError::not_found("topic", id))
    }

    /// Lists topics matching all filters.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn list(&self, options: &ListOptions<TopicFilter>) -> Result<Vec<Topic>> {
        let mut query = options.select_query::<Topic>("topics");
        let topics = query.build_query_as::<Topic>().fetch_all(&*self.pool).await?;
        Ok(topics)
    }
}
