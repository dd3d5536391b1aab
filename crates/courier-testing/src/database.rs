//! Database testing utilities.
//!
//! Provides isolated PostgreSQL databases for tests. The server is taken
//! from `DATABASE_URL`; every [`TestDatabase`] creates its own uniquely
//! named database on it and applies the broker schema.
//!
//! Tests using this module are `#[ignore]`d by default and run with
//! `cargo test -- --ignored` against a live server.

use std::{str::FromStr, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use courier_core::{storage::schema, Storage};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use uuid::Uuid;

/// Environment variable naming the PostgreSQL server used by tests.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// An isolated, migrated test database.
pub struct TestDatabase {
    pool: PgPool,
    admin_options: PgConnectOptions,
    database_name: String,
}

impl TestDatabase {
    /// Creates a fresh database on the server named by `DATABASE_URL`.
    pub async fn new() -> Result<Self> {
        let url = std::env::var(DATABASE_URL_ENV)
            .with_context(|| format!("{DATABASE_URL_ENV} must be set for database tests"))?;
        let admin_options =
            PgConnectOptions::from_str(&url).context("DATABASE_URL is not a PostgreSQL URL")?;

        let database_name = format!("courier_test_{}", Uuid::new_v4().simple());

        let admin_pool = admin_pool(&admin_options).await?;
        sqlx::query(&format!("CREATE DATABASE \"{database_name}\""))
            .execute(&admin_pool)
            .await
            .context("failed to create test database")?;
        admin_pool.close().await;

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Some(Duration::from_secs(30)))
            .connect_with(admin_options.clone().database(&database_name))
            .await
            .context("failed to connect to test database")?;

        schema::migrate(&pool).await.context("failed to apply schema")?;

        Ok(Self { pool, admin_options, database_name })
    }

    /// Returns the connection pool.
    pub fn pool(&self) -> PgPool {
        self.pool.clone()
    }

    /// Returns a store over this database.
    pub fn storage(&self) -> Arc<Storage> {
        Arc::new(Storage::new(self.pool()))
    }

    /// Name of the created database.
    pub fn name(&self) -> &str {
        &self.database_name
    }

    /// Closes the pool and drops the database.
    pub async fn cleanup(self) -> Result<()> {
        self.pool.close().await;

        let admin_pool = admin_pool(&self.admin_options).await?;
        let _ = sqlx::query(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = $1 AND pid <> pg_backend_pid()",
        )
        .bind(&self.database_name)
        .execute(&admin_pool)
        .await;

        sqlx::query(&format!("DROP DATABASE IF EXISTS \"{}\"", self.database_name))
            .execute(&admin_pool)
            .await
            .context("failed to drop test database")?;
        admin_pool.close().await;
        Ok(())
    }

    /// Counts rows of `table`.
    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.pool)
            .await
            .with_context(|| format!("failed to count rows in {table}"))
    }
}

async fn admin_pool(options: &PgConnectOptions) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect_with(options.clone())
        .await
        .context("failed to connect to PostgreSQL admin database")
}
