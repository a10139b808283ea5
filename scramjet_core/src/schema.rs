use sqlx::Row;
use sqlx::postgres::PgPool;

use crate::Result;

/// Arbitrary constant shared by every process migrating the same database.
const MIGRATION_LOCK_KEY: i64 = 0x5C7A_4A37;

const DDL: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS staging (
        id        TEXT NOT NULL,
        type      TEXT NOT NULL,
        data      JSON NOT NULL,
        is_valid  BOOLEAN NULL,
        to_delete BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (id, type)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS staging_type_valid_idx
      ON staging (type, is_valid)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS staging_type_delete_idx
      ON staging (type, to_delete)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS resources (
        id           TEXT NOT NULL,
        type         TEXT NOT NULL,
        hash         TEXT NOT NULL,
        data         JSON NOT NULL,
        data_indexed JSONB NOT NULL,
        created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        updated_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
        PRIMARY KEY (id, type),
        UNIQUE (id, type, hash)
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS resources_type_updated_idx
      ON resources (type, updated_at)
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS resources_data_indexed_idx
      ON resources USING GIN (data_indexed)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS staging_transactions (
        transaction_id BIGSERIAL PRIMARY KEY,
        created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
        completed_at   TIMESTAMPTZ NULL
    )
    "#,
];

/// Create the staging, resources and run-log tables if they do not exist.
///
/// Concurrent callers serialize on a transaction-scoped advisory lock.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_KEY)
        .execute(&mut *tx)
        .await?;
    for stmt in DDL {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    tx.commit().await?;
    tracing::info!(statements = DDL.len(), "schema migrated");
    Ok(())
}

#[tracing::instrument(level = "debug", skip(pool))]
pub async fn table_exists(pool: &PgPool, table: &str) -> Result<bool> {
    let row = sqlx::query("SELECT to_regclass($1) IS NOT NULL AS present")
        .bind(table)
        .fetch_one(pool)
        .await?;
    Ok(row.try_get("present")?)
}

/// Drop every table this crate owns. Intended for test teardown.
#[tracing::instrument(level = "debug", skip_all)]
pub async fn drop_all(pool: &PgPool) -> Result<()> {
    sqlx::query("DROP TABLE IF EXISTS staging, resources, staging_transactions")
        .execute(pool)
        .await?;
    tracing::warn!("dropped scramjet tables");
    Ok(())
}
