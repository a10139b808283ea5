use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::postgres::PgRow;

use crate::context::StoreContext;
use crate::{Error, Result};

/// Start and end marks of one ingestion run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub transaction_id: i64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl RunRecord {
    pub fn is_complete(&self) -> bool {
        self.completed_at.is_some()
    }
}

/// Bookkeeping over `staging_transactions`.
#[derive(Debug, Clone)]
pub struct TransactionLog {
    ctx: StoreContext,
}

impl TransactionLog {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn begin(&self) -> Result<i64> {
        self.ctx
            .run("runs.begin", async {
                let row = sqlx::query(
                    "INSERT INTO staging_transactions DEFAULT VALUES RETURNING transaction_id",
                )
                .fetch_one(self.ctx.pool())
                .await?;
                let id: i64 = row.try_get("transaction_id")?;
                tracing::info!(transaction_id = id, "run started");
                Ok(id)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn finish(&self, transaction_id: i64) -> Result<()> {
        self.ctx
            .run("runs.finish", async {
                let res = sqlx::query(
                    r#"
                    UPDATE staging_transactions
                       SET completed_at = now()
                     WHERE transaction_id = $1
                    "#,
                )
                .bind(transaction_id)
                .execute(self.ctx.pool())
                .await?;
                if res.rows_affected() == 0 {
                    return Err(Error::NotFound(format!("run {transaction_id}")));
                }
                tracing::info!(transaction_id, "run finished");
                Ok(())
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn get(&self, transaction_id: i64) -> Result<Option<RunRecord>> {
        self.ctx
            .run("runs.get", async {
                let row = sqlx::query(
                    r#"
                    SELECT transaction_id, created_at, completed_at
                      FROM staging_transactions
                     WHERE transaction_id = $1
                    "#,
                )
                .bind(transaction_id)
                .fetch_optional(self.ctx.pool())
                .await?;
                row.as_ref().map(run_from_row).transpose()
            })
            .await
    }

    /// Newest first.
    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn list(&self) -> Result<Vec<RunRecord>> {
        self.ctx
            .run("runs.list", async {
                let rows = sqlx::query(
                    r#"
                    SELECT transaction_id, created_at, completed_at
                      FROM staging_transactions
                     ORDER BY transaction_id DESC
                    "#,
                )
                .fetch_all(self.ctx.pool())
                .await?;
                rows.iter().map(run_from_row).collect()
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn count(&self) -> Result<u64> {
        self.ctx
            .run("runs.count", async {
                let row = sqlx::query("SELECT count(*) AS n FROM staging_transactions")
                    .fetch_one(self.ctx.pool())
                    .await?;
                let n: i64 = row.try_get("n")?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn clear_all(&self) -> Result<u64> {
        self.ctx
            .run("runs.clear_all", async {
                let res = sqlx::query("DELETE FROM staging_transactions")
                    .execute(self.ctx.pool())
                    .await?;
                Ok(res.rows_affected())
            })
            .await
    }
}

fn run_from_row(row: &PgRow) -> Result<RunRecord> {
    Ok(RunRecord {
        transaction_id: row.try_get("transaction_id")?,
        created_at: row.try_get("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestInfra;

    #[tokio::test]
    async fn run_lifecycle() {
        let Some(infra) = TestInfra::from_env().await else {
            return;
        };
        let log = TransactionLog::new(infra.ctx());

        let id = log.begin().await.expect("begin");
        let open = log.get(id).await.expect("get").expect("row");
        assert!(!open.is_complete());

        log.finish(id).await.expect("finish");
        let done = log.get(id).await.expect("get").expect("row");
        assert!(done.is_complete());
        assert!(done.completed_at >= Some(done.created_at));

        assert!(log.list().await.expect("list").iter().any(|r| r.transaction_id == id));
        assert!(log.count().await.expect("count") >= 1);
        assert!(matches!(log.finish(-1).await, Err(Error::NotFound(_))));
    }
}
