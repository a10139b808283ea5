use std::future::Future;
use std::time::Duration;

use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::config::{DEFAULT_CHUNK_SIZE, EngineConfig, MAX_CHUNK_SIZE};
use crate::{Error, Result};

/// Explicit handle shared by every store: the pool, the chunk size for set
/// operations, and an optional per-operation deadline.
///
/// Cloning is cheap; `PgPool` is reference counted.
#[derive(Debug, Clone)]
pub struct StoreContext {
    pool: PgPool,
    chunk_size: usize,
    operation_timeout: Option<Duration>,
}

impl StoreContext {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            chunk_size: DEFAULT_CHUNK_SIZE,
            operation_timeout: None,
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn connect(cfg: &EngineConfig) -> Result<Self> {
        cfg.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(cfg.postgres.max_connections)
            .acquire_timeout(cfg.postgres.acquire_timeout)
            .connect(&cfg.postgres.url)
            .await?;
        tracing::info!(
            max_connections = cfg.postgres.max_connections,
            chunk_size = cfg.chunk_size,
            "connected to postgres"
        );
        Ok(Self {
            pool,
            chunk_size: cfg.chunk_size,
            operation_timeout: cfg.operation_timeout,
        })
    }

    /// Values outside `1..=10_000` are clamped.
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.clamp(1, MAX_CHUNK_SIZE);
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout
    }

    /// Run `fut` under the configured deadline.
    ///
    /// On expiry the future is dropped; any `sqlx::Transaction` it held rolls back on drop.
    pub async fn run<T, F>(&self, operation: &'static str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match self.operation_timeout {
            None => fut.await,
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(res) => res,
                Err(_) => {
                    tracing::warn!(operation, ?after, "operation deadline exceeded");
                    Err(Error::Timeout { operation, after })
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_ctx() -> StoreContext {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/scramjet")
            .expect("lazy pool");
        StoreContext::new(pool)
    }

    #[tokio::test]
    async fn chunk_size_is_clamped() {
        let ctx = lazy_ctx().with_chunk_size(0);
        assert_eq!(ctx.chunk_size(), 1);
        let ctx = ctx.with_chunk_size(50_000);
        assert_eq!(ctx.chunk_size(), MAX_CHUNK_SIZE);
    }

    #[tokio::test]
    async fn run_without_deadline_passes_through() {
        let ctx = lazy_ctx();
        let out = ctx.run("noop", async { Ok(7) }).await.expect("ok");
        assert_eq!(out, 7);
    }

    #[tokio::test]
    async fn run_reports_timeout() {
        let ctx = lazy_ctx().with_operation_timeout(Some(Duration::from_millis(10)));
        let err = ctx
            .run("slow", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { operation: "slow", .. }));
    }
}
