use std::time::Duration;

use url::Url;

use crate::{Error, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 500;
pub const MAX_CHUNK_SIZE: usize = 10_000;

#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl PostgresConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            acquire_timeout: Duration::from_millis(30_000),
        }
    }

    /// Assemble a connection URL from discrete settings. User and password are percent-escaped.
    #[tracing::instrument(level = "debug", skip(password))]
    pub fn from_parts(
        server: &str,
        port: u16,
        database: &str,
        user: &str,
        password: &str,
    ) -> Result<Self> {
        if server.trim().is_empty() {
            return Err(Error::InvalidInput("postgres server is empty".to_string()));
        }
        let mut url = Url::parse(&format!("postgres://{server}:{port}"))
            .map_err(|e| Error::InvalidInput(format!("invalid postgres server {server}: {e}")))?;
        url.set_username(user)
            .map_err(|_| Error::InvalidInput("postgres user cannot be set".to_string()))?;
        if !password.is_empty() {
            url.set_password(Some(password))
                .map_err(|_| Error::InvalidInput("postgres password cannot be set".to_string()))?;
        }
        url.set_path(database);
        Ok(Self::new(url.to_string()))
    }
}

/// Settings for a [`crate::SyncEngine`] and the stores it owns.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub postgres: PostgresConfig,
    /// Upper bound on identities sent per statement by chunked marks and deletes.
    pub chunk_size: usize,
    /// Deadline applied to every store operation; `None` means no deadline.
    pub operation_timeout: Option<Duration>,
}

impl EngineConfig {
    pub fn new(postgres: PostgresConfig) -> Self {
        Self {
            postgres,
            chunk_size: DEFAULT_CHUNK_SIZE,
            operation_timeout: None,
        }
    }

    #[tracing::instrument(level = "debug")]
    pub fn from_env() -> Result<Self> {
        let url = non_empty_var("SCRAMJET_DATABASE_URL")
            .or_else(|| non_empty_var("DATABASE_URL"))
            .ok_or_else(|| {
                Error::InvalidInput("SCRAMJET_DATABASE_URL is required".to_string())
            })?;
        let max_connections = std::env::var("SCRAMJET_DB_MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(10);
        let acquire_timeout_ms = std::env::var("SCRAMJET_DB_ACQUIRE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30_000);

        let chunk_size = match non_empty_var("SCRAMJET_CHUNK_SIZE") {
            Some(v) => v.trim().parse::<usize>().map_err(|_| {
                Error::InvalidInput(format!("invalid SCRAMJET_CHUNK_SIZE: {v}"))
            })?,
            None => DEFAULT_CHUNK_SIZE,
        };
        let operation_timeout = non_empty_var("SCRAMJET_OPERATION_TIMEOUT_MS")
            .map(|v| {
                v.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
                    Error::InvalidInput(format!("invalid SCRAMJET_OPERATION_TIMEOUT_MS: {v}"))
                })
            })
            .transpose()?;

        let cfg = Self {
            postgres: PostgresConfig {
                url,
                max_connections,
                acquire_timeout: Duration::from_millis(acquire_timeout_ms),
            },
            chunk_size,
            operation_timeout,
        };

        cfg.validate()?;
        Ok(cfg)
    }

    #[tracing::instrument(level = "debug")]
    pub fn validate(&self) -> Result<()> {
        if self.postgres.url.trim().is_empty() {
            return Err(Error::InvalidInput("postgres.url is empty".to_string()));
        }
        if self.postgres.max_connections == 0 {
            return Err(Error::InvalidInput(
                "postgres.max_connections must be > 0".to_string(),
            ));
        }
        if self.postgres.acquire_timeout.is_zero() {
            return Err(Error::InvalidInput(
                "postgres.acquire_timeout must be > 0".to_string(),
            ));
        }
        if self.chunk_size == 0 || self.chunk_size > MAX_CHUNK_SIZE {
            return Err(Error::InvalidInput(format!(
                "chunk_size must be in 1..={MAX_CHUNK_SIZE}"
            )));
        }
        if self.operation_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::InvalidInput(
                "operation_timeout must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
