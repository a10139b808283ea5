use std::error::Error as StdError;
use std::time::Duration;

use crate::bulk::BulkStage;
use crate::diff::DiffRefusal;

/// Common error type for `scramjet_core`.
///
/// Backend failures keep the underlying `sqlx::Error` as their source so callers can
/// tell a data problem (refusals, invalid input) from an infrastructure problem
/// (connection loss, a failed bulk stage, a timeout).
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("refused: {0}")]
    Refused(#[from] DiffRefusal),

    /// One stage of the temp-table-and-merge sequence failed; the whole call rolled back.
    #[error("bulk upsert into {table} failed during {stage}")]
    Bulk {
        table: &'static str,
        stage: BulkStage,
        #[source]
        source: sqlx::Error,
    },

    /// A chunked set operation failed. Chunks before `chunk` stay committed.
    #[error("{operation} failed on chunk {chunk} of {chunks}")]
    Chunk {
        operation: &'static str,
        chunk: usize,
        chunks: usize,
        #[source]
        source: sqlx::Error,
    },

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// An external collaborator (intake list maker, id list maker) failed.
    #[error("{context}")]
    Source {
        context: String,
        #[source]
        source: Box<dyn StdError + Send + Sync + 'static>,
    },

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    BackendMessage(String),
}

impl Error {
    #[tracing::instrument(level = "debug", name = "scramjet.error.bulk", skip(source))]
    pub fn bulk(table: &'static str, stage: BulkStage, source: sqlx::Error) -> Self {
        Self::Bulk {
            table,
            stage,
            source,
        }
    }

    /// Wrap a failure from caller-supplied code (list makers, connectors).
    pub fn source(
        context: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            context: context.into(),
            source: Box::new(source),
        }
    }

    /// The bulk stage that failed, when this error came out of a bulk upsert.
    pub fn bulk_stage(&self) -> Option<BulkStage> {
        match self {
            Self::Bulk { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// `true` for failures caused by the submitted data or a guard, rather than the backend.
    pub fn is_data_problem(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_) | Self::NotFound(_) | Self::Refused(_) | Self::Serialization(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_error_reports_stage() {
        let err = Error::bulk("staging", BulkStage::Merge, sqlx::Error::RowNotFound);
        assert_eq!(err.bulk_stage(), Some(BulkStage::Merge));
        assert_eq!(
            err.to_string(),
            "bulk upsert into staging failed during merge"
        );
        assert!(!err.is_data_problem());
    }

    #[test]
    fn refusals_are_data_problems() {
        let err: Error = DiffRefusal::NothingToCompare {
            type_name: "person".to_string(),
        }
        .into();
        assert!(err.is_data_problem());
        assert!(err.bulk_stage().is_none());
    }
}
