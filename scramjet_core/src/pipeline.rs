//! The staged synchronization flow: ingest → validate/transfer → reconcile → purge.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::EngineConfig;
use crate::context::StoreContext;
use crate::diff::flag_deletes;
use crate::filter::Filter;
use crate::models::{Identifier, StagingRecord, Storeable, Validator};
use crate::resources::{ResourceStore, UpsertSummary};
use crate::schema;
use crate::staging::{StagingStore, ValidationReport};
use crate::transactions::TransactionLog;
use crate::{Error, Result};

/// One request to an intake source.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntakePage {
    pub offset: usize,
    /// `None` for a single unbounded fetch.
    pub limit: Option<usize>,
}

/// How an intake source is paged.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum IntakePlan {
    /// One fetch starting at offset 0.
    Single,
    /// Fetch at offsets `0, chunk_size, 2 * chunk_size, ...` while below `count`.
    Chunked { count: usize, chunk_size: usize },
}

impl IntakePlan {
    pub fn pages(&self) -> Result<Vec<IntakePage>> {
        match *self {
            Self::Single => Ok(vec![IntakePage {
                offset: 0,
                limit: None,
            }]),
            Self::Chunked { chunk_size: 0, .. } => Err(Error::InvalidInput(
                "intake chunk_size must be > 0".to_string(),
            )),
            Self::Chunked { count: 0, .. } => Ok(vec![IntakePage {
                offset: 0,
                limit: None,
            }]),
            Self::Chunked { count, chunk_size } => Ok((0..count)
                .step_by(chunk_size)
                .map(|offset| IntakePage {
                    offset,
                    limit: Some(chunk_size),
                })
                .collect()),
        }
    }
}

/// Upstream producer of documents for one type.
#[async_trait]
pub trait IntakeSource: Send + Sync {
    type Record: Storeable + Send + Sync;

    async fn fetch(&self, page: IntakePage) -> Result<Vec<Self::Record>>;
}

/// Upstream's authoritative list of ids for one type.
#[async_trait]
pub trait IdSource: Send + Sync {
    async fn ids(&self) -> Result<Vec<String>>;
}

#[async_trait]
impl IdSource for Vec<String> {
    async fn ids(&self) -> Result<Vec<String>> {
        Ok(self.clone())
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub pages: usize,
    pub fetched: usize,
    pub staged: u64,
    pub skipped: usize,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    pub validation: ValidationReport,
    pub promoted: UpsertSummary,
    /// Valid rows the resource store refused; marked invalid and kept in staging.
    pub held: usize,
    /// Promoted staging rows removed afterwards.
    pub cleared: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub source: usize,
    pub existing: usize,
    pub flagged: Vec<Identifier>,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeReport {
    pub deleted: u64,
    pub cleared: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub transaction_id: i64,
    pub ingest: IngestReport,
    pub transfer: TransferReport,
    pub reconcile: ReconcileReport,
    pub purge: PurgeReport,
}

/// Inputs to [`SyncEngine::full_sync`].
pub struct FullSync<'a, S, D: ?Sized> {
    pub type_name: &'a str,
    pub intake: &'a S,
    pub plan: IntakePlan,
    pub validator: &'a dyn Validator,
    pub filter: Option<&'a Filter>,
    pub ids: &'a D,
}

/// Owns the stores for one database and runs the synchronization flow over them.
#[derive(Debug, Clone)]
pub struct SyncEngine {
    staging: StagingStore,
    resources: ResourceStore,
    runs: TransactionLog,
}

impl SyncEngine {
    pub fn new(ctx: StoreContext) -> Self {
        Self {
            staging: StagingStore::new(ctx.clone()),
            resources: ResourceStore::new(ctx.clone()),
            runs: TransactionLog::new(ctx),
        }
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn connect(cfg: &EngineConfig) -> Result<Self> {
        Ok(Self::new(StoreContext::connect(cfg).await?))
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn migrate(&self) -> Result<()> {
        schema::migrate(self.staging.context().pool()).await
    }

    pub fn context(&self) -> &StoreContext {
        self.staging.context()
    }

    pub fn staging(&self) -> &StagingStore {
        &self.staging
    }

    pub fn resources(&self) -> &ResourceStore {
        &self.resources
    }

    pub fn runs(&self) -> &TransactionLog {
        &self.runs
    }

    /// Validate staged rows, promote the valid ones, then clear what was promoted.
    ///
    /// With a filter, every step is restricted to matching rows. Rows the resource
    /// store skips are marked invalid instead of cleared, and rows re-staged while
    /// the transfer runs are left for the next one. Running it twice in a row
    /// promotes nothing new.
    #[tracing::instrument(level = "debug", skip(self, validator, filter))]
    pub async fn transfer(
        &self,
        type_name: &str,
        validator: &dyn Validator,
        filter: Option<&Filter>,
    ) -> Result<TransferReport> {
        let validation = self.staging.validate(type_name, validator, filter).await?;
        let valid = self.staging.retrieve_valid(type_name, filter).await?;
        let outcome = self.resources.upsert_detailed(&valid).await?;

        let skipped: HashSet<&Identifier> = outcome.skipped.iter().collect();
        let (held, promoted): (Vec<StagingRecord>, Vec<StagingRecord>) = valid
            .into_iter()
            .partition(|r| skipped.contains(&r.identifier));
        if !held.is_empty() {
            tracing::warn!(type_name, held = held.len(), "valid rows could not be promoted");
            self.staging.mark_invalid(&held).await?;
        }
        let cleared = self.staging.clear_promoted(&promoted).await?.affected;

        let report = TransferReport {
            validation,
            promoted: outcome.summary,
            held: held.len(),
            cleared,
        };
        tracing::info!(
            type_name,
            valid = report.validation.valid,
            invalid = report.validation.invalid,
            inserted = report.promoted.inserted,
            updated = report.promoted.updated,
            unchanged = report.promoted.unchanged,
            held = report.held,
            cleared,
            "transfer complete"
        );
        Ok(report)
    }

    /// Pull documents from `source` page by page, staging each page as it arrives.
    #[tracing::instrument(level = "debug", skip(self, source))]
    pub async fn ingest<S: IntakeSource>(
        &self,
        source: &S,
        plan: IntakePlan,
    ) -> Result<IngestReport> {
        let pages = plan.pages()?;
        let total = pages.len();
        let mut report = IngestReport::default();
        for (i, page) in pages.into_iter().enumerate() {
            tracing::debug!(
                page = i + 1,
                pages = total,
                offset = page.offset,
                "fetching intake page"
            );
            let records = source.fetch(page).await?;
            report.pages += 1;
            report.fetched += records.len();
            if records.is_empty() {
                continue;
            }
            let staged = self.staging.put(&records).await?;
            report.staged += staged.staged;
            report.skipped += staged.skipped;
        }
        tracing::info!(
            pages = report.pages,
            fetched = report.fetched,
            staged = report.staged,
            skipped = report.skipped,
            "ingest complete"
        );
        Ok(report)
    }

    /// Stage deletions for committed ids of `type_name` that `source` no longer lists.
    ///
    /// A filter restricts which committed resources take part in the comparison.
    #[tracing::instrument(level = "debug", skip(self, source, filter))]
    pub async fn reconcile<D: IdSource + ?Sized>(
        &self,
        type_name: &str,
        source: &D,
        filter: Option<&Filter>,
    ) -> Result<ReconcileReport> {
        let source_ids = source.ids().await?;
        let existing = self.resources.identities(type_name, filter).await?;
        let flagged = flag_deletes(type_name, &source_ids, &existing)?;
        if !flagged.is_empty() {
            self.staging.mark_for_delete(&flagged).await?;
        }
        tracing::info!(
            type_name,
            source = source_ids.len(),
            existing = existing.len(),
            flagged = flagged.len(),
            "reconcile complete"
        );
        Ok(ReconcileReport {
            source: source_ids.len(),
            existing: existing.len(),
            flagged,
        })
    }

    /// Apply staged delete markers: remove the resources, then the markers.
    ///
    /// Markers are only cleared after the resources are gone, so an interrupted purge
    /// can simply be run again.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn purge_deleted(&self, type_name: &str) -> Result<PurgeReport> {
        let markers = self.staging.retrieve_deleted(type_name).await?;
        if markers.is_empty() {
            return Ok(PurgeReport::default());
        }
        let deleted = self.resources.delete(&markers).await?;
        let cleared = self.staging.clear_deleted_ids(&markers).await?;
        let report = PurgeReport {
            deleted: deleted.affected,
            cleared: cleared.affected,
        };
        tracing::info!(
            type_name,
            deleted = report.deleted,
            cleared = report.cleared,
            "purge complete"
        );
        Ok(report)
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub async fn purge_deleted_one(&self, id: &Identifier) -> Result<PurgeReport> {
        let marker = self
            .staging
            .get(id)
            .await?
            .filter(|r| r.to_delete)
            .ok_or_else(|| Error::NotFound(format!("delete marker for {id}")))?;
        let targets = std::slice::from_ref(&marker.identifier);
        let deleted = self.resources.delete(targets).await?;
        let cleared = self.staging.clear_deleted_ids(targets).await?;
        Ok(PurgeReport {
            deleted: deleted.affected,
            cleared: cleared.affected,
        })
    }

    /// Ingest, transfer, reconcile and purge one type, recorded as a run.
    ///
    /// A failed step leaves the run open (no `completed_at`).
    #[tracing::instrument(level = "debug", skip_all, fields(type_name = job.type_name))]
    pub async fn full_sync<S, D>(&self, job: FullSync<'_, S, D>) -> Result<SyncReport>
    where
        S: IntakeSource,
        D: IdSource + ?Sized,
    {
        let transaction_id = self.runs.begin().await?;
        let result = async {
            let ingest = self.ingest(job.intake, job.plan).await?;
            let transfer = self.transfer(job.type_name, job.validator, job.filter).await?;
            let reconcile = self.reconcile(job.type_name, job.ids, job.filter).await?;
            let purge = self.purge_deleted(job.type_name).await?;
            Ok::<_, Error>((ingest, transfer, reconcile, purge))
        }
        .await;

        match result {
            Ok((ingest, transfer, reconcile, purge)) => {
                self.runs.finish(transaction_id).await?;
                Ok(SyncReport {
                    transaction_id,
                    ingest,
                    transfer,
                    reconcile,
                    purge,
                })
            }
            Err(err) => {
                tracing::warn!(transaction_id, error = %err, "sync run failed");
                Err(err)
            }
        }
    }
}
