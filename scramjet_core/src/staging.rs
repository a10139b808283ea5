use serde::{Deserialize, Serialize};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::bulk::{BulkUpsert, ChunkReport, CopyRows, dedupe_last, for_each_chunk};
use crate::context::StoreContext;
use crate::filter::{Filter, FilterTarget, push_filter};
use crate::models::{Identifiable, Identifier, StagingRecord, Storeable, Validator, Validity};
use crate::{Error, Result};

const STAGING_COLUMNS: &str = "id, type, data::text AS data, is_valid, to_delete";

const PUT_MERGE: &str = r#"
    INSERT INTO staging (id, type, data, is_valid, to_delete)
    SELECT id, type, data, NULL, FALSE FROM tmp_staging_put
    ON CONFLICT (id, type) DO UPDATE
       SET data = EXCLUDED.data,
           is_valid = NULL,
           to_delete = FALSE
    RETURNING (xmax = 0) AS inserted
"#;

const DELETE_MARK_MERGE: &str = r#"
    INSERT INTO staging (id, type, data, is_valid, to_delete)
    SELECT id, type, '{}'::json, NULL, TRUE FROM tmp_staging_delete
    ON CONFLICT (id, type) DO UPDATE
       SET data = EXCLUDED.data,
           is_valid = NULL,
           to_delete = TRUE
    RETURNING (xmax = 0) AS inserted
"#;

const PUT: BulkUpsert<'static> = BulkUpsert {
    table: "staging",
    temp_table: "tmp_staging_put",
    temp_columns: "id TEXT NOT NULL, type TEXT NOT NULL, data JSON NOT NULL",
    columns: "id, type, data",
    merge_sql: PUT_MERGE,
};

const DELETE_MARK: BulkUpsert<'static> = BulkUpsert {
    table: "staging",
    temp_table: "tmp_staging_delete",
    temp_columns: "id TEXT NOT NULL, type TEXT NOT NULL",
    columns: "id, type",
    merge_sql: DELETE_MARK_MERGE,
};

/// Result of staging a batch.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageSummary {
    /// Rows written after in-batch deduplication.
    pub staged: u64,
    /// Rows that replaced an already-staged record.
    pub replaced: u64,
    /// Records dropped because their payload could not be serialized.
    pub skipped: usize,
}

/// Outcome of a validation pass over one type.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub valid: usize,
    pub invalid: usize,
}

/// Newly-ingested documents waiting for validation and promotion.
///
/// Rows are keyed by `(id, type)`; re-staging a key replaces its payload and resets
/// validity to [`Validity::Unknown`]. Delete markers carry a `{}` payload and are never
/// validated.
#[derive(Debug, Clone)]
pub struct StagingStore {
    ctx: StoreContext,
}

impl StagingStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &StoreContext {
        &self.ctx
    }

    fn pool(&self) -> &PgPool {
        self.ctx.pool()
    }

    /// Stage documents. Duplicate identities in one batch collapse to the last one.
    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub async fn put<T: Storeable + Sync>(&self, records: &[T]) -> Result<StageSummary> {
        self.ctx
            .run("staging.put", async {
                let (rows, skipped) = encode_documents(records);
                let counts = PUT.execute(self.pool(), &rows).await?;
                let summary = StageSummary {
                    staged: counts.inserted + counts.updated,
                    replaced: counts.updated,
                    skipped,
                };
                tracing::info!(
                    staged = summary.staged,
                    replaced = summary.replaced,
                    skipped,
                    "staged documents"
                );
                Ok(summary)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all, fields(id = %record.identifier()))]
    pub async fn put_one<T: Storeable + Sync>(&self, record: &T) -> Result<StageSummary> {
        self.put(std::slice::from_ref(record)).await
    }

    /// Stage deletion intent for each identity (placeholder `{}` payload).
    #[tracing::instrument(level = "debug", skip_all, fields(records = ids.len()))]
    pub async fn mark_for_delete<I: Identifiable + Sync>(&self, ids: &[I]) -> Result<u64> {
        self.ctx
            .run("staging.mark_for_delete", async {
                let mut rows = CopyRows::default();
                for item in dedupe_last(ids) {
                    let id = item.identifier();
                    rows.push_row(&[&id.id, &id.type_name]);
                }
                let counts = DELETE_MARK.execute(self.pool(), &rows).await?;
                let marked = counts.inserted + counts.updated;
                tracing::info!(marked, "staged delete markers");
                Ok(marked)
            })
            .await
    }

    /// Evaluate every live row of `type_name` (optionally narrowed by `filter`) and
    /// partition into `(valid, rejected)`. Nothing is persisted.
    ///
    /// Rows already judged are evaluated again, so a fixed validator can recover them.
    #[tracing::instrument(level = "debug", skip(self, validator, filter))]
    pub async fn filter(
        &self,
        type_name: &str,
        validator: &dyn Validator,
        filter: Option<&Filter>,
    ) -> Result<(Vec<StagingRecord>, Vec<StagingRecord>)> {
        let rows = self
            .select(
                "staging.filter",
                type_name,
                "AND to_delete = FALSE",
                filter,
            )
            .await?;
        let (valid, rejected): (Vec<_>, Vec<_>) =
            rows.into_iter().partition(|r| validator.validate(&r.payload));
        tracing::debug!(
            type_name,
            valid = valid.len(),
            rejected = rejected.len(),
            "filtered staging"
        );
        Ok((valid, rejected))
    }

    /// Chunked; see [`StagingStore::mark_invalid`] for partial-failure behavior.
    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub async fn mark_valid(&self, records: &[StagingRecord]) -> Result<ChunkReport> {
        self.set_validity("staging.mark_valid", records, Validity::Valid)
            .await
    }

    /// Record verdicts for rows as they were read. A row whose payload has been
    /// re-staged since then is left alone and keeps [`Validity::Unknown`].
    ///
    /// Chunked at the context's chunk size. Each chunk commits on its own; when one
    /// fails the rest are not attempted and earlier chunks stay marked.
    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub async fn mark_invalid(&self, records: &[StagingRecord]) -> Result<ChunkReport> {
        self.set_validity("staging.mark_invalid", records, Validity::Invalid)
            .await
    }

    async fn set_validity(
        &self,
        operation: &'static str,
        records: &[StagingRecord],
        validity: Validity,
    ) -> Result<ChunkReport> {
        let pool = self.pool();
        let flag = validity.as_column();
        self.ctx
            .run(operation, async {
                for_each_chunk(operation, records, self.ctx.chunk_size(), |chunk| {
                    let (ids, types, payloads) = split_evaluated(chunk);
                    async move {
                        sqlx::query(
                            r#"
                            UPDATE staging s
                               SET is_valid = $4
                              FROM UNNEST($1::text[], $2::text[], $3::text[]) AS v(id, type, data)
                             WHERE s.id = v.id
                               AND s.type = v.type
                               AND s.data::text = v.data
                               AND s.to_delete = FALSE
                            "#,
                        )
                        .bind(ids)
                        .bind(types)
                        .bind(payloads)
                        .bind(flag)
                        .execute(pool)
                        .await
                        .map(|r| r.rows_affected())
                    }
                })
                .await
            })
            .await
    }

    /// Filter then persist the verdicts.
    #[tracing::instrument(level = "debug", skip(self, validator, filter))]
    pub async fn validate(
        &self,
        type_name: &str,
        validator: &dyn Validator,
        filter: Option<&Filter>,
    ) -> Result<ValidationReport> {
        let (valid, rejected) = self.filter(type_name, validator, filter).await?;
        self.mark_valid(&valid).await?;
        self.mark_invalid(&rejected).await?;
        let report = ValidationReport {
            valid: valid.len(),
            invalid: rejected.len(),
        };
        tracing::info!(
            type_name,
            valid = report.valid,
            invalid = report.invalid,
            "validated staging"
        );
        Ok(report)
    }

    /// Re-validate one staged record regardless of its current verdict.
    #[tracing::instrument(level = "debug", skip(self, validator), fields(id = %id))]
    pub async fn validate_one(
        &self,
        id: &Identifier,
        validator: &dyn Validator,
    ) -> Result<Validity> {
        let record = self
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("staged record {id}")))?;
        if record.to_delete {
            return Err(Error::InvalidInput(format!(
                "{id} is a delete marker and is not validated"
            )));
        }
        let validity = if validator.validate(&record.payload) {
            Validity::Valid
        } else {
            Validity::Invalid
        };
        self.set_validity(
            "staging.validate_one",
            std::slice::from_ref(&record),
            validity,
        )
        .await?;
        Ok(validity)
    }

    #[tracing::instrument(level = "debug", skip(self, filter))]
    pub async fn retrieve_valid(
        &self,
        type_name: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<StagingRecord>> {
        self.select(
            "staging.retrieve_valid",
            type_name,
            "AND is_valid = TRUE AND to_delete = FALSE",
            filter,
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve_invalid(&self, type_name: &str) -> Result<Vec<StagingRecord>> {
        self.select(
            "staging.retrieve_invalid",
            type_name,
            "AND is_valid = FALSE AND to_delete = FALSE",
            None,
        )
        .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve_deleted(&self, type_name: &str) -> Result<Vec<StagingRecord>> {
        self.select("staging.retrieve_deleted", type_name, "AND to_delete = TRUE", None)
            .await
    }

    /// Every staged row of the type, delete markers included.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn retrieve(&self, type_name: &str) -> Result<Vec<StagingRecord>> {
        self.select("staging.retrieve", type_name, "", None).await
    }

    async fn select(
        &self,
        operation: &'static str,
        type_name: &str,
        clause: &'static str,
        filter: Option<&Filter>,
    ) -> Result<Vec<StagingRecord>> {
        self.ctx
            .run(operation, async {
                let mut qb = QueryBuilder::<Postgres>::new(format!(
                    "SELECT {STAGING_COLUMNS} FROM staging WHERE type = "
                ));
                qb.push_bind(type_name.to_string());
                qb.push(" ");
                qb.push(clause);
                if let Some(filter) = filter {
                    qb.push(" AND ");
                    push_filter(&mut qb, filter, FilterTarget::Staging)?;
                }
                qb.push(" ORDER BY id");

                let rows = qb.build().fetch_all(self.pool()).await?;
                rows.iter().map(staging_from_row).collect()
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub async fn get(&self, id: &Identifier) -> Result<Option<StagingRecord>> {
        self.ctx
            .run("staging.get", async {
                let row = sqlx::query(&format!(
                    "SELECT {STAGING_COLUMNS} FROM staging WHERE id = $1 AND type = $2"
                ))
                .bind(&id.id)
                .bind(&id.type_name)
                .fetch_optional(self.pool())
                .await?;
                row.as_ref().map(staging_from_row).transpose()
            })
            .await
    }

    /// Remove promoted (valid) rows, or every live row when `only_valid` is false.
    /// Invalid rows survive the default call so they can be inspected.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn clear(&self, type_name: &str, only_valid: bool) -> Result<u64> {
        let sql = if only_valid {
            "DELETE FROM staging WHERE type = $1 AND is_valid = TRUE AND to_delete = FALSE"
        } else {
            "DELETE FROM staging WHERE type = $1 AND to_delete = FALSE"
        };
        self.ctx
            .run("staging.clear", async {
                let res = sqlx::query(sql).bind(type_name).execute(self.pool()).await?;
                tracing::debug!(
                    type_name,
                    only_valid,
                    rows = res.rows_affected(),
                    "cleared staging"
                );
                Ok(res.rows_affected())
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self, filter))]
    pub async fn clear_valid_filtered(&self, type_name: &str, filter: &Filter) -> Result<u64> {
        self.ctx
            .run("staging.clear_valid_filtered", async {
                let mut qb = QueryBuilder::<Postgres>::new("DELETE FROM staging WHERE type = ");
                qb.push_bind(type_name.to_string());
                qb.push(" AND is_valid = TRUE AND to_delete = FALSE AND ");
                push_filter(&mut qb, filter, FilterTarget::Staging)?;
                let res = qb.build().execute(self.pool()).await?;
                Ok(res.rows_affected())
            })
            .await
    }

    /// Remove valid rows that still hold the payload they were promoted with.
    /// Rows re-staged in the meantime are kept. Chunked.
    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub async fn clear_promoted(&self, records: &[StagingRecord]) -> Result<ChunkReport> {
        let pool = self.pool();
        self.ctx
            .run("staging.clear_promoted", async {
                for_each_chunk(
                    "staging.clear_promoted",
                    records,
                    self.ctx.chunk_size(),
                    |chunk| {
                        let (ids, types, payloads) = split_evaluated(chunk);
                        async move {
                            sqlx::query(
                                r#"
                                DELETE FROM staging s
                                 USING UNNEST($1::text[], $2::text[], $3::text[])
                                       AS v(id, type, data)
                                 WHERE s.id = v.id
                                   AND s.type = v.type
                                   AND s.data::text = v.data
                                   AND s.is_valid = TRUE
                                   AND s.to_delete = FALSE
                                "#,
                            )
                            .bind(ids)
                            .bind(types)
                            .bind(payloads)
                            .execute(pool)
                            .await
                            .map(|r| r.rows_affected())
                        }
                    },
                )
                .await
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn clear_deleted(&self, type_name: &str) -> Result<u64> {
        self.ctx
            .run("staging.clear_deleted", async {
                let res = sqlx::query("DELETE FROM staging WHERE type = $1 AND to_delete = TRUE")
                    .bind(type_name)
                    .execute(self.pool())
                    .await?;
                Ok(res.rows_affected())
            })
            .await
    }

    /// Remove processed delete markers for specific identities. Chunked.
    #[tracing::instrument(level = "debug", skip_all, fields(records = ids.len()))]
    pub async fn clear_deleted_ids<I: Identifiable + Sync>(
        &self,
        ids: &[I],
    ) -> Result<ChunkReport> {
        let pool = self.pool();
        self.ctx
            .run("staging.clear_deleted_ids", async {
                for_each_chunk("staging.clear_deleted_ids", ids, self.ctx.chunk_size(), |chunk| {
                    let (ids, types) = split_identities(chunk);
                    async move {
                        sqlx::query(
                            r#"
                            DELETE FROM staging
                             WHERE (id, type) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))
                               AND to_delete = TRUE
                            "#,
                        )
                        .bind(ids)
                        .bind(types)
                        .execute(pool)
                        .await
                        .map(|r| r.rows_affected())
                    }
                })
                .await
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn clear_all(&self) -> Result<u64> {
        self.ctx
            .run("staging.clear_all", async {
                let res = sqlx::query("DELETE FROM staging").execute(self.pool()).await?;
                tracing::warn!(rows = res.rows_affected(), "cleared all staging rows");
                Ok(res.rows_affected())
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn count(&self) -> Result<u64> {
        self.ctx
            .run("staging.count", async {
                let row = sqlx::query("SELECT count(*) AS n FROM staging")
                    .fetch_one(self.pool())
                    .await?;
                let n: i64 = row.try_get("n")?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn count_deleted(&self, type_name: &str) -> Result<u64> {
        self.ctx
            .run("staging.count_deleted", async {
                let row = sqlx::query(
                    "SELECT count(*) AS n FROM staging WHERE type = $1 AND to_delete = TRUE",
                )
                .bind(type_name)
                .fetch_one(self.pool())
                .await?;
                let n: i64 = row.try_get("n")?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub async fn exists(&self, id: &Identifier) -> Result<bool> {
        self.ctx
            .run("staging.exists", async {
                let row = sqlx::query(
                    "SELECT EXISTS (SELECT 1 FROM staging WHERE id = $1 AND type = $2) AS present",
                )
                .bind(&id.id)
                .bind(&id.type_name)
                .fetch_one(self.pool())
                .await?;
                Ok(row.try_get("present")?)
            })
            .await
    }
}

/// Dedupe and CSV-encode a batch. Payloads that fail to serialize, or that are not
/// JSON, are logged and left out.
fn encode_documents<T: Storeable>(records: &[T]) -> (CopyRows, usize) {
    let mut rows = CopyRows::default();
    let mut skipped = 0;
    for record in dedupe_last(records) {
        let id = record.identifier();
        let payload = match record.payload() {
            Ok(p) => p,
            Err(err) => {
                skipped += 1;
                tracing::warn!(
                    id = %id,
                    error = %err,
                    "skipping record: payload failed to serialize"
                );
                continue;
            }
        };
        if let Err(err) = serde_json::from_str::<serde::de::IgnoredAny>(&payload) {
            skipped += 1;
            tracing::warn!(id = %id, error = %err, "skipping record: payload is not JSON");
            continue;
        }
        rows.push_row(&[&id.id, &id.type_name, &payload]);
    }
    (rows, skipped)
}

pub(crate) fn split_identities<I: Identifiable>(items: &[I]) -> (Vec<String>, Vec<String>) {
    items
        .iter()
        .map(|i| {
            let id = i.identifier();
            (id.id.clone(), id.type_name.clone())
        })
        .unzip()
}

/// Identities plus the payload text each verdict was reached on.
fn split_evaluated(records: &[StagingRecord]) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut ids = Vec::with_capacity(records.len());
    let mut types = Vec::with_capacity(records.len());
    let mut payloads = Vec::with_capacity(records.len());
    for r in records {
        ids.push(r.identifier.id.clone());
        types.push(r.identifier.type_name.clone());
        payloads.push(r.payload.clone());
    }
    (ids, types, payloads)
}

pub(crate) fn staging_from_row(row: &PgRow) -> Result<StagingRecord> {
    Ok(StagingRecord {
        identifier: Identifier {
            id: row.try_get("id")?,
            type_name: row.try_get("type")?,
        },
        payload: row.try_get("data")?,
        validity: Validity::from_column(row.try_get("is_valid")?),
        to_delete: row.try_get("to_delete")?,
    })
}
