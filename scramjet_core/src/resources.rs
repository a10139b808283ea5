use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Postgres, QueryBuilder, Row};

use crate::bulk::{BulkUpsert, ChunkReport, CopyRows, dedupe_last, for_each_chunk};
use crate::context::StoreContext;
use crate::filter::{Filter, FilterTarget, push_filter};
use crate::models::{Identifiable, Identifier, ResourceRecord, Storeable};
use crate::staging::split_identities;
use crate::{Error, Result};

const RESOURCE_COLUMNS: &str =
    "id, type, hash, data::text AS data, data_indexed, created_at, updated_at";

/// Rows whose hash is unchanged are not touched, so `updated_at` only moves on a real change.
const UPSERT_MERGE: &str = r#"
    INSERT INTO resources (id, type, hash, data, data_indexed, created_at, updated_at)
    SELECT id, type, hash, data, data::jsonb, now(), now() FROM tmp_resources_upsert
    ON CONFLICT (id, type) DO UPDATE
       SET hash = EXCLUDED.hash,
           data = EXCLUDED.data,
           data_indexed = EXCLUDED.data_indexed,
           updated_at = now()
     WHERE resources.hash IS DISTINCT FROM EXCLUDED.hash
    RETURNING (xmax = 0) AS inserted
"#;

const UPSERT: BulkUpsert<'static> = BulkUpsert {
    table: "resources",
    temp_table: "tmp_resources_upsert",
    temp_columns: "id TEXT NOT NULL, type TEXT NOT NULL, hash TEXT NOT NULL, data JSON NOT NULL",
    columns: "id, type, hash, data",
    merge_sql: UPSERT_MERGE,
};

/// Lowercase hex SHA-256 of the canonical payload text.
///
/// Computed over the stored bytes, so two documents that differ only in key order hash differently.
pub fn content_hash(payload: &str) -> String {
    let mut h = Sha256::new();
    h.update(payload.as_bytes());
    let out = h.finalize();
    let mut s = String::with_capacity(out.len() * 2);
    for b in out {
        use std::fmt::Write as _;
        let _ = write!(&mut s, "{:02x}", b);
    }
    s
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertSummary {
    pub inserted: u64,
    pub updated: u64,
    /// Present with an identical hash; left untouched.
    pub unchanged: u64,
    /// Dropped before loading: unserializable, or not representable as `jsonb`.
    pub skipped: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub summary: UpsertSummary,
    /// Identities left out of the load, in input order.
    pub skipped: Vec<Identifier>,
}

/// Committed, canonical documents keyed by `(id, type)`.
#[derive(Debug, Clone)]
pub struct ResourceStore {
    ctx: StoreContext,
}

impl ResourceStore {
    pub fn new(ctx: StoreContext) -> Self {
        Self { ctx }
    }

    fn pool(&self) -> &PgPool {
        self.ctx.pool()
    }

    /// Insert new documents, rewrite changed ones, leave identical ones alone.
    pub async fn upsert<T: Storeable + Sync>(&self, records: &[T]) -> Result<UpsertSummary> {
        Ok(self.upsert_detailed(records).await?.summary)
    }

    /// [`ResourceStore::upsert`], also naming the records that were skipped.
    #[tracing::instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub async fn upsert_detailed<T: Storeable + Sync>(
        &self,
        records: &[T],
    ) -> Result<UpsertOutcome> {
        self.ctx
            .run("resources.upsert", async {
                let (rows, skipped) = encode_resources(records);
                let loaded = rows.rows() as u64;
                let counts = UPSERT.execute(self.pool(), &rows).await?;
                let summary = UpsertSummary {
                    inserted: counts.inserted,
                    updated: counts.updated,
                    unchanged: loaded.saturating_sub(counts.inserted + counts.updated),
                    skipped: skipped.len(),
                };
                tracing::info!(
                    inserted = summary.inserted,
                    updated = summary.updated,
                    unchanged = summary.unchanged,
                    skipped = summary.skipped,
                    "upserted resources"
                );
                Ok(UpsertOutcome { summary, skipped })
            })
            .await
    }

    /// All resources of a type, optionally narrowed by a filter over the queryable form.
    #[tracing::instrument(level = "debug", skip(self, filter))]
    pub async fn query(
        &self,
        type_name: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<ResourceRecord>> {
        self.ctx
            .run("resources.query", async {
                let mut qb = QueryBuilder::<Postgres>::new(format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE type = "
                ));
                qb.push_bind(type_name.to_string());
                if let Some(filter) = filter {
                    qb.push(" AND ");
                    push_filter(&mut qb, filter, FilterTarget::Resources)?;
                }
                qb.push(" ORDER BY id");
                let rows = qb.build().fetch_all(self.pool()).await?;
                rows.iter().map(resource_from_row).collect()
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn query_limited(&self, type_name: &str, limit: u32) -> Result<Vec<ResourceRecord>> {
        self.ctx
            .run("resources.query_limited", async {
                let rows = sqlx::query(&format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE type = $1 ORDER BY id LIMIT $2"
                ))
                .bind(type_name)
                .bind(i64::from(limit))
                .fetch_all(self.pool())
                .await?;
                rows.iter().map(resource_from_row).collect()
            })
            .await
    }

    /// Identities only; what reconciliation compares against.
    #[tracing::instrument(level = "debug", skip(self, filter))]
    pub async fn identities(
        &self,
        type_name: &str,
        filter: Option<&Filter>,
    ) -> Result<Vec<Identifier>> {
        self.ctx
            .run("resources.identities", async {
                let mut qb =
                    QueryBuilder::<Postgres>::new("SELECT id, type FROM resources WHERE type = ");
                qb.push_bind(type_name.to_string());
                if let Some(filter) = filter {
                    qb.push(" AND ");
                    push_filter(&mut qb, filter, FilterTarget::Resources)?;
                }
                qb.push(" ORDER BY id");
                let rows = qb.build().fetch_all(self.pool()).await?;
                rows.iter()
                    .map(|row| -> Result<Identifier> {
                        Ok(Identifier {
                            id: row.try_get("id")?,
                            type_name: row.try_get("type")?,
                        })
                    })
                    .collect()
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = %id))]
    pub async fn get(&self, id: &Identifier) -> Result<Option<ResourceRecord>> {
        self.ctx
            .run("resources.get", async {
                let row = sqlx::query(&format!(
                    "SELECT {RESOURCE_COLUMNS} FROM resources WHERE id = $1 AND type = $2"
                ))
                .bind(&id.id)
                .bind(&id.type_name)
                .fetch_optional(self.pool())
                .await?;
                row.as_ref().map(resource_from_row).transpose()
            })
            .await
    }

    /// Delete by identity in chunks. A failing chunk stops the call; earlier chunks stay deleted.
    #[tracing::instrument(level = "debug", skip_all, fields(records = ids.len()))]
    pub async fn delete<I: Identifiable + Sync>(&self, ids: &[I]) -> Result<ChunkReport> {
        let pool = self.pool();
        self.ctx
            .run("resources.delete", async {
                let report =
                    for_each_chunk("resources.delete", ids, self.ctx.chunk_size(), |chunk| {
                        let (ids, types) = split_identities(chunk);
                        async move {
                            sqlx::query(
                                r#"
                                DELETE FROM resources
                                 WHERE (id, type) IN (SELECT * FROM UNNEST($1::text[], $2::text[]))
                                "#,
                            )
                            .bind(ids)
                            .bind(types)
                            .execute(pool)
                            .await
                            .map(|r| r.rows_affected())
                        }
                    })
                    .await?;
                tracing::info!(
                    deleted = report.affected,
                    chunks = report.chunks,
                    "deleted resources"
                );
                Ok(report)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn count(&self, type_name: &str) -> Result<u64> {
        self.ctx
            .run("resources.count", async {
                let row = sqlx::query("SELECT count(*) AS n FROM resources WHERE type = $1")
                    .bind(type_name)
                    .fetch_one(self.pool())
                    .await?;
                let n: i64 = row.try_get("n")?;
                Ok(n.max(0) as u64)
            })
            .await
    }

    /// Most recent `updated_at` for the type; `None` when the type has no resources.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn max_updated_at(&self, type_name: &str) -> Result<Option<DateTime<Utc>>> {
        self.ctx
            .run("resources.max_updated_at", async {
                let row = sqlx::query(
                    "SELECT max(updated_at) AS latest FROM resources WHERE type = $1",
                )
                .bind(type_name)
                .fetch_one(self.pool())
                .await?;
                Ok(row.try_get("latest")?)
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn clear_type(&self, type_name: &str) -> Result<u64> {
        self.ctx
            .run("resources.clear_type", async {
                let res = sqlx::query("DELETE FROM resources WHERE type = $1")
                    .bind(type_name)
                    .execute(self.pool())
                    .await?;
                Ok(res.rows_affected())
            })
            .await
    }

    #[tracing::instrument(level = "debug", skip_all)]
    pub async fn clear_all(&self) -> Result<u64> {
        self.ctx
            .run("resources.clear_all", async {
                let res = sqlx::query("DELETE FROM resources").execute(self.pool()).await?;
                tracing::warn!(rows = res.rows_affected(), "cleared all resources");
                Ok(res.rows_affected())
            })
            .await
    }
}

/// Dedupe, hash and CSV-encode. Records whose payload cannot be stored as `jsonb`
/// (unparseable, or holding a NUL character) are logged and left out.
fn encode_resources<T: Storeable>(records: &[T]) -> (CopyRows, Vec<Identifier>) {
    let mut rows = CopyRows::default();
    let mut skipped = Vec::new();
    for record in dedupe_last(records) {
        let id = record.identifier();
        let payload = match record.payload() {
            Ok(p) => p,
            Err(err) => {
                tracing::warn!(
                    id = %id,
                    error = %err,
                    "skipping resource: payload failed to serialize"
                );
                skipped.push(id.clone());
                continue;
            }
        };
        if let Err(reason) = check_indexable(&payload) {
            tracing::warn!(id = %id, reason = %reason, "skipping resource: malformed payload");
            skipped.push(id.clone());
            continue;
        }
        let hash = content_hash(&payload);
        rows.push_row(&[&id.id, &id.type_name, &hash, &payload]);
    }
    (rows, skipped)
}

fn check_indexable(payload: &str) -> std::result::Result<(), String> {
    let value: serde_json::Value = serde_json::from_str(payload).map_err(|e| e.to_string())?;
    if holds_nul(&value) {
        return Err("jsonb cannot store a NUL character".to_string());
    }
    Ok(())
}

fn holds_nul(value: &serde_json::Value) -> bool {
    use serde_json::Value;
    match value {
        Value::String(s) => s.contains('\0'),
        Value::Array(items) => items.iter().any(holds_nul),
        Value::Object(map) => map.iter().any(|(k, v)| k.contains('\0') || holds_nul(v)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

pub(crate) fn resource_from_row(row: &PgRow) -> Result<ResourceRecord> {
    let indexed: sqlx::types::Json<serde_json::Value> = row.try_get("data_indexed")?;
    let record = ResourceRecord {
        identifier: Identifier {
            id: row.try_get("id")?,
            type_name: row.try_get("type")?,
        },
        hash: row.try_get("hash")?,
        payload: row.try_get("data")?,
        payload_indexed: indexed.0,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    };
    if record.hash.is_empty() {
        return Err(Error::BackendMessage(format!(
            "resource {} has an empty hash",
            record.identifier
        )));
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::SubFilter;
    use crate::models::{Packet, StagingRecord, Stub};
    use crate::test_support::{TestInfra, unique_type};

    #[test]
    fn hash_is_deterministic_and_order_sensitive() {
        let a = content_hash(r#"{"name":"Ada","age":36}"#);
        assert_eq!(a, content_hash(r#"{"name":"Ada","age":36}"#));
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_ne!(a, content_hash(r#"{"age":36,"name":"Ada"}"#));
        assert_eq!(
            content_hash(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn malformed_payloads_are_skipped() {
        let docs = vec![
            StagingRecord::new(Identifier::new("1", "t"), r#"{"ok":true}"#),
            StagingRecord::new(Identifier::new("2", "t"), r#"{"bad":"\u0000"}"#),
            StagingRecord::new(Identifier::new("3", "t"), "{"),
            StagingRecord::new(Identifier::new("4", "t"), r#"{"path":"C:\\u0000dir"}"#),
        ];
        let (rows, skipped) = encode_resources(&docs);
        assert_eq!(rows.rows(), 2);
        assert_eq!(skipped, vec![Identifier::new("2", "t"), Identifier::new("3", "t")]);
    }

    #[test]
    fn nul_is_found_in_keys_and_nested_values() {
        let docs = vec![
            StagingRecord::new(Identifier::new("path", "t"), r#"{"path":["C:\\u0000dir"]}"#),
            StagingRecord::new(Identifier::new("key", "t"), r#"{"a\u0000":1}"#),
            StagingRecord::new(Identifier::new("deep", "t"), r#"{"xs":[{"s":"\u0000"}]}"#),
        ];
        let (rows, skipped) = encode_resources(&docs);
        assert_eq!(rows.rows(), 1);
        assert_eq!(skipped, vec![Identifier::new("key", "t"), Identifier::new("deep", "t")]);
    }

    #[tokio::test]
    async fn upsert_is_hash_gated() {
        let Some(infra) = TestInfra::from_env().await else {
            return;
        };
        let store = ResourceStore::new(infra.ctx());
        let t = unique_type("resource");
        let doc = |id: &str, body: &str| StagingRecord::new(Identifier::new(id, &t), body);

        let first = store
            .upsert(&[doc("1", r#"{"v":1}"#), doc("2", r#"{"v":2}"#)])
            .await
            .expect("insert");
        assert_eq!(first, UpsertSummary { inserted: 2, ..Default::default() });

        let before = store
            .get(&Identifier::new("1", &t))
            .await
            .expect("get")
            .expect("row");
        assert_eq!(before.hash, content_hash(r#"{"v":1}"#));
        assert_eq!(before.payload_indexed, serde_json::json!({"v": 1}));

        let again = store
            .upsert(&[doc("1", r#"{"v":1}"#), doc("2", r#"{"v":20}"#)])
            .await
            .expect("again");
        assert_eq!(
            again,
            UpsertSummary {
                inserted: 0,
                updated: 1,
                unchanged: 1,
                skipped: 0
            }
        );

        let after = store
            .get(&Identifier::new("1", &t))
            .await
            .expect("get")
            .expect("row");
        assert_eq!(after.updated_at, before.updated_at);
        let changed = store
            .get(&Identifier::new("2", &t))
            .await
            .expect("get")
            .expect("row");
        assert!(changed.updated_at > changed.created_at);

        assert_eq!(store.count(&t).await.expect("count"), 2);
        assert_eq!(
            store.max_updated_at(&t).await.expect("max"),
            Some(changed.updated_at)
        );
        assert_eq!(store.clear_type(&t).await.expect("clear"), 2);
        assert_eq!(store.max_updated_at(&t).await.expect("max"), None);
    }

    #[tokio::test]
    async fn query_filters_on_indexed_payload() {
        let Some(infra) = TestInfra::from_env().await else {
            return;
        };
        let store = ResourceStore::new(infra.ctx());
        let t = unique_type("city");
        let docs: Vec<_> = [("1", "Oslo"), ("2", "Bergen"), ("3", "Oslo")]
            .into_iter()
            .map(|(id, city)| {
                Packet::new(Identifier::new(id, &t), serde_json::json!({"city": city}))
            })
            .collect();
        store.upsert(&docs).await.expect("upsert");

        let oslo = store
            .query(&t, Some(&Filter::eq("city", "Oslo")))
            .await
            .expect("query");
        assert_eq!(oslo.len(), 2);
        let ids = store
            .identities(&t, Some(&Filter::any_of("city", ["Bergen"])))
            .await
            .expect("ids");
        assert_eq!(ids, vec![Identifier::new("2", &t)]);
        assert_eq!(store.query_limited(&t, 1).await.expect("limited").len(), 1);

        let report = store
            .delete(&[Stub::new("1", &t), Stub::new("3", &t), Stub::new("missing", &t)])
            .await
            .expect("delete");
        assert_eq!(report.affected, 2);
        assert_eq!(store.query(&t, None).await.expect("rest").len(), 1);
        store.clear_type(&t).await.expect("cleanup");
    }

    #[tokio::test]
    async fn sub_filter_selects_resources_through_other_type() {
        let Some(infra) = TestInfra::from_env().await else {
            return;
        };
        let store = ResourceStore::new(infra.ctx());
        let dept = unique_type("department");
        let emp = unique_type("employee");
        store
            .upsert(&[
                StagingRecord::new(Identifier::new("d1", &dept), r#"{"id":"d1","name":"Sales"}"#),
                StagingRecord::new(Identifier::new("d2", &dept), r#"{"id":"d2","name":"Ops"}"#),
            ])
            .await
            .expect("departments");
        store
            .upsert(&[
                StagingRecord::new(Identifier::new("e1", &emp), r#"{"dept":"d1"}"#),
                StagingRecord::new(Identifier::new("e2", &emp), r#"{"dept":"d2"}"#),
                StagingRecord::new(Identifier::new("e3", &emp), r#"{"dept":"d1"}"#),
            ])
            .await
            .expect("employees");

        let in_dept = |name: &str| {
            Filter::correlated(
                "dept",
                SubFilter {
                    type_name: dept.clone(),
                    match_field: "id".to_string(),
                    parent_match: "name".to_string(),
                    value: name.to_string(),
                },
            )
        };
        let ids = store
            .identities(&emp, Some(&in_dept("Sales")))
            .await
            .expect("sales");
        assert_eq!(ids, vec![Identifier::new("e1", &emp), Identifier::new("e3", &emp)]);

        assert!(
            store
                .identities(&emp, Some(&in_dept("Legal")))
                .await
                .expect("legal")
                .is_empty()
        );
        assert!(
            store
                .query(&emp, Some(&Filter::any_of("dept", Vec::<String>::new())))
                .await
                .expect("empty in")
                .is_empty()
        );

        store.clear_type(&emp).await.expect("cleanup");
        store.clear_type(&dept).await.expect("cleanup");
    }
}
