//! Set-based insert-or-merge shared by the staging and resource stores.
//!
//! One call is one transaction: a `TEMPORARY ... ON COMMIT DROP` table is created, the
//! batch is streamed in with `COPY ... FROM STDIN` (CSV), and a single
//! `INSERT ... SELECT ... ON CONFLICT (id, type) DO UPDATE` merges it into the
//! permanent table. Any failure drops the transaction, which rolls everything back.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgPool;
use sqlx::Row;

use crate::models::{Identifiable, Identifier};
use crate::{Error, Result};

const COPY_SEND_BYTES: usize = 1 << 20;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkStage {
    Begin,
    CreateTempTable,
    BulkLoad,
    Merge,
    Commit,
}

impl fmt::Display for BulkStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Begin => "begin",
            Self::CreateTempTable => "temp table creation",
            Self::BulkLoad => "bulk load",
            Self::Merge => "merge",
            Self::Commit => "commit",
        })
    }
}

/// CSV body for `COPY ... WITH (FORMAT csv)`. Every field is quoted, so an empty
/// string is never read back as NULL.
#[derive(Debug, Default)]
pub(crate) struct CopyRows {
    buf: Vec<u8>,
    rows: usize,
}

impl CopyRows {
    pub(crate) fn push_row(&mut self, fields: &[&str]) {
        for (i, field) in fields.iter().enumerate() {
            if i > 0 {
                self.buf.push(b',');
            }
            self.buf.push(b'"');
            for b in field.bytes() {
                if b == b'"' {
                    self.buf.push(b'"');
                }
                self.buf.push(b);
            }
            self.buf.push(b'"');
        }
        self.buf.push(b'\n');
        self.rows += 1;
    }

    pub(crate) fn rows(&self) -> usize {
        self.rows
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.rows == 0
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

/// Rows inserted and rows actually rewritten by one merge.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub(crate) struct MergeCounts {
    pub inserted: u64,
    pub updated: u64,
}

/// Describes one temp-table merge. `merge_sql` must be an `INSERT ... RETURNING
/// (xmax = 0) AS inserted` statement; it is wrapped to count inserts and updates.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BulkUpsert<'a> {
    pub table: &'static str,
    pub temp_table: &'static str,
    pub temp_columns: &'static str,
    pub columns: &'static str,
    pub merge_sql: &'a str,
}

impl BulkUpsert<'_> {
    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(table = self.table, rows = rows.rows())
    )]
    pub(crate) async fn execute(&self, pool: &PgPool, rows: &CopyRows) -> Result<MergeCounts> {
        if rows.is_empty() {
            return Ok(MergeCounts::default());
        }
        let table = self.table;
        let fail = |stage: BulkStage| move |e: sqlx::Error| Error::bulk(table, stage, e);

        let mut tx = pool.begin().await.map_err(fail(BulkStage::Begin))?;

        sqlx::query(&format!(
            "CREATE TEMPORARY TABLE {} ({}) ON COMMIT DROP",
            self.temp_table, self.temp_columns
        ))
        .execute(&mut *tx)
        .await
        .map_err(fail(BulkStage::CreateTempTable))?;

        let mut copy = tx
            .copy_in_raw(&format!(
                "COPY {} ({}) FROM STDIN WITH (FORMAT csv)",
                self.temp_table, self.columns
            ))
            .await
            .map_err(fail(BulkStage::BulkLoad))?;
        for part in rows.as_bytes().chunks(COPY_SEND_BYTES) {
            if let Err(e) = copy.send(part).await.map(|_| ()) {
                let _ = copy.abort("scramjet bulk load aborted").await;
                return Err(fail(BulkStage::BulkLoad)(e));
            }
        }
        let loaded = copy.finish().await.map_err(fail(BulkStage::BulkLoad))?;

        let wrapped = format!(
            "WITH merged AS ({}) \
             SELECT count(*) FILTER (WHERE inserted) AS inserted, \
                    count(*) FILTER (WHERE NOT inserted) AS updated \
               FROM merged",
            self.merge_sql
        );
        let row = sqlx::query(&wrapped)
            .fetch_one(&mut *tx)
            .await
            .map_err(fail(BulkStage::Merge))?;
        let inserted: i64 = row.try_get("inserted").map_err(fail(BulkStage::Merge))?;
        let updated: i64 = row.try_get("updated").map_err(fail(BulkStage::Merge))?;

        tx.commit().await.map_err(fail(BulkStage::Commit))?;

        tracing::debug!(table = self.table, loaded, inserted, updated, "bulk merge committed");
        Ok(MergeCounts {
            inserted: inserted.max(0) as u64,
            updated: updated.max(0) as u64,
        })
    }
}

/// Keep the last occurrence of each identity, in order of first appearance.
pub(crate) fn dedupe_last<T: Identifiable>(items: &[T]) -> Vec<&T> {
    let mut slots: HashMap<&Identifier, usize> = HashMap::with_capacity(items.len());
    let mut out: Vec<&T> = Vec::with_capacity(items.len());
    for item in items {
        match slots.get(item.identifier()) {
            Some(&i) => out[i] = item,
            None => {
                slots.insert(item.identifier(), out.len());
                out.push(item);
            }
        }
    }
    out
}

/// Outcome of a chunked set operation.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkReport {
    pub chunks: usize,
    pub affected: u64,
}

pub(crate) fn chunk_count(len: usize, chunk_size: usize) -> usize {
    len.div_ceil(chunk_size.max(1))
}

/// Run `op` once per chunk, in order. Each chunk is its own statement; the first
/// failure stops the loop and earlier chunks stay applied.
pub(crate) async fn for_each_chunk<'a, T, F, Fut>(
    operation: &'static str,
    items: &'a [T],
    chunk_size: usize,
    mut op: F,
) -> Result<ChunkReport>
where
    F: FnMut(&'a [T]) -> Fut,
    Fut: Future<Output = std::result::Result<u64, sqlx::Error>>,
{
    let chunks = chunk_count(items.len(), chunk_size);
    let mut report = ChunkReport::default();
    for (i, chunk) in items.chunks(chunk_size.max(1)).enumerate() {
        match op(chunk).await {
            Ok(n) => {
                report.chunks += 1;
                report.affected += n;
                tracing::debug!(operation, chunk = i + 1, chunks, rows = n, "chunk applied");
            }
            Err(source) => {
                tracing::warn!(operation, chunk = i + 1, chunks, error = %source, "chunk failed");
                return Err(Error::Chunk {
                    operation,
                    chunk: i + 1,
                    chunks,
                    source,
                });
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Stub;

    #[test]
    fn csv_quotes_every_field() {
        let mut rows = CopyRows::default();
        rows.push_row(&["1", "person", r#"{"name":"Ada, \"the\" first"}"#]);
        rows.push_row(&["", "person", "{}"]);
        assert_eq!(rows.rows(), 2);
        assert_eq!(
            std::str::from_utf8(rows.as_bytes()).expect("utf8"),
            "\"1\",\"person\",\"{\"\"name\"\":\"\"Ada, \\\"\"the\\\"\" first\"\"}\"\n\
             \"\",\"person\",\"{}\"\n"
        );
    }

    #[test]
    fn csv_keeps_newlines_inside_quotes() {
        let mut rows = CopyRows::default();
        rows.push_row(&["a", "b\nc"]);
        assert_eq!(rows.as_bytes(), b"\"a\",\"b\nc\"\n");
    }

    #[test]
    fn dedupe_keeps_last_value_in_first_position() {
        #[derive(Debug)]
        struct Doc(Identifier, &'static str);
        impl Identifiable for Doc {
            fn identifier(&self) -> &Identifier {
                &self.0
            }
        }
        let docs = vec![
            Doc(Identifier::new("1", "person"), "old"),
            Doc(Identifier::new("2", "person"), "two"),
            Doc(Identifier::new("1", "person"), "new"),
            Doc(Identifier::new("1", "place"), "other type"),
        ];
        let out = dedupe_last(&docs);
        let payloads: Vec<_> = out.iter().map(|d| d.1).collect();
        assert_eq!(payloads, vec!["new", "two", "other type"]);
    }

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(chunk_count(0, 500), 0);
        assert_eq!(chunk_count(500, 500), 1);
        assert_eq!(chunk_count(1_200, 500), 3);
        assert_eq!(chunk_count(3, 0), 3);
    }

    #[tokio::test]
    async fn chunks_are_bounded_and_ordered() {
        let ids: Vec<Stub> = (0..1_200).map(|i| Stub::new(i.to_string(), "t")).collect();
        let mut sizes = Vec::new();
        let report = for_each_chunk("mark", &ids, 500, |chunk| {
            sizes.push(chunk.len());
            let n = chunk.len() as u64;
            async move { Ok(n) }
        })
        .await
        .expect("chunks");
        assert_eq!(sizes, vec![500, 500, 200]);
        assert_eq!(report, ChunkReport { chunks: 3, affected: 1_200 });
    }

    #[tokio::test]
    async fn failing_chunk_stops_remaining() {
        let ids: Vec<Stub> = (0..7).map(|i| Stub::new(i.to_string(), "t")).collect();
        let mut calls = 0;
        let err = for_each_chunk("delete", &ids, 3, |_chunk| {
            calls += 1;
            let fail = calls == 2;
            async move {
                if fail {
                    Err(sqlx::Error::PoolTimedOut)
                } else {
                    Ok(3)
                }
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls, 2);
        assert!(matches!(
            err,
            Error::Chunk {
                operation: "delete",
                chunk: 2,
                chunks: 3,
                ..
            }
        ));
    }
}
