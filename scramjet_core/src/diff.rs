//! Orphan detection: which committed ids are no longer present upstream.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::{Identifiable, Identifier};

/// Guard failures that stop a reconciliation before anything is staged for deletion.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DiffRefusal {
    #[error("0 source records found for {type_name} - this would delete all {existing}")]
    EmptySource { type_name: String, existing: usize },

    #[error("0 records to compare on either side for {type_name}")]
    NothingToCompare { type_name: String },

    #[error("existing records are of type {found}, expected {expected}")]
    TypeMismatch { expected: String, found: String },
}

/// Items of `a` not in `b`, in `a`'s order, without repeats.
pub fn difference<'a>(a: &'a [String], b: &[String]) -> Vec<&'a str> {
    let exclude: HashSet<&str> = b.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    a.iter()
        .map(String::as_str)
        .filter(|id| !exclude.contains(id) && seen.insert(*id))
        .collect()
}

/// Compute the identities in `existing` that `source_ids` no longer lists.
///
/// Refuses when the source is empty but rows exist (that would wipe the type), when
/// both sides are empty, or when `existing` belongs to another type.
#[tracing::instrument(
    level = "debug",
    skip(source_ids, existing),
    fields(source = source_ids.len(), existing = existing.len())
)]
pub fn flag_deletes<I: Identifiable>(
    type_name: &str,
    source_ids: &[String],
    existing: &[I],
) -> std::result::Result<Vec<Identifier>, DiffRefusal> {
    match (source_ids.is_empty(), existing.is_empty()) {
        (true, true) => {
            return Err(DiffRefusal::NothingToCompare {
                type_name: type_name.to_string(),
            });
        }
        (true, false) => {
            return Err(DiffRefusal::EmptySource {
                type_name: type_name.to_string(),
                existing: existing.len(),
            });
        }
        _ => {}
    }

    if let Some(first) = existing.first() {
        let found = &first.identifier().type_name;
        if found != type_name {
            return Err(DiffRefusal::TypeMismatch {
                expected: type_name.to_string(),
                found: found.clone(),
            });
        }
    }

    let existing_ids: Vec<String> = existing
        .iter()
        .map(|e| e.identifier().id.clone())
        .collect();
    let extras: Vec<Identifier> = difference(&existing_ids, source_ids)
        .into_iter()
        .map(|id| Identifier::new(id, type_name))
        .collect();
    tracing::debug!(type_name, extras = extras.len(), "computed orphan set");
    Ok(extras)
}
