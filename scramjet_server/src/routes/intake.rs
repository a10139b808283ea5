use std::borrow::Cow;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::Path;
use axum::routing::post;
use axum::{Extension, Json};
use scramjet_core::{Identifiable, Identifier, StageSummary, Storeable};
use serde::Deserialize;
use serde_json::value::RawValue;

use crate::error::ApiError;
use crate::routes::checked_type;
use crate::server::AppState;

#[tracing::instrument(level = "debug", skip_all)]
pub fn router() -> axum::Router {
    axum::Router::new()
        .route("/intake", post(intake_mixed))
        .route("/intake/{type}", post(intake_typed))
}

/// A staged document whose payload bytes are kept exactly as received.
#[derive(Debug)]
pub struct RawDocument {
    pub identifier: Identifier,
    pub data: Box<RawValue>,
}

impl Identifiable for RawDocument {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }
}

impl Storeable for RawDocument {
    fn payload(&self) -> serde_json::Result<Cow<'_, str>> {
        Ok(Cow::Borrowed(self.data.get()))
    }
}

/// `{"id": "...", "type": "...", "data": {...}}`
#[derive(Debug, Deserialize)]
struct Envelope {
    id: String,
    #[serde(rename = "type")]
    type_name: String,
    data: Box<RawValue>,
}

#[derive(Debug, Deserialize)]
struct IdField {
    #[serde(default)]
    id: Option<serde_json::Value>,
}

pub(crate) fn parse_envelopes(body: &[u8]) -> Result<Vec<RawDocument>, ApiError> {
    let envelopes: Vec<Envelope> = serde_json::from_slice(body).map_err(|e| {
        ApiError::InvalidInput(format!("expected an array of {{id, type, data}}: {e}"))
    })?;
    envelopes
        .into_iter()
        .enumerate()
        .map(|(i, env)| {
            if env.id.trim().is_empty() {
                return Err(ApiError::InvalidInput(format!("document {i} has an empty id")));
            }
            let type_name = checked_type(&env.type_name)?.to_string();
            Ok(RawDocument {
                identifier: Identifier::new(env.id, type_name),
                data: env.data,
            })
        })
        .collect()
}

/// Each document must carry its own `"id"` (string or number).
pub(crate) fn parse_typed(type_name: &str, body: &[u8]) -> Result<Vec<RawDocument>, ApiError> {
    let docs: Vec<Box<RawValue>> = serde_json::from_slice(body)
        .map_err(|e| ApiError::InvalidInput(format!("expected an array of documents: {e}")))?;
    docs.into_iter()
        .enumerate()
        .map(|(i, data)| {
            let head: IdField = serde_json::from_str(data.get())
                .map_err(|_| ApiError::InvalidInput(format!("document {i} is not an object")))?;
            let id = match head.id {
                Some(serde_json::Value::String(s)) if !s.trim().is_empty() => s,
                Some(serde_json::Value::Number(n)) => n.to_string(),
                _ => {
                    return Err(ApiError::InvalidInput(format!(
                        "document {i} has no usable \"id\""
                    )));
                }
            };
            Ok(RawDocument {
                identifier: Identifier::new(id, type_name),
                data,
            })
        })
        .collect()
}

#[tracing::instrument(level = "info", skip_all)]
async fn intake_mixed(
    Extension(state): Extension<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<StageSummary>, ApiError> {
    let docs = parse_envelopes(&body)?;
    let summary = state.engine.staging().put(&docs).await?;
    Ok(Json(summary))
}

#[tracing::instrument(level = "info", skip_all, fields(type_name = %type_name))]
async fn intake_typed(
    Extension(state): Extension<Arc<AppState>>,
    Path(type_name): Path<String>,
    body: Bytes,
) -> Result<Json<StageSummary>, ApiError> {
    let type_name = checked_type(&type_name)?;
    let docs = parse_typed(type_name, &body)?;
    let summary = state.engine.staging().put(&docs).await?;
    Ok(Json(summary))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelopes_keep_payload_bytes() {
        let body = br#"[{"id":"1","type":"person","data":{"name": "Rob",  "id":"1"}}]"#;
        let docs = parse_envelopes(body).expect("parse");
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].identifier, Identifier::new("1", "person"));
        assert_eq!(
            docs[0].payload().expect("payload"),
            r#"{"name": "Rob",  "id":"1"}"#
        );
    }

    #[test]
    fn envelopes_require_id_and_type() {
        assert!(parse_envelopes(br#"[{"id":"","type":"person","data":{}}]"#).is_err());
        assert!(parse_envelopes(br#"[{"id":"1","type":" ","data":{}}]"#).is_err());
        assert!(parse_envelopes(br#"{"id":"1"}"#).is_err());
    }

    #[test]
    fn typed_documents_take_their_own_id() {
        let body = br#"[{"id":"0000001","name":"Rob"},{"id":7,"name":"Robert"}]"#;
        let docs = parse_typed("person", body).expect("parse");
        let ids: Vec<_> = docs.iter().map(|d| d.identifier.id.as_str()).collect();
        assert_eq!(ids, vec!["0000001", "7"]);
        assert!(docs.iter().all(|d| d.identifier.type_name == "person"));
        assert_eq!(
            docs[1].payload().expect("payload"),
            r#"{"id":7,"name":"Robert"}"#
        );
    }

    #[test]
    fn typed_documents_without_id_are_rejected() {
        assert!(parse_typed("person", br#"[{"name":"Rob"}]"#).is_err());
        assert!(parse_typed("person", br#"[{"id":null}]"#).is_err());
        assert!(parse_typed("person", br#"["just a string"]"#).is_err());
    }
}
