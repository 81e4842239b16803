//! Wire-shape helpers for cursor responses and error documents.
//!
//! The framing of commands is external to the core; these helpers encode
//! and decode the abstract command shapes the core consumes and produces.

use bson::{doc, Bson, Document};

use crate::error::{Error, ErrorCode, ErrorLabel, Result};
use crate::types::CursorId;

/// A cursor response: the `{ cursor: { id, ns, firstBatch|nextBatch } }`
/// shape returned to clients and consumed from shards.
#[derive(Debug, Clone, PartialEq)]
pub struct CursorResponse {
    /// Cursor id; zero means the stream is exhausted.
    pub id: CursorId,
    /// Full namespace string ("db.coll").
    pub ns: String,
    /// The documents in this batch.
    pub batch: Vec<Document>,
}

impl CursorResponse {
    /// Creates a cursor response.
    #[must_use]
    pub fn new(id: CursorId, ns: impl Into<String>, batch: Vec<Document>) -> Self {
        Self { id, ns: ns.into(), batch }
    }

    /// Encodes the response as a wire document.
    ///
    /// `first` selects the `firstBatch` key (initial command reply) over
    /// `nextBatch` (getMore reply).
    #[must_use]
    pub fn to_document(&self, first: bool) -> Document {
        let batch_key = if first { "firstBatch" } else { "nextBatch" };
        let batch: Vec<Bson> = self.batch.iter().cloned().map(Bson::Document).collect();
        let mut cursor = doc! {
            "id": self.id.as_wire(),
            "ns": self.ns.as_str(),
        };
        cursor.insert(batch_key, batch);
        doc! { "cursor": cursor, "ok": 1 }
    }

    /// Decodes a cursor response from a wire document.
    ///
    /// Accepts either `firstBatch` or `nextBatch`.
    ///
    /// # Errors
    ///
    /// Returns `FailedToParse` if the document does not carry the cursor
    /// shape, or the embedded error if `ok` is 0.
    pub fn from_document(reply: &Document) -> Result<Self> {
        if let Some(err) = error_from_document(reply) {
            return Err(err);
        }
        let cursor = reply
            .get("cursor")
            .and_then(Bson::as_document)
            .ok_or_else(|| Error::new(ErrorCode::FailedToParse, "reply missing cursor field"))?;

        let id = cursor
            .get("id")
            .and_then(Bson::as_i64)
            .ok_or_else(|| Error::new(ErrorCode::FailedToParse, "cursor id missing or not int64"))?;

        let ns = cursor
            .get("ns")
            .and_then(Bson::as_str)
            .ok_or_else(|| Error::new(ErrorCode::FailedToParse, "cursor ns missing"))?;

        let batch = cursor
            .get("firstBatch")
            .or_else(|| cursor.get("nextBatch"))
            .and_then(Bson::as_array)
            .ok_or_else(|| Error::new(ErrorCode::FailedToParse, "cursor batch missing"))?;

        let mut documents = Vec::with_capacity(batch.len());
        for entry in batch {
            let doc = entry.as_document().ok_or_else(|| {
                Error::new(ErrorCode::FailedToParse, "batch entry is not a document")
            })?;
            documents.push(doc.clone());
        }

        Ok(Self::new(CursorId::from_wire(id), ns, documents))
    }
}

/// Encodes an error as the wire error shape.
#[must_use]
pub fn error_to_document(error: &Error) -> Document {
    let mut reply = doc! {
        "ok": 0,
        "code": error.code().code(),
        "codeName": error.code().name(),
        "errmsg": error.message(),
    };
    if !error.labels().is_empty() {
        let labels: Vec<Bson> = error
            .labels()
            .iter()
            .map(|label| Bson::String(label.as_str().to_string()))
            .collect();
        reply.insert("errorLabels", labels);
    }
    reply
}

/// Decodes the wire error shape, if the reply carries one.
///
/// Returns `None` when `ok` is 1 (or absent), so callers can write
/// `if let Some(err) = error_from_document(&reply)`.
#[must_use]
pub fn error_from_document(reply: &Document) -> Option<Error> {
    let ok = reply.get("ok").map_or(1.0, |value| match value {
        Bson::Double(v) => *v,
        Bson::Int32(v) => f64::from(*v),
        Bson::Int64(v) => {
            // Shard replies encode ok as int64 in some paths.
            if *v == 0 { 0.0 } else { 1.0 }
        }
        _ => 1.0,
    });
    if ok != 0.0 {
        return None;
    }

    let code = reply
        .get("code")
        .and_then(Bson::as_i32)
        .and_then(ErrorCode::from_code)
        .unwrap_or(ErrorCode::FailedToParse);
    let message = reply
        .get("errmsg")
        .and_then(Bson::as_str)
        .unwrap_or("unknown error")
        .to_string();

    let mut error = Error::new(code, message);
    if let Some(labels) = reply.get("errorLabels").and_then(Bson::as_array) {
        for token in labels {
            if let Some(label) = token.as_str().and_then(ErrorLabel::from_str_opt) {
                error = error.with_label(label);
            }
        }
    }
    Some(error)
}

/// Encodes the reply to a `killCursors` command.
#[must_use]
pub fn kill_cursors_reply(
    killed: &[CursorId],
    not_found: &[CursorId],
    alive: &[CursorId],
) -> Document {
    let as_wire = |ids: &[CursorId]| -> Vec<Bson> {
        ids.iter().map(|id| Bson::Int64(id.as_wire())).collect()
    };
    doc! {
        "cursorsKilled": as_wire(killed),
        "cursorsNotFound": as_wire(not_found),
        "cursorsAlive": as_wire(alive),
        "ok": 1,
    }
}
