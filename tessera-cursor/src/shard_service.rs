//! The shard command seam.
//!
//! Everything the core sends to a shard goes through [`ShardService`].
//! Production wires this to the real connection pool; tests implement it
//! with scripted in-memory shards.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tessera_core::{CursorId, Result, ShardId};

/// Transport seam for running one command on one shard.
///
/// Implementations must be `Send + Sync` for use across async tasks. A
/// call resolves to the shard's reply document; transport-level failures
/// surface as errors with a network error code.
#[async_trait]
pub trait ShardService: Send + Sync + 'static {
    /// Runs a command on the given shard and returns its reply.
    ///
    /// # Errors
    ///
    /// Returns a network-class error if the shard cannot be reached, or
    /// the decoded shard error if the reply carries `ok: 0`.
    async fn run_command(&self, shard: &ShardId, command: Document) -> Result<Document>;
}

/// Builds a `getMore` command for a cursor on the given collection.
#[must_use]
pub fn get_more_command(
    cursor_id: CursorId,
    collection: &str,
    batch_size: Option<u32>,
    max_time_ms: Option<u64>,
) -> Document {
    let mut command = doc! {
        "getMore": cursor_id.as_wire(),
        "collection": collection,
    };
    if let Some(batch_size) = batch_size {
        command.insert("batchSize", i64::from(batch_size));
    }
    if let Some(max_time_ms) = max_time_ms {
        command.insert("maxTimeMS", Bson::Int64(i64::try_from(max_time_ms).unwrap_or(i64::MAX)));
    }
    command
}

/// Builds a `killCursors` command for cursors on the given collection.
#[must_use]
pub fn kill_cursors_command(collection: &str, cursor_ids: &[CursorId]) -> Document {
    let ids: Vec<Bson> = cursor_ids.iter().map(|id| Bson::Int64(id.as_wire())).collect();
    doc! {
        "killCursors": collection,
        "cursors": ids,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_more_shape() {
        let command = get_more_command(CursorId::new(7), "coll", Some(50), Some(1000));
        assert_eq!(command.get("getMore").and_then(Bson::as_i64), Some(7));
        assert_eq!(command.get("collection").and_then(Bson::as_str), Some("coll"));
        assert_eq!(command.get("batchSize").and_then(Bson::as_i64), Some(50));
        assert_eq!(command.get("maxTimeMS").and_then(Bson::as_i64), Some(1000));
    }

    #[test]
    fn test_kill_cursors_shape() {
        let command = kill_cursors_command("coll", &[CursorId::new(1), CursorId::new(2)]);
        let ids = command.get("cursors").and_then(Bson::as_array).unwrap();
        assert_eq!(ids.len(), 2);
    }
}
