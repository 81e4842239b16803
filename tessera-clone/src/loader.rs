//! The local write side of a clone.

use async_trait::async_trait;
use bson::Document;

use crate::error::LoaderError;

/// Receives the cloned collection: creation, bulk inserts, and the final
/// index materialization.
///
/// `init` is called exactly once before any insert. Afterwards exactly one
/// of `commit` or `abort` is called; `abort` may also arrive before `init`
/// when the clone fails early, and implementations must tolerate that.
#[async_trait]
pub trait BulkLoader: Send + Sync {
    /// Creates the local collection with the given options and remembers
    /// the index specs for `commit`. The `_id` index is passed separately
    /// since it is applied ahead of the data.
    async fn init(
        &self,
        options: &Document,
        id_index: Option<&Document>,
        secondary_indexes: &[Document],
    ) -> Result<(), LoaderError>;

    /// Inserts one drained batch.
    async fn insert_documents(&self, documents: Vec<Document>) -> Result<(), LoaderError>;

    /// Atomically materializes the remembered indexes and finishes the
    /// collection.
    async fn commit(&self) -> Result<(), LoaderError>;

    /// Discards everything written so far. Idempotent.
    async fn abort(&self);
}
