//! Routing information for one namespace.

use tessera_core::{Collation, Epoch, Namespace, ShardId, ShardVersion};

use crate::chunk_map::ChunkMap;

/// The routing view of one namespace at a particular epoch.
///
/// A present chunk map means the collection is sharded; an absent one
/// means the collection lives entirely on the database's primary shard.
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingInfo {
    /// The namespace this entry describes.
    namespace: Namespace,
    /// Collection UUID, if the catalog knows one.
    uuid: Option<String>,
    /// Routing generation observed at fetch time.
    epoch: Epoch,
    /// Present iff the collection is sharded.
    chunk_map: Option<ChunkMap>,
    /// The collection's default collation.
    default_collation: Collation,
    /// The shard owning the database's unsharded collections.
    primary_shard: ShardId,
}

impl RoutingInfo {
    /// Creates routing info for an unsharded collection.
    #[must_use]
    pub fn unsharded(namespace: Namespace, epoch: Epoch, primary_shard: ShardId) -> Self {
        Self {
            namespace,
            uuid: None,
            epoch,
            chunk_map: None,
            default_collation: Collation::Simple,
            primary_shard,
        }
    }

    /// Creates routing info for a sharded collection.
    #[must_use]
    pub fn sharded(
        namespace: Namespace,
        epoch: Epoch,
        primary_shard: ShardId,
        chunk_map: ChunkMap,
    ) -> Self {
        Self {
            namespace,
            uuid: None,
            epoch,
            chunk_map: Some(chunk_map),
            default_collation: Collation::Simple,
            primary_shard,
        }
    }

    /// Sets the collection UUID.
    #[must_use]
    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    /// Sets the collection's default collation.
    #[must_use]
    pub fn with_default_collation(mut self, collation: Collation) -> Self {
        self.default_collation = collation;
        self
    }

    /// Returns the namespace.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Returns the collection UUID, if known.
    #[must_use]
    pub fn uuid(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Returns the epoch observed at fetch time.
    ///
    /// Callers must thread this epoch into shard-directed commands.
    #[must_use]
    pub const fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Returns the chunk map for sharded collections.
    #[must_use]
    pub const fn chunk_map(&self) -> Option<&ChunkMap> {
        self.chunk_map.as_ref()
    }

    /// Returns true if the collection is sharded.
    #[must_use]
    pub const fn is_sharded(&self) -> bool {
        self.chunk_map.is_some()
    }

    /// Returns the default collation.
    #[must_use]
    pub const fn default_collation(&self) -> &Collation {
        &self.default_collation
    }

    /// Returns the primary shard of the owning database.
    #[must_use]
    pub const fn primary_shard(&self) -> &ShardId {
        &self.primary_shard
    }

    /// Returns the shard version to attach to commands for this namespace.
    #[must_use]
    pub const fn shard_version(&self) -> ShardVersion {
        if self.chunk_map.is_some() {
            ShardVersion::from_epoch(self.epoch)
        } else {
            ShardVersion::Unsharded
        }
    }
}
