//! Chunk map - mapping of shard-key ranges to owning shards.
//!
//! A sharded collection's key space is partitioned into contiguous chunks;
//! each chunk lives on exactly one shard. The chunk map answers "which
//! shards could hold documents matching these key bounds".

use std::cmp::Ordering;
use std::collections::BTreeSet;

use bson::{Bson, Document};
use tessera_core::{compare_values, Collation, ShardId};

/// Maximum number of chunks in one collection's map.
pub const CHUNKS_MAX: usize = 1_000_000;

/// One contiguous shard-key range and its owner.
///
/// The range is min-inclusive, max-exclusive. `MinKey`/`MaxKey` endpoints
/// express the open ends of the key space.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// Inclusive lower bound of the shard-key range.
    pub min: Bson,
    /// Exclusive upper bound of the shard-key range.
    pub max: Bson,
    /// The shard that owns this chunk.
    pub shard: ShardId,
}

impl Chunk {
    /// Creates a chunk.
    ///
    /// # Panics
    ///
    /// Panics if `min` is not strictly below `max`.
    #[must_use]
    pub fn new(min: Bson, max: Bson, shard: ShardId) -> Self {
        assert!(
            compare_values(&min, &max) == Ordering::Less,
            "chunk min must be below max"
        );
        Self { min, max, shard }
    }

    /// Returns true if the chunk's range intersects the given inclusive
    /// key bounds.
    #[must_use]
    pub fn intersects(&self, bounds: &KeyBounds) -> bool {
        // Empty intersection iff chunk.max <= bounds.min or bounds.max < chunk.min.
        compare_values(&self.max, &bounds.min) == Ordering::Greater
            && compare_values(&bounds.max, &self.min) != Ordering::Less
    }
}

/// Inclusive bounds on the shard key derived from a query predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct KeyBounds {
    /// Inclusive lower bound.
    pub min: Bson,
    /// Inclusive upper bound.
    pub max: Bson,
}

impl KeyBounds {
    /// Bounds matching exactly one key value.
    #[must_use]
    pub fn point(value: Bson) -> Self {
        Self { min: value.clone(), max: value }
    }
}

/// The chunk map of one sharded collection.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkMap {
    /// The single field the collection is sharded on.
    key_field: String,
    /// Chunks ordered by range minimum, pairwise disjoint.
    chunks: Vec<Chunk>,
}

impl ChunkMap {
    /// Creates a chunk map from a set of chunks.
    ///
    /// # Panics
    ///
    /// Panics if there are no chunks, too many chunks, or the ranges are
    /// not disjoint once sorted.
    #[must_use]
    pub fn new(key_field: impl Into<String>, mut chunks: Vec<Chunk>) -> Self {
        assert!(!chunks.is_empty(), "chunk map cannot be empty");
        assert!(chunks.len() <= CHUNKS_MAX, "too many chunks");

        chunks.sort_by(|a, b| compare_values(&a.min, &b.min));
        for pair in chunks.windows(2) {
            assert!(
                compare_values(&pair[0].max, &pair[1].min) != Ordering::Greater,
                "chunk ranges must be disjoint"
            );
        }

        Self { key_field: key_field.into(), chunks }
    }

    /// Returns the shard-key field name.
    #[must_use]
    pub fn key_field(&self) -> &str {
        &self.key_field
    }

    /// Returns every shard that owns at least one chunk.
    #[must_use]
    pub fn all_shards(&self) -> BTreeSet<ShardId> {
        self.chunks.iter().map(|chunk| chunk.shard.clone()).collect()
    }

    /// Returns the shards whose chunks intersect the given bounds, or all
    /// shards when no bounds are known.
    #[must_use]
    pub fn shards_for_bounds(&self, bounds: Option<&KeyBounds>) -> BTreeSet<ShardId> {
        match bounds {
            None => self.all_shards(),
            Some(bounds) => self
                .chunks
                .iter()
                .filter(|chunk| chunk.intersects(bounds))
                .map(|chunk| chunk.shard.clone())
                .collect(),
        }
    }

    /// Returns the chunks, ordered by range minimum.
    #[must_use]
    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    /// Returns the number of chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// Returns true if the map has no chunks. Never true after `new`.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

/// Extracts inclusive shard-key bounds from a query predicate.
///
/// Recognizes an equality on the shard-key field and the `$gt`/`$gte`/
/// `$lt`/`$lte` comparison operators. Anything else (including string
/// bounds under a non-simple collation, which the router cannot compare)
/// yields `None`, and the caller broadcasts.
#[must_use]
pub fn extract_shard_key_bounds(
    predicate: &Document,
    key_field: &str,
    collation: &Collation,
) -> Option<KeyBounds> {
    let value = predicate.get(key_field)?;

    let bounds = match value {
        Bson::Document(operators) => {
            let mut min = Bson::MinKey;
            let mut max = Bson::MaxKey;
            for (op, operand) in operators {
                match op.as_str() {
                    "$eq" => return finish_bounds(KeyBounds::point(operand.clone()), collation),
                    "$gt" | "$gte" => min = operand.clone(),
                    "$lt" | "$lte" => max = operand.clone(),
                    // Unknown operator: not selective on the shard key.
                    _ => return None,
                }
            }
            KeyBounds { min, max }
        }
        other => KeyBounds::point(other.clone()),
    };

    finish_bounds(bounds, collation)
}

/// Rejects bounds the router cannot compare under the given collation.
fn finish_bounds(bounds: KeyBounds, collation: &Collation) -> Option<KeyBounds> {
    let has_string = matches!(bounds.min, Bson::String(_)) || matches!(bounds.max, Bson::String(_));
    if has_string && !collation.is_simple() {
        return None;
    }
    Some(bounds)
}
