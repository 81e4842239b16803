//! Strongly-typed identifiers for Tessera entities.
//!
//! Following `TigerStyle`: explicit types prevent bugs from mixing up IDs.
//! Cursor ids and epochs are 64-bit to match the wire protocol.

use std::fmt;

/// Macro to generate strongly-typed ID wrappers.
///
/// Each ID type wraps a u64 and provides:
/// - Type safety (can't mix `CursorId` with `Epoch`)
/// - Debug/Display formatting
/// - Zero-cost abstraction (same as raw u64)
macro_rules! define_id {
    ($name:ident, $prefix:expr, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(u64);

        impl $name {
            /// Creates a new ID from a raw u64 value.
            #[inline]
            #[must_use]
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            /// Returns the raw u64 value.
            #[inline]
            #[must_use]
            pub const fn get(self) -> u64 {
                self.0
            }

            /// Returns the next ID in sequence.
            ///
            /// # Panics
            /// Panics if the ID would overflow.
            #[inline]
            #[must_use]
            pub const fn next(self) -> Self {
                assert!(self.0 < u64::MAX, "ID overflow");
                Self(self.0 + 1)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", $prefix, self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}-{}", $prefix, self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for u64 {
            fn from(id: $name) -> Self {
                id.get()
            }
        }
    };
}

define_id!(CursorId, "cursor", "Identifier of a server-side cursor. Zero is the exhausted sentinel.");
define_id!(Epoch, "epoch", "Routing generation of a namespace. Bumped on any resharding event.");

impl CursorId {
    /// The sentinel id meaning "no live cursor / stream exhausted".
    pub const EXHAUSTED: Self = Self(0);

    /// Returns true if this is the exhausted sentinel.
    #[inline]
    #[must_use]
    pub const fn is_exhausted(self) -> bool {
        self.0 == 0
    }

    /// Returns the signed wire representation (cursor ids travel as int64).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub const fn as_wire(self) -> i64 {
        self.0 as i64
    }

    /// Builds a cursor id from the signed wire representation.
    #[inline]
    #[must_use]
    #[allow(clippy::cast_sign_loss)]
    pub const fn from_wire(value: i64) -> Self {
        Self(value as u64)
    }
}

/// Opaque name of one storage server (typically a replica set).
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(String);

impl ShardId {
    /// Creates a shard id from its string name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        assert!(!name.is_empty(), "shard id cannot be empty");
        Self(name)
    }

    /// Returns the shard name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shard({})", self.0)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// A (database, collection) pair naming a logical collection.
///
/// The collection part is absent for "collectionless" administrative
/// aggregations that synthesize their own source.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Namespace {
    /// Database name.
    db: String,
    /// Collection name; `None` for collectionless namespaces.
    coll: Option<String>,
}

impl Namespace {
    /// Creates a namespace for a concrete collection.
    #[must_use]
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        let db = db.into();
        let coll = coll.into();
        assert!(!db.is_empty(), "database name cannot be empty");
        assert!(!coll.is_empty(), "collection name cannot be empty");
        Self { db, coll: Some(coll) }
    }

    /// Creates a collectionless namespace for database-level aggregations.
    #[must_use]
    pub fn collectionless(db: impl Into<String>) -> Self {
        let db = db.into();
        assert!(!db.is_empty(), "database name cannot be empty");
        Self { db, coll: None }
    }

    /// Returns the database name.
    #[must_use]
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Returns the collection name, if any.
    #[must_use]
    pub fn coll(&self) -> Option<&str> {
        self.coll.as_deref()
    }

    /// Returns true if this namespace has no collection part.
    #[must_use]
    pub const fn is_collectionless(&self) -> bool {
        self.coll.is_none()
    }

    /// Returns the full "db.coll" string used on the wire.
    ///
    /// Collectionless namespaces use the `$cmd.aggregate` pseudo-collection,
    /// matching what clients observe in cursor responses.
    #[must_use]
    pub fn full_name(&self) -> String {
        match &self.coll {
            Some(coll) => format!("{}.{coll}", self.db),
            None => format!("{}.$cmd.aggregate", self.db),
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ns({})", self.full_name())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.full_name())
    }
}

/// The shard version attached to shard-directed commands.
///
/// Shards compare the epoch against their own view of the namespace and
/// reject commands carrying an older one with a stale-version error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardVersion {
    /// The namespace is not sharded; the sentinel tells the shard so.
    Unsharded,
    /// A concrete routing generation.
    Versioned {
        /// Routing generation of the namespace.
        epoch: Epoch,
        /// Major version (chunk migrations bump this).
        major: u32,
        /// Minor version (chunk splits bump this).
        minor: u32,
    },
}

impl ShardVersion {
    /// Creates a versioned shard version with a zero major/minor.
    #[must_use]
    pub const fn from_epoch(epoch: Epoch) -> Self {
        Self::Versioned { epoch, major: 0, minor: 0 }
    }

    /// Returns the epoch, if this is a versioned entry.
    #[must_use]
    pub const fn epoch(&self) -> Option<Epoch> {
        match self {
            Self::Unsharded => None,
            Self::Versioned { epoch, .. } => Some(*epoch),
        }
    }
}
