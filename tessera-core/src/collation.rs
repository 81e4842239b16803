//! Collation selection for queries and merges.
//!
//! The core only distinguishes the simple (locale-free) collation from
//! locale-aware ones. Locale-aware comparison itself is an external
//! collaborator; the core's job is to thread the right collation into
//! shard-directed commands and to refuse to compare collated strings in
//! the merge path.

use bson::{doc, Bson, Document};

/// Collation under which a pipeline evaluates string comparisons.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Collation {
    /// Code-point comparison; the only collation the router merges under.
    #[default]
    Simple,
    /// A locale-aware collation, evaluated on the shards.
    Locale(String),
}

impl Collation {
    /// Returns true for the simple collation.
    #[must_use]
    pub const fn is_simple(&self) -> bool {
        matches!(self, Self::Simple)
    }

    /// Encodes the collation as the wire sub-document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        match self {
            Self::Simple => doc! { "locale": "simple" },
            Self::Locale(locale) => doc! { "locale": locale.as_str() },
        }
    }

    /// Decodes a collation sub-document; a missing locale means simple.
    #[must_use]
    pub fn from_document(spec: &Document) -> Self {
        match spec.get("locale").and_then(Bson::as_str) {
            None | Some("simple") => Self::Simple,
            Some(locale) => Self::Locale(locale.to_string()),
        }
    }
}
