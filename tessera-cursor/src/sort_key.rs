//! Sort key extraction and comparison for ordered merging.
//!
//! A sort pattern is a document like `{a: 1, "b.c": -1}`. Extraction
//! pulls the named fields out of a result document (missing fields sort
//! as null); comparison applies the pattern's directions over the
//! canonical cross-type ordering.

use std::cmp::Ordering;

use bson::{Bson, Document};
use tessera_core::compare_values;

/// Resolves a dotted path inside a document.
fn lookup_path<'a>(document: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = document;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

/// Extracts the sort key of a document under the given sort pattern.
///
/// The key carries one entry per pattern field, in pattern order. Missing
/// fields extract as null, which sorts together with explicit nulls.
#[must_use]
pub fn extract_sort_key(document: &Document, pattern: &Document) -> Document {
    let mut key = Document::new();
    for (path, _direction) in pattern {
        let value = lookup_path(document, path).cloned().unwrap_or(Bson::Null);
        key.insert(path.clone(), value);
    }
    key
}

/// Compares two sort keys under the given sort pattern.
///
/// Both keys must have been extracted with [`extract_sort_key`] against
/// the same pattern. A negative pattern direction reverses that field's
/// ordering.
#[must_use]
pub fn compare_sort_keys(left: &Document, right: &Document, pattern: &Document) -> Ordering {
    for (path, direction) in pattern {
        let left_value = left.get(path).unwrap_or(&Bson::Null);
        let right_value = right.get(path).unwrap_or(&Bson::Null);
        let mut ordering = compare_values(left_value, right_value);
        if descending(direction) {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn descending(direction: &Bson) -> bool {
    match direction {
        Bson::Int32(v) => *v < 0,
        Bson::Int64(v) => *v < 0,
        Bson::Double(v) => *v < 0.0,
        _ => false,
    }
}
