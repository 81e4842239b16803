//! Canonical BSON value ordering.
//!
//! Cross-type comparison follows the canonical sort order of the document
//! data model: values of different types order by type class first, and
//! numbers of different widths compare by value. Both chunk-range targeting
//! and the k-way merge heap rely on this one definition.

use std::cmp::Ordering;

use bson::Bson;

/// Rank of a value's type class in the canonical sort order.
///
/// `MinKey` sorts before everything and `MaxKey` after everything, which is
/// what makes them usable as open chunk-range endpoints.
#[must_use]
const fn type_rank(value: &Bson) -> u8 {
    match value {
        Bson::MinKey => 0,
        Bson::Null | Bson::Undefined => 1,
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) | Bson::Decimal128(_) => 2,
        Bson::String(_) | Bson::Symbol(_) => 3,
        Bson::Document(_) => 4,
        Bson::Array(_) => 5,
        Bson::Binary(_) => 6,
        Bson::ObjectId(_) | Bson::DbPointer(_) => 7,
        Bson::Boolean(_) => 8,
        Bson::DateTime(_) => 9,
        Bson::Timestamp(_) => 10,
        Bson::RegularExpression(_) => 11,
        Bson::JavaScriptCode(_) | Bson::JavaScriptCodeWithScope(_) => 12,
        Bson::MaxKey => 13,
    }
}

/// Compares two BSON values in canonical sort order.
///
/// Only the simple (locale-free) collation is supported: strings compare
/// by code point. Callers that need a locale-aware comparison must not
/// reach this function (the splitter keeps such sorts out of the merge
/// path).
#[must_use]
pub fn compare_values(left: &Bson, right: &Bson) -> Ordering {
    let rank_left = type_rank(left);
    let rank_right = type_rank(right);
    if rank_left != rank_right {
        return rank_left.cmp(&rank_right);
    }

    match (left, right) {
        (Bson::Int32(a), Bson::Int32(b)) => a.cmp(b),
        (Bson::Int64(a), Bson::Int64(b)) => a.cmp(b),
        (Bson::Int32(a), Bson::Int64(b)) => i64::from(*a).cmp(b),
        (Bson::Int64(a), Bson::Int32(b)) => a.cmp(&i64::from(*b)),
        (Bson::Double(a), Bson::Double(b)) => total_order_f64(*a, *b),
        (Bson::Double(a), Bson::Int32(b)) => total_order_f64(*a, f64::from(*b)),
        (Bson::Int32(a), Bson::Double(b)) => total_order_f64(f64::from(*a), *b),
        #[allow(clippy::cast_precision_loss)]
        (Bson::Double(a), Bson::Int64(b)) => total_order_f64(*a, *b as f64),
        #[allow(clippy::cast_precision_loss)]
        (Bson::Int64(a), Bson::Double(b)) => total_order_f64(*a as f64, *b),
        (Bson::String(a), Bson::String(b)) => a.cmp(b),
        (Bson::Boolean(a), Bson::Boolean(b)) => a.cmp(b),
        (Bson::DateTime(a), Bson::DateTime(b)) => a.cmp(b),
        (Bson::Timestamp(a), Bson::Timestamp(b)) => {
            a.time.cmp(&b.time).then(a.increment.cmp(&b.increment))
        }
        (Bson::ObjectId(a), Bson::ObjectId(b)) => a.bytes().cmp(&b.bytes()),
        (Bson::Binary(a), Bson::Binary(b)) => a.bytes.cmp(&b.bytes),
        (Bson::Array(a), Bson::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Bson::Document(a), Bson::Document(b)) => {
            for ((key_a, val_a), (key_b, val_b)) in a.iter().zip(b.iter()) {
                let ord = key_a.cmp(key_b).then_with(|| compare_values(val_a, val_b));
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        // Same type class, no finer ordering defined (regex, code, etc.).
        _ => Ordering::Equal,
    }
}

/// f64 comparison with NaN ordered first, so the heap never panics.
#[must_use]
fn total_order_f64(a: f64, b: f64) -> Ordering {
    a.partial_cmp(&b).unwrap_or_else(|| {
        if a.is_nan() && b.is_nan() {
            Ordering::Equal
        } else if a.is_nan() {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    })
}
