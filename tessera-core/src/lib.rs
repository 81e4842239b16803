//! Tessera Core - Strongly-typed identifiers, error model, and limits.
//!
//! This crate provides the types shared by every Tessera component: the
//! identifier newtypes, the wire-coded error model, the system limits, the
//! per-operation context, and the cursor-response wire helpers. It does NOT
//! talk to the network - the shard command seam lives in `tessera-cursor`.
//!
//! # Design Principles (TigerStyle)
//!
//! - **Strongly-typed IDs**: Prevent mixing up a `CursorId` with an `Epoch`
//! - **Explicit limits**: Every retry budget and timeout has a bounded default
//! - **Explicit types**: Use u32/u64, not usize
//! - **No unsafe code**: Safety > Performance

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod collation;
mod error;
mod limits;
mod opctx;
mod order;
mod types;
mod wire;

pub use collation::Collation;
pub use error::{Error, ErrorCode, ErrorLabel, Result};
pub use limits::Limits;
pub use opctx::{OperationContext, TxnContext};
pub use order::compare_values;
pub use types::{CursorId, Epoch, Namespace, ShardId, ShardVersion};
pub use wire::{
    error_from_document, error_to_document, kill_cursors_reply, CursorResponse,
};

/// Returns the current wall-clock time in microseconds since the Unix epoch.
///
/// Components that need testable time take `current_time_us` parameters;
/// this helper is for the edges (reaper loops, last-access stamps) where
/// real time is the point.
#[must_use]
pub fn unix_time_us() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX)
}
