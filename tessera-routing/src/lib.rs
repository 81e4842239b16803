//! Tessera Routing - cached namespace-to-shard routing.
//!
//! This crate owns the routing table: the cached mapping from a logical
//! namespace to the shards that hold its data, keyed by a monotonically
//! increasing epoch. Shards reject commands carrying an older epoch with a
//! stale-version error; the dispatcher then invalidates and refreshes here.
//!
//! # Design
//!
//! - Reads are lock-free on hit (one `RwLock` read acquisition).
//! - Concurrent refreshes for the same namespace coalesce into one
//!   upstream fetch through a per-namespace gate.
//! - The upstream catalog is an async trait seam (`CatalogClient`) so
//!   tests replace it with an in-memory double.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod chunk_map;
mod info;
mod table;

pub use chunk_map::{extract_shard_key_bounds, Chunk, ChunkMap, KeyBounds};
pub use info::RoutingInfo;
pub use table::{CatalogClient, RoutingTable};
