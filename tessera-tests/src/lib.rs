//! Tessera Tests - end-to-end scenarios for the query router and cloner.
//!
//! Integration tests live here rather than in the library crates: they
//! exercise whole command flows (aggregate, getMore, killCursors, clone)
//! over an in-memory shard set, where the unit tests inline in each crate
//! cover single components.
//!
//! ## Test Organization
//!
//! **Support modules**:
//! - `mock_shard_set`: the command-level shard set and catalog doubles
//!
//! **Test modules**:
//! - `scenarios`: end-to-end aggregation, change-stream, and clone flows
//! - `properties`: cross-cutting invariants (paging partitions the
//!   stream, no orphan cursors, establishment command shape)
//!
//! ## Naming Conventions
//!
//! - Integration tests: `test_<flow>_<behavior>`
//! - Unit tests: inline in each crate under `#[cfg(test)]`

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

pub mod mock_shard_set;

#[cfg(test)]
mod properties;
#[cfg(test)]
mod scenarios;
