//! Tessera Cursor - remote cursors, establishment, merging, and registry.
//!
//! This crate owns the cursor machinery shared by the query router and the
//! collection cloner:
//!
//! - [`RemoteCursor`]: a handle to one server-side cursor on one shard,
//!   with kill-on-drop ownership and a dismissal step for hand-offs.
//! - [`CursorEstablisher`]: concurrent cursor establishment with per-shard
//!   retry and guaranteed cleanup of partially-opened cursors.
//! - [`AsyncResultsMerger`]: a pull-style merger over N remote cursors,
//!   in arrival order or in global sort-key order.
//! - [`CursorRegistry`]: the process-wide table of client-facing cursors
//!   with exclusive leases, authorization, and a TTL reaper.
//!
//! # Concurrency model
//!
//! The merger is single-threaded cooperative: one lock serializes all
//! state, and the only suspension point is `next_event`. Network fetches
//! complete on spawned tasks that capture a weak handle to the merger, so
//! a dropped merger never keeps its remotes alive.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod establish;
mod merger;
mod registry;
mod remote;
mod shard_service;
mod sort_key;

pub use establish::{CursorEstablisher, EstablishedCursors, RetryPolicy};
pub use merger::{AsyncResultsMerger, MergerParams, MergerResult};
pub use registry::{CursorLifetime, CursorRegistry, CursorType, KillResult, RegistryStats};
pub use remote::{start_kill_sink, KillSink, RemoteCursor};
pub use shard_service::{get_more_command, kill_cursors_command, ShardService};
pub use sort_key::{compare_sort_keys, extract_sort_key};
