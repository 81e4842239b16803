//! Tessera Router - dispatch, merge execution, and the command front-end.
//!
//! This crate orchestrates one aggregation: split the pipeline, target the
//! shards, establish cursors, pick a merge site, and expose the merged
//! stream as a single client-facing cursor. The flow is
//! `Router::aggregate` -> `Dispatcher` -> `MergeExecutor` ->
//! `CursorRegistry`, with `get_more` paging a registered [`ClusterCursor`]
//! and `kill_cursors` tearing it down.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cluster_cursor;
mod config;
mod dispatch;
mod merge_exec;
mod service;

pub use cluster_cursor::{BatchResult, ClusterCursor};
pub use config::RouterConfig;
pub use dispatch::{DispatchResult, Dispatcher, ExchangeFanout};
pub use merge_exec::MergeExecutor;
pub use service::Router;
