//! Tessera Clone - bulk collection copy for initial sync.
//!
//! The [`CollectionCloner`] copies one collection from a source server
//! into a local [`BulkLoader`]: count the source, collect its index
//! specs, open one or more scan cursors, and stream batches through a
//! bounded insert pool until the remotes are drained. A single completion
//! callback reports the final status after the loader is released.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod cloner;
mod error;
mod loader;
mod progress;

pub use cloner::{CloneState, CloneStats, CollectionCloner, ClonerOptions};
pub use error::{CloneError, LoaderError};
pub use loader::BulkLoader;
