//! Tessera Pipeline - opaque stage nodes and the pipeline splitter.
//!
//! The router core never interprets what a stage computes. A stage is an
//! opaque node with advertised constraints (where it may run, whether it
//! must merge, what it commutes with) plus an optional narrow execution
//! seam for running merge parts on the router. The splitter uses only the
//! constraints to decide which prefix runs on every shard and which suffix
//! runs once on a merger.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod pipeline;
mod split;
mod stage;

pub use pipeline::{Pipeline, PipelineContext, TailableMode};
pub use split::{
    change_stream_sort_key, ExchangePolicy, ExchangeSpec, PipelineSplitter, SplitPipeline,
    SplitResult,
};
pub use stage::{HostRequirement, Stage, StageConstraints, StageLogic, StageOutput};
