//! The pipeline splitter.
//!
//! Given a validated pipeline, the splitter decides which prefix of stages
//! can run independently on every targeted shard (the shards part) and
//! which suffix must run once on a single merger (the merge part). The
//! decision uses only the constraints each stage advertises.

use bson::{doc, Bson, Document};
use tessera_core::{Error, ErrorCode, Result};
use tracing::debug;

use crate::pipeline::{serialize_stages, Pipeline, PipelineContext, TailableMode};
use crate::stage::{HostRequirement, Stage};

/// The sort key change streams merge on: cluster time, then collection
/// UUID, then document key.
#[must_use]
pub fn change_stream_sort_key() -> Document {
    doc! { "clusterTime": 1, "uuid": 1, "documentKey": 1 }
}

/// Partitioning policy of an exchange fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangePolicy {
    /// Documents route to consumers by key range; same key, same consumer.
    KeyRange,
    /// Documents route round-robin (order-insensitive merges only).
    RoundRobin,
}

impl ExchangePolicy {
    /// Returns the wire token for this policy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::KeyRange => "keyRange",
            Self::RoundRobin => "roundRobin",
        }
    }
}

/// An exchange fan-out specification.
///
/// The splitter emits the policy and the partition key; the dispatcher
/// fills in the consumer count and the range boundaries once it knows the
/// routing layout.
#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeSpec {
    /// Partitioning policy.
    pub policy: ExchangePolicy,
    /// The field documents partition on (sort-pattern shape).
    pub key: Document,
    /// Number of consumer shards; zero until the dispatcher plans the
    /// fan-out.
    pub consumers: u32,
    /// Key-range boundaries, when the policy needs them.
    pub boundaries: Option<Vec<Document>>,
}

impl ExchangeSpec {
    /// Encodes the exchange as the wire sub-document.
    #[must_use]
    pub fn to_document(&self) -> Document {
        let mut spec = doc! {
            "policy": self.policy.as_str(),
            "key": self.key.clone(),
            "consumers": i64::from(self.consumers),
        };
        if let Some(boundaries) = &self.boundaries {
            let array: Vec<Bson> = boundaries.iter().cloned().map(Bson::Document).collect();
            spec.insert("boundaries", array);
        }
        spec
    }
}

/// A pipeline split into its shards part and merge part.
#[derive(Debug)]
pub struct SplitPipeline {
    /// Stages every targeted shard runs in parallel.
    pub shards_part: Vec<Stage>,
    /// Stages that run once on the merger.
    pub merge_part: Vec<Stage>,
    /// Present iff the merged stream must re-order on this key.
    pub sort_key: Option<Document>,
    /// Present iff the merge may fan out across consumer shards.
    pub exchange: Option<ExchangeSpec>,
    /// The pipeline's evaluation context.
    pub context: PipelineContext,
    /// The pipeline must target every shard (change streams,
    /// `AllShards` stages).
    pub needs_all_shards: bool,
}

impl SplitPipeline {
    /// Returns true if any merge stage must run on the primary shard.
    #[must_use]
    pub fn needs_primary_merge(&self) -> bool {
        self.merge_part.iter().any(|stage| {
            stage.constraints().host_requirement == HostRequirement::PrimaryShard
        })
    }

    /// Returns true if the merge part may run on the router.
    ///
    /// Every merge stage must both be permitted on the router and provide
    /// router-side execution logic; `prohibit` is the configuration switch
    /// that forces merges off the router regardless.
    #[must_use]
    pub fn merge_on_router(&self, prohibit: bool) -> bool {
        if prohibit && !self.merge_part.is_empty() {
            return false;
        }
        self.merge_part
            .iter()
            .all(|stage| stage.constraints().runs_on_router() && stage.has_logic())
    }

    /// Serializes the shards part as the wire `pipeline` array.
    #[must_use]
    pub fn serialize_shards_part(&self) -> Vec<Bson> {
        serialize_stages(&self.shards_part)
    }

    /// Serializes the merge part as the wire `pipeline` array.
    #[must_use]
    pub fn serialize_merge_part(&self) -> Vec<Bson> {
        serialize_stages(&self.merge_part)
    }
}

/// Result of splitting a pipeline.
#[derive(Debug)]
pub enum SplitResult {
    /// The whole pipeline runs on the router; no shard is contacted.
    RouterLocal(Pipeline),
    /// The pipeline splits into a shards part and a merge part.
    Split(SplitPipeline),
}

/// Splits pipelines per their stages' advertised constraints.
pub struct PipelineSplitter {
    /// Allow emitting exchange specs.
    exchange_enabled: bool,
}

impl PipelineSplitter {
    /// Creates a splitter.
    #[must_use]
    pub const fn new(exchange_enabled: bool) -> Self {
        Self { exchange_enabled }
    }

    /// Splits a pipeline.
    ///
    /// # Errors
    ///
    /// Returns `FailedToParse` for pipelines that require the router but
    /// have no source to feed them, or whose router-only stages cannot be
    /// executed.
    pub fn split(&self, pipeline: Pipeline) -> Result<SplitResult> {
        let requires_router = pipeline
            .stages()
            .iter()
            .any(|stage| stage.constraints().host_requirement == HostRequirement::Router);
        let synthesizes_source = pipeline
            .stages()
            .first()
            .is_some_and(|stage| !stage.constraints().requires_input);

        // A router-only source can never be fed by shard cursors.
        if requires_router && !synthesizes_source {
            return Err(Error::new(
                ErrorCode::FailedToParse,
                "pipeline requires the router but its first stage consumes input",
            ));
        }

        let is_change_stream = pipeline.has_change_stream();

        // Router-local unsplit: every stage runs on the router and the
        // pipeline brings its own source.
        if !is_change_stream
            && synthesizes_source
            && pipeline
                .stages()
                .iter()
                .all(|stage| stage.constraints().runs_on_router())
        {
            if pipeline.stages().iter().all(Stage::has_logic) {
                debug!(stages = pipeline.len(), "Classified pipeline as router-local");
                return Ok(SplitResult::RouterLocal(pipeline));
            }
            return Err(Error::new(
                ErrorCode::FailedToParse,
                "router-only pipeline contains a stage with no router execution",
            ));
        }

        let needs_all_shards = is_change_stream
            || pipeline
                .stages()
                .iter()
                .any(|stage| stage.constraints().host_requirement == HostRequirement::AllShards);

        let (stages, mut context) = pipeline.into_parts();
        let mut shards_part: Vec<Stage> = Vec::new();
        let mut merge_part: Vec<Stage> = Vec::new();
        let mut sort_key: Option<Document> = None;
        let mut in_merge = false;

        for stage in stages {
            if in_merge {
                merge_part.push(stage);
                continue;
            }

            let boundary = stage.constraints().sort_boundary.clone();
            if let Some(pattern) = boundary {
                if context.collation.is_simple() {
                    // The shards sort; the merged stream re-orders on the
                    // same key, so the sort stage itself stays shard-side.
                    sort_key = Some(pattern);
                    shards_part.push(stage);
                } else {
                    // The router cannot compare collated strings, so the
                    // sort must run wholly on the merger.
                    merge_part.push(stage);
                }
                in_merge = true;
            } else if stage.constraints().forces_merge() {
                in_merge = true;
                merge_part.push(stage);
            } else {
                shards_part.push(stage);
            }
        }

        Self::hoist_swappable_filters(&mut shards_part, &mut merge_part);
        Self::duplicate_limits(&mut shards_part, &merge_part);

        // An exchange is only sound when every document with the same
        // merge key reaches the same consumer, so the merge head must
        // name a plain field to partition on.
        let exchange = if self.exchange_enabled && !is_change_stream {
            merge_part
                .first()
                .filter(|stage| stage.constraints().prefers_exchange)
                .and_then(|stage| Self::exchange_key(stage))
                .map(|key| ExchangeSpec {
                    policy: ExchangePolicy::KeyRange,
                    key,
                    consumers: 0,
                    boundaries: None,
                })
        } else {
            None
        };

        if is_change_stream {
            if sort_key.is_none() {
                sort_key = Some(change_stream_sort_key());
            }
            context.tailable = TailableMode::TailableAwaitData;
        }

        debug!(
            shards_stages = shards_part.len(),
            merge_stages = merge_part.len(),
            sorted = sort_key.is_some(),
            exchange = exchange.is_some(),
            "Split pipeline"
        );

        Ok(SplitResult::Split(SplitPipeline {
            shards_part,
            merge_part,
            sort_key,
            exchange,
            context,
            needs_all_shards,
        }))
    }

    /// The partition key of an exchange-eligible merge head: the single
    /// top-level field its `_id` expression names. A computed or dotted
    /// key yields `None` and the merge stays on one shard.
    fn exchange_key(stage: &Stage) -> Option<Document> {
        let body = stage.body().as_document()?;
        let Bson::String(path) = body.get("_id")? else {
            return None;
        };
        let field = path.strip_prefix('$')?;
        if field.is_empty() || field.contains('.') {
            return None;
        }
        Some(doc! { field: 1 })
    }

    /// Moves merge-part filters to the shards part when every stage ahead
    /// of them permits the swap. Filtering earlier shrinks what crosses
    /// the network.
    fn hoist_swappable_filters(shards_part: &mut Vec<Stage>, merge_part: &mut Vec<Stage>) {
        let mut index = 0;
        let mut swappable_prefix = true;
        while index < merge_part.len() {
            let stage = &merge_part[index];
            if swappable_prefix
                && !stage.constraints().forces_merge()
                && stage.constraints().host_requirement == HostRequirement::Any
            {
                let hoisted = merge_part.remove(index);
                shards_part.push(hoisted);
                continue;
            }
            swappable_prefix = swappable_prefix && stage.constraints().can_swap_with_match;
            index += 1;
        }
    }

    /// Copies merge-part truncation stages to the shards part when every
    /// stage ahead of them permits the swap, so shards bound what they
    /// return.
    fn duplicate_limits(shards_part: &mut Vec<Stage>, merge_part: &[Stage]) {
        let mut swappable_prefix = true;
        for stage in merge_part {
            if stage.constraints().duplicate_to_shards && swappable_prefix {
                shards_part.push(stage.duplicate_for_shards());
            }
            swappable_prefix = swappable_prefix && stage.constraints().can_swap_with_limit;
        }
    }
}
