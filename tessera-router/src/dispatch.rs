//! The dispatcher: shard targeting, command assembly, and stale retry.
//!
//! Given a split pipeline and an operation context, the dispatcher asks
//! the routing table which shards hold relevant data, assembles one
//! aggregate command per shard (shard version, collation, transaction
//! fields), and hands the batch to the cursor establisher. A stale-version
//! reply from any shard invalidates the cached routing entry, refreshes,
//! rebuilds the commands, and retries up to the stale-retry budget.

use std::collections::BTreeSet;
use std::sync::Arc;

use bson::{doc, Bson, Document};
use tessera_core::{
    Collation, ErrorLabel, Limits, Namespace, OperationContext, Result, ShardId, ShardVersion,
};
use tessera_cursor::{
    CursorEstablisher, EstablishedCursors, KillSink, RemoteCursor, RetryPolicy, ShardService,
};
use tessera_pipeline::{ExchangeSpec, SplitPipeline, TailableMode};
use tessera_routing::{extract_shard_key_bounds, RoutingInfo, RoutingTable};
use tracing::{debug, warn};

/// An installed exchange fan-out: which shards host the consumers, and
/// the sub-cursors each producer opened for them.
#[derive(Debug)]
pub struct ExchangeFanout {
    /// Shards hosting the consumers, one per key range.
    pub consumer_shards: Vec<ShardId>,
    /// Producer-major sub-cursor matrix: `sub_cursors[p][c]` feeds
    /// consumer `c`.
    pub sub_cursors: Vec<Vec<RemoteCursor>>,
}

/// The outcome of a successful dispatch.
#[derive(Debug)]
pub struct DispatchResult {
    /// The established producer cursors, in target order. Empty when the
    /// dispatch installed an exchange.
    pub cursors: Vec<RemoteCursor>,
    /// Shards skipped as unreachable (partial-results dispatches only).
    pub unreachable: Vec<ShardId>,
    /// The routing info the dispatch was built against.
    pub routing: Arc<RoutingInfo>,
    /// The shards a command was sent to.
    pub targets: Vec<ShardId>,
    /// The installed fan-out, when the split asked for an exchange and
    /// the routing layout supports one.
    pub exchange: Option<ExchangeFanout>,
}

/// What one dispatch attempt established.
enum Established {
    Single(EstablishedCursors),
    Fanout { consumer_shards: Vec<ShardId>, sub_cursors: Vec<Vec<RemoteCursor>> },
}

/// Targets shards and establishes the shards-part cursors.
pub struct Dispatcher {
    table: Arc<RoutingTable>,
    service: Arc<dyn ShardService>,
    kill_sink: KillSink,
    limits: Limits,
}

impl Dispatcher {
    /// Creates a dispatcher.
    #[must_use]
    pub fn new(
        table: Arc<RoutingTable>,
        service: Arc<dyn ShardService>,
        kill_sink: KillSink,
        limits: Limits,
    ) -> Self {
        Self { table, service, kill_sink, limits }
    }

    /// Dispatches the shards part of a split pipeline.
    ///
    /// # Errors
    ///
    /// Propagates routing lookup failures, establishment failures after
    /// retries, and stale-version errors past the retry budget. Inside a
    /// transaction, `SnapshotUnavailable` is surfaced with the
    /// transient-transaction label and never retried locally.
    pub async fn dispatch(
        &self,
        namespace: &Namespace,
        split: &SplitPipeline,
        opctx: &OperationContext,
    ) -> Result<DispatchResult> {
        let mut attempt: u32 = 0;
        loop {
            let routing = self.table.lookup(namespace).await?;
            let targets = Self::select_targets(&routing, split);
            if targets.is_empty() {
                debug!(namespace = %namespace, "No shard holds matching chunks");
                return Ok(DispatchResult {
                    cursors: Vec::new(),
                    unreachable: Vec::new(),
                    routing,
                    targets: Vec::new(),
                    exchange: None,
                });
            }

            let targets: Vec<ShardId> = targets.into_iter().collect();
            let exchange_plan = split
                .exchange
                .as_ref()
                .and_then(|spec| Self::plan_exchange(spec, &routing, &targets));
            let requests: Vec<(ShardId, Document)> = targets
                .iter()
                .map(|shard| {
                    let command = self.build_command(
                        namespace,
                        split,
                        &routing,
                        shard,
                        exchange_plan.as_ref().map(|(spec, _)| spec),
                        opctx,
                    );
                    (shard.clone(), command)
                })
                .collect();

            let retry_policy = if opctx.txn().is_some() {
                RetryPolicy::none()
            } else {
                RetryPolicy::idempotent_reads(&self.limits)
            };
            let allow_partial = split.context.tailable == TailableMode::TailableAwaitData;
            let establisher =
                CursorEstablisher::new(Arc::clone(&self.service), self.kill_sink.clone(), retry_policy)
                    .allow_partial_results(allow_partial);
            let collection = namespace.coll().unwrap_or("$cmd.aggregate").to_string();

            let outcome = match exchange_plan {
                Some((_, consumer_shards)) => establisher
                    .establish_fanout(&collection, requests, consumer_shards.len())
                    .await
                    .map(|sub_cursors| Established::Fanout { consumer_shards, sub_cursors }),
                None => establisher
                    .establish(&collection, requests)
                    .await
                    .map(Established::Single),
            };

            match outcome {
                Ok(Established::Single(established)) => {
                    debug!(
                        namespace = %namespace,
                        cursors = established.cursors.len(),
                        attempt,
                        "Dispatch established cursors"
                    );
                    return Ok(DispatchResult {
                        cursors: established.cursors,
                        unreachable: established.unreachable,
                        routing,
                        targets,
                        exchange: None,
                    });
                }
                Ok(Established::Fanout { consumer_shards, sub_cursors }) => {
                    debug!(
                        namespace = %namespace,
                        producers = sub_cursors.len(),
                        consumers = consumer_shards.len(),
                        attempt,
                        "Dispatch established an exchange fan-out"
                    );
                    return Ok(DispatchResult {
                        cursors: Vec::new(),
                        unreachable: Vec::new(),
                        routing,
                        targets,
                        exchange: Some(ExchangeFanout { consumer_shards, sub_cursors }),
                    });
                }
                Err(error) if error.code().is_stale_routing() => {
                    attempt += 1;
                    if attempt > self.limits.max_stale_retries {
                        warn!(namespace = %namespace, attempt, "Stale retry budget exhausted");
                        return Err(error);
                    }
                    // The shard knows a newer routing generation than the
                    // cache; drop the entry we built against and refetch.
                    self.table.invalidate(namespace, routing.epoch()).await;
                    self.table.refresh(namespace).await?;
                }
                Err(error)
                    if error.code() == tessera_core::ErrorCode::SnapshotUnavailable
                        && opctx.txn().is_some() =>
                {
                    return Err(error.with_label(ErrorLabel::TransientTransaction));
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Selects the shards that must receive the shards part.
    fn select_targets(routing: &RoutingInfo, split: &SplitPipeline) -> BTreeSet<ShardId> {
        let Some(chunk_map) = routing.chunk_map() else {
            return BTreeSet::from([routing.primary_shard().clone()]);
        };
        if split.needs_all_shards {
            return chunk_map.all_shards();
        }
        let Some(predicate) = Self::leading_predicate(split) else {
            return chunk_map.all_shards();
        };
        let collation = Self::effective_collation(routing, split);
        let bounds = extract_shard_key_bounds(predicate, chunk_map.key_field(), &collation);
        chunk_map.shards_for_bounds(bounds.as_ref())
    }

    /// Returns the predicate of a leading `$match` in the shards part.
    fn leading_predicate(split: &SplitPipeline) -> Option<&Document> {
        let first = split.shards_part.first()?;
        if first.name() == "$match" {
            first.body().as_document()
        } else {
            None
        }
    }

    /// The collation shard commands evaluate under: the pipeline's, or the
    /// collection default when the pipeline did not specify one.
    fn effective_collation(routing: &RoutingInfo, split: &SplitPipeline) -> Collation {
        if split.context.collation.is_simple() {
            routing.default_collation().clone()
        } else {
            split.context.collation.clone()
        }
    }

    /// Plans the exchange fan-out against the routing layout.
    ///
    /// The splitter only knows the merge key; the consumer count and the
    /// range boundaries come from the chunk map, and only when the merge
    /// key is the shard key. Partitioning on any other field would send
    /// documents that share a merge key to different consumers.
    fn plan_exchange(
        spec: &ExchangeSpec,
        routing: &RoutingInfo,
        targets: &[ShardId],
    ) -> Option<(ExchangeSpec, Vec<ShardId>)> {
        if targets.len() < 2 {
            return None;
        }
        let chunk_map = routing.chunk_map()?;
        let mut keys = spec.key.keys();
        let key_field = keys.next()?;
        if keys.next().is_some() || key_field != chunk_map.key_field() {
            return None;
        }
        let chunks = chunk_map.chunks();
        if chunks.len() < 2 {
            return None;
        }

        // One consumer per chunk, hosted on the chunk's owner. Boundary i
        // and i+1 bracket consumer i's key range.
        let mut boundaries: Vec<Document> = chunks
            .iter()
            .map(|chunk| doc! { key_field: chunk.min.clone() })
            .collect();
        if let Some(last) = chunks.last() {
            boundaries.push(doc! { key_field: last.max.clone() });
        }
        let consumer_shards: Vec<ShardId> =
            chunks.iter().map(|chunk| chunk.shard.clone()).collect();

        let installed = ExchangeSpec {
            policy: spec.policy,
            key: spec.key.clone(),
            consumers: u32::try_from(consumer_shards.len()).unwrap_or(u32::MAX),
            boundaries: Some(boundaries),
        };
        Some((installed, consumer_shards))
    }

    /// Assembles the aggregate command for one shard.
    fn build_command(
        &self,
        namespace: &Namespace,
        split: &SplitPipeline,
        routing: &RoutingInfo,
        shard: &ShardId,
        exchange: Option<&ExchangeSpec>,
        opctx: &OperationContext,
    ) -> Document {
        let aggregate: Bson = match namespace.coll() {
            Some(coll) => Bson::String(coll.to_string()),
            None => Bson::Int32(1),
        };
        let mut command = doc! {
            "aggregate": aggregate,
            "pipeline": split.serialize_shards_part(),
            // The establishment batch is empty; the merger pulls the first
            // real batch through getMore.
            "cursor": { "batchSize": 0 },
            "fromRouter": true,
            "collation": Self::effective_collation(routing, split).to_document(),
        };

        match routing.shard_version() {
            ShardVersion::Unsharded => {
                command.insert("shardVersion", "UNSHARDED");
            }
            ShardVersion::Versioned { epoch, major, minor } => {
                command.insert(
                    "shardVersion",
                    doc! {
                        "epoch": i64::try_from(epoch.get()).unwrap_or(i64::MAX),
                        "major": i64::from(major),
                        "minor": i64::from(minor),
                    },
                );
            }
        }

        if let Some(exchange) = exchange {
            command.insert("exchange", exchange.to_document());
        }

        if let Some(txn) = opctx.txn() {
            command.insert("lsid", doc! { "id": txn.lsid() });
            command.insert("txnNumber", txn.txn_number());
            command.insert("autocommit", false);
            if txn.mark_participant(shard) {
                command.insert("startTransaction", true);
                if let Some(read_concern) = txn.read_concern() {
                    command.insert("readConcern", read_concern.clone());
                }
            }
        }

        command
    }
}
