//! The merge executor: picks where the merge part runs and builds the
//! client-facing cursor.
//!
//! Three sites. A router-local merge wires the merge stages directly over
//! the async results merger. A shard merge (primary or arbitrary) wraps
//! the producer cursors in a `$mergeCursors` stage, sends the merge part
//! to the chosen shard, and adopts the single cursor that shard returns;
//! ownership of the producers transfers on the successful send. An
//! exchange fan-out runs one merge per consumer: each consumer shard
//! receives the merge part over its column of producer sub-cursors, and
//! the router drains the consumer cursors in arrival order.

use std::sync::Arc;

use bson::{doc, Bson, Document};
use rand::Rng;
use tessera_core::{
    unix_time_us, CursorId, CursorResponse, Limits, Namespace, OperationContext, Result, ShardId,
};
use tessera_cursor::{
    AsyncResultsMerger, CursorLifetime, CursorRegistry, CursorType, KillSink, MergerParams,
    RemoteCursor, ShardService,
};
use tessera_pipeline::{SplitPipeline, TailableMode};
use tracing::debug;

use crate::cluster_cursor::{BatchResult, ClusterCursor};
use crate::dispatch::{DispatchResult, ExchangeFanout};

/// Picks the merge site for a dispatched pipeline and produces the
/// [`ClusterCursor`] the client will page.
pub struct MergeExecutor {
    service: Arc<dyn ShardService>,
    kill_sink: KillSink,
    limits: Limits,
}

impl MergeExecutor {
    /// Creates a merge executor.
    #[must_use]
    pub fn new(service: Arc<dyn ShardService>, kill_sink: KillSink, limits: Limits) -> Self {
        Self { service, kill_sink, limits }
    }

    /// Builds the cluster cursor for a dispatched split pipeline.
    ///
    /// # Errors
    ///
    /// Propagates the shard-merge command failure; the producer cursors
    /// are then released through their kill-on-drop path, so a failed
    /// merge never strands shard-side cursors.
    pub async fn execute(
        &self,
        namespace: &Namespace,
        split: SplitPipeline,
        mut dispatch: DispatchResult,
    ) -> Result<ClusterCursor> {
        if let Some(fanout) = dispatch.exchange.take() {
            return self.merge_on_consumers(namespace, &split, fanout).await;
        }

        // No shard produced a cursor: the stream is empty and the merge
        // part has nothing to transform.
        if dispatch.cursors.is_empty() {
            let merger = AsyncResultsMerger::new(
                Arc::clone(&self.service),
                self.merger_params(namespace, &split),
                Vec::new(),
            );
            return Ok(ClusterCursor::merged(namespace.clone(), merger, Vec::new()));
        }

        if split.merge_on_router(self.limits.prohibit_router_merge) {
            debug!(namespace = %namespace, producers = dispatch.cursors.len(), "Merging on the router");
            let merger = AsyncResultsMerger::new(
                Arc::clone(&self.service),
                self.merger_params(namespace, &split),
                dispatch.cursors,
            );
            return Ok(ClusterCursor::merged(namespace.clone(), merger, split.merge_part));
        }

        if split.exchange.is_some() {
            // The dispatcher declined the fan-out (merge key off the shard
            // key, or too few targets).
            debug!(namespace = %namespace, "Exchange not installed, merging on one shard");
        }
        let target = Self::pick_merging_shard(&split, &dispatch);
        self.merge_on_shard(namespace, &split, dispatch.cursors, target).await
    }

    /// Drains the first batch and, if the stream survives it, registers
    /// the cursor. An exhausted first batch returns the zero cursor id and
    /// leaves no registry entry behind.
    ///
    /// # Errors
    ///
    /// Propagates batch-assembly failures; the cursor is already killed
    /// when one surfaces.
    pub async fn first_batch(
        &self,
        registry: &CursorRegistry<ClusterCursor>,
        mut cursor: ClusterCursor,
        cursor_type: CursorType,
        lifetime: CursorLifetime,
        batch_size: u32,
        opctx: &OperationContext,
    ) -> Result<CursorResponse> {
        let namespace = cursor.namespace().clone();
        let BatchResult { documents, exhausted } = cursor.next_batch(batch_size, opctx).await?;

        if exhausted {
            return Ok(CursorResponse::new(CursorId::EXHAUSTED, namespace.full_name(), documents));
        }

        let id = registry.register(
            cursor,
            namespace.clone(),
            opctx.users().clone(),
            lifetime,
            cursor_type,
            unix_time_us(),
        );
        debug!(namespace = %namespace, id = id.get(), batch = documents.len(), "Registered cluster cursor");
        Ok(CursorResponse::new(id, namespace.full_name(), documents))
    }

    /// The merging shard: the primary when a merge stage requires it,
    /// otherwise a uniformly random shard among those already holding a
    /// producer cursor.
    fn pick_merging_shard(split: &SplitPipeline, dispatch: &DispatchResult) -> ShardId {
        if split.needs_primary_merge() {
            return dispatch.routing.primary_shard().clone();
        }
        let index = rand::thread_rng().gen_range(0..dispatch.cursors.len());
        dispatch.cursors[index].shard_id().clone()
    }

    /// Sends the merge part to `target` with a `$mergeCursors` head over
    /// the producers, and adopts the cursor the shard returns.
    async fn merge_on_shard(
        &self,
        namespace: &Namespace,
        split: &SplitPipeline,
        producers: Vec<RemoteCursor>,
        target: ShardId,
    ) -> Result<ClusterCursor> {
        let command = Self::merge_command(namespace, split, &producers);
        debug!(namespace = %namespace, target = %target, producers = producers.len(), "Merging on shard");

        // On failure the producers drop here and their kill-on-drop path
        // releases the shard-side cursors.
        let reply = self.service.run_command(&target, command).await?;
        let response = CursorResponse::from_document(&reply)?;

        // The merging shard now owns the producers; dismissing after the
        // successful send keeps the hand-off exactly-once.
        for mut producer in producers {
            producer.dismiss();
        }

        let collection = namespace.coll().unwrap_or("$cmd.aggregate").to_string();
        let remote =
            RemoteCursor::new(target, collection.clone(), response, self.kill_sink.clone());
        let mut params = MergerParams::arrival_order(collection);
        params.tailable_await_data = split.context.tailable == TailableMode::TailableAwaitData;
        let merger =
            AsyncResultsMerger::new(Arc::clone(&self.service), params, vec![remote]);
        // The shard ran the whole merge part; nothing remains router-side.
        Ok(ClusterCursor::merged(namespace.clone(), merger, Vec::new()))
    }

    /// Runs the merge part once per exchange consumer and merges the
    /// consumer cursors in arrival order.
    ///
    /// Consumer `c` receives the `c`-th sub-cursor of every producer, so
    /// each key range is merged exactly once. A failed send drops the
    /// cursors still held here and their kill-on-drop path cleans up.
    async fn merge_on_consumers(
        &self,
        namespace: &Namespace,
        split: &SplitPipeline,
        fanout: ExchangeFanout,
    ) -> Result<ClusterCursor> {
        let consumers = fanout.consumer_shards.len();
        assert!(consumers > 0, "an installed exchange has at least one consumer");
        for row in &fanout.sub_cursors {
            assert!(row.len() == consumers, "every producer opened one sub-cursor per consumer");
        }

        // Transpose the producer-major matrix into per-consumer columns.
        let mut columns: Vec<Vec<RemoteCursor>> = Vec::with_capacity(consumers);
        for _ in 0..consumers {
            columns.push(Vec::with_capacity(fanout.sub_cursors.len()));
        }
        for row in fanout.sub_cursors {
            for (column, cursor) in columns.iter_mut().zip(row) {
                column.push(cursor);
            }
        }

        let collection = namespace.coll().unwrap_or("$cmd.aggregate").to_string();
        let mut adopted: Vec<RemoteCursor> = Vec::with_capacity(consumers);
        for (target, producers) in fanout.consumer_shards.into_iter().zip(columns) {
            let command = Self::merge_command(namespace, split, &producers);
            debug!(
                namespace = %namespace,
                target = %target,
                producers = producers.len(),
                "Merging one exchange partition on its consumer shard"
            );
            let reply = self.service.run_command(&target, command).await?;
            let response = CursorResponse::from_document(&reply)?;
            for mut producer in producers {
                producer.dismiss();
            }
            adopted.push(RemoteCursor::new(
                target,
                collection.clone(),
                response,
                self.kill_sink.clone(),
            ));
        }

        let mut params = MergerParams::arrival_order(collection);
        params.tailable_await_data = split.context.tailable == TailableMode::TailableAwaitData;
        let merger = AsyncResultsMerger::new(Arc::clone(&self.service), params, adopted);
        // The consumers ran the whole merge part; nothing remains
        // router-side.
        Ok(ClusterCursor::merged(namespace.clone(), merger, Vec::new()))
    }

    /// The aggregate command a merging shard receives.
    fn merge_command(
        namespace: &Namespace,
        split: &SplitPipeline,
        producers: &[RemoteCursor],
    ) -> Document {
        let cursors: Vec<Bson> = producers
            .iter()
            .map(|producer| {
                Bson::Document(doc! {
                    "shard": producer.shard_id().as_str(),
                    "id": producer.cursor_id().as_wire(),
                })
            })
            .collect();
        let mut merge_cursors = doc! {
            "ns": namespace.full_name(),
            "cursors": cursors,
        };
        if let Some(sort_key) = &split.sort_key {
            merge_cursors.insert("sortKey", sort_key.clone());
        }

        let mut pipeline = vec![Bson::Document(doc! { "$mergeCursors": merge_cursors })];
        pipeline.extend(split.serialize_merge_part());

        let aggregate: Bson = match namespace.coll() {
            Some(coll) => Bson::String(coll.to_string()),
            None => Bson::Int32(1),
        };
        doc! {
            "aggregate": aggregate,
            "pipeline": pipeline,
            "cursor": { "batchSize": 0 },
            "fromRouter": true,
        }
    }

    fn merger_params(&self, namespace: &Namespace, split: &SplitPipeline) -> MergerParams {
        let collection = namespace.coll().unwrap_or("$cmd.aggregate");
        let mut params = match &split.sort_key {
            Some(sort_key) => MergerParams::sorted(collection, sort_key.clone()),
            None => MergerParams::arrival_order(collection),
        };
        params.tailable_await_data = split.context.tailable == TailableMode::TailableAwaitData;
        params.batch_size = Some(self.limits.default_batch_size);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;
    use tessera_core::{Epoch, Error, ErrorCode};
    use tessera_cursor::start_kill_sink;
    use tessera_pipeline::{Pipeline, PipelineContext, PipelineSplitter, SplitResult, Stage};
    use tessera_routing::RoutingInfo;

    /// Shard double: records commands, answers merges with scripted
    /// replies in order, and counts killCursors.
    struct MergeShards {
        sent: Mutex<Vec<(ShardId, Document)>>,
        merge_replies: Mutex<VecDeque<Result<Document>>>,
        killed: Mutex<Vec<i64>>,
    }

    impl MergeShards {
        fn replying(reply: Result<Document>) -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                merge_replies: Mutex::new(VecDeque::from([reply])),
                killed: Mutex::new(Vec::new()),
            })
        }

        fn queue_reply(&self, reply: Result<Document>) {
            self.merge_replies.lock().unwrap().push_back(reply);
        }
    }

    #[async_trait]
    impl ShardService for MergeShards {
        async fn run_command(&self, shard: &ShardId, command: Document) -> Result<Document> {
            if command.contains_key("killCursors") {
                for id in command.get_array("cursors").unwrap() {
                    self.killed.lock().unwrap().push(id.as_i64().unwrap());
                }
                return Ok(doc! {"ok": 1});
            }
            self.sent.lock().unwrap().push((shard.clone(), command));
            self.merge_replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(Error::new(ErrorCode::HostUnreachable, "unscripted")))
        }
    }

    fn split_of(stages: Vec<Stage>) -> SplitPipeline {
        match PipelineSplitter::new(true)
            .split(Pipeline::new(stages, PipelineContext::default()))
            .unwrap()
        {
            SplitResult::Split(split) => split,
            SplitResult::RouterLocal(_) => panic!("expected a split"),
        }
    }

    fn dispatch_of(sink: &KillSink, producers: Vec<(&str, u64, Vec<Document>)>) -> DispatchResult {
        let targets: Vec<ShardId> =
            producers.iter().map(|(shard, _, _)| ShardId::new(*shard)).collect();
        let cursors = producers
            .into_iter()
            .map(|(shard, id, batch)| {
                RemoteCursor::new(
                    ShardId::new(shard),
                    "coll",
                    CursorResponse::new(CursorId::new(id), "db.coll", batch),
                    sink.clone(),
                )
            })
            .collect();
        DispatchResult {
            cursors,
            unreachable: Vec::new(),
            routing: Arc::new(RoutingInfo::unsharded(
                Namespace::new("db", "coll"),
                Epoch::new(1),
                ShardId::new("primary"),
            )),
            targets,
            exchange: None,
        }
    }

    /// A dispatch whose exchange fanned out over `producers`, each row
    /// holding one sub-cursor id per consumer.
    fn fanout_dispatch(
        sink: &KillSink,
        consumers: Vec<&str>,
        producers: Vec<(&str, Vec<u64>)>,
    ) -> DispatchResult {
        let targets: Vec<ShardId> =
            producers.iter().map(|(shard, _)| ShardId::new(*shard)).collect();
        let sub_cursors = producers
            .into_iter()
            .map(|(shard, ids)| {
                ids.into_iter()
                    .map(|id| {
                        RemoteCursor::new(
                            ShardId::new(shard),
                            "coll",
                            CursorResponse::new(CursorId::new(id), "db.coll", vec![]),
                            sink.clone(),
                        )
                    })
                    .collect()
            })
            .collect();
        DispatchResult {
            cursors: Vec::new(),
            unreachable: Vec::new(),
            routing: Arc::new(RoutingInfo::unsharded(
                Namespace::new("db", "coll"),
                Epoch::new(1),
                ShardId::new("primary"),
            )),
            targets,
            exchange: Some(ExchangeFanout {
                consumer_shards: consumers.into_iter().map(ShardId::new).collect(),
                sub_cursors,
            }),
        }
    }

    fn executor(shards: &Arc<MergeShards>) -> (MergeExecutor, KillSink) {
        let sink = start_kill_sink(Arc::clone(shards) as Arc<dyn ShardService>);
        let executor = MergeExecutor::new(
            Arc::clone(shards) as Arc<dyn ShardService>,
            sink.clone(),
            Limits::default(),
        );
        (executor, sink)
    }

    #[tokio::test]
    async fn test_router_local_merge_orders_globally() {
        let shards = MergeShards::replying(Ok(doc! {"ok": 1}));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::sort(doc! {"_id": 1}), Stage::limit(3)]);
        let dispatch = dispatch_of(
            &sink,
            vec![
                ("s0", 0, vec![doc! {"_id": 2}, doc! {"_id": 5}]),
                ("s1", 0, vec![doc! {"_id": 1}, doc! {"_id": 4}]),
            ],
        );

        let mut cursor = executor.execute(&namespace, split, dispatch).await.unwrap();
        let batch = cursor.next_batch(10, &OperationContext::new()).await.unwrap();
        let ids: Vec<i32> =
            batch.documents.iter().map(|d| d.get_i32("_id").unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 4]);
        assert!(batch.exhausted);
        // No merge command left the router.
        assert!(shards.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_primary_merge_transfers_ownership() {
        let reply =
            CursorResponse::new(CursorId::EXHAUSTED, "db.coll", vec![doc! {"n": 7}])
                .to_document(true);
        let shards = MergeShards::replying(Ok(reply));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::out("results")]);
        let dispatch = dispatch_of(
            &sink,
            vec![("s0", 11, vec![]), ("s1", 12, vec![])],
        );

        let mut cursor = executor.execute(&namespace, split, dispatch).await.unwrap();

        let sent = shards.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (target, command) = &sent[0];
        assert_eq!(target, &ShardId::new("primary"));
        let head = command.get_array("pipeline").unwrap()[0]
            .as_document()
            .unwrap()
            .get_document("$mergeCursors")
            .unwrap();
        assert_eq!(head.get_str("ns").unwrap(), "db.coll");
        assert_eq!(head.get_array("cursors").unwrap().len(), 2);
        drop(sent);

        let batch = cursor.next_batch(10, &OperationContext::new()).await.unwrap();
        assert_eq!(batch.documents, vec![doc! {"n": 7}]);
        assert!(batch.exhausted);

        // Ownership transferred: the producers were dismissed, never killed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(shards.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_arbitrary_merge_targets_a_producer_shard() {
        let reply = CursorResponse::new(CursorId::EXHAUSTED, "db.coll", vec![]).to_document(true);
        let shards = MergeShards::replying(Ok(reply));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::group(doc! {"_id": "$g"})]);
        let dispatch = dispatch_of(&sink, vec![("s0", 11, vec![]), ("s1", 12, vec![])]);

        executor.execute(&namespace, split, dispatch).await.unwrap();

        let sent = shards.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!([ShardId::new("s0"), ShardId::new("s1")].contains(&sent[0].0));
    }

    #[tokio::test]
    async fn test_failed_shard_merge_releases_producers() {
        let shards =
            MergeShards::replying(Err(Error::new(ErrorCode::HostUnreachable, "merger down")));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::group(doc! {"_id": "$g"})]);
        let dispatch = dispatch_of(&sink, vec![("s0", 11, vec![]), ("s1", 12, vec![])]);

        let error = executor.execute(&namespace, split, dispatch).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::HostUnreachable);

        // Both producer cursors went through the kill sink.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut killed = shards.killed.lock().unwrap().clone();
        killed.sort_unstable();
        assert_eq!(killed, vec![11, 12]);
    }

    #[tokio::test]
    async fn test_exchange_merge_sends_one_command_per_consumer() {
        let first = CursorResponse::new(CursorId::EXHAUSTED, "db.coll", vec![doc! {"_id": "a"}])
            .to_document(true);
        let second = CursorResponse::new(CursorId::EXHAUSTED, "db.coll", vec![doc! {"_id": "b"}])
            .to_document(true);
        let shards = MergeShards::replying(Ok(first));
        shards.queue_reply(Ok(second));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::group(doc! {"_id": "$key"})]);
        let dispatch = fanout_dispatch(
            &sink,
            vec!["s0", "s1"],
            vec![("s0", vec![11, 12]), ("s1", vec![21, 22])],
        );

        let mut cursor = executor.execute(&namespace, split, dispatch).await.unwrap();

        let sent = shards.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        // Consumer c merges the c-th sub-cursor of every producer.
        let merged_ids = |command: &Document| -> Vec<i64> {
            command.get_array("pipeline").unwrap()[0]
                .as_document()
                .unwrap()
                .get_document("$mergeCursors")
                .unwrap()
                .get_array("cursors")
                .unwrap()
                .iter()
                .map(|entry| entry.as_document().unwrap().get_i64("id").unwrap())
                .collect()
        };
        assert_eq!(sent[0].0, ShardId::new("s0"));
        assert_eq!(merged_ids(&sent[0].1), vec![11, 21]);
        assert_eq!(sent[1].0, ShardId::new("s1"));
        assert_eq!(merged_ids(&sent[1].1), vec![12, 22]);
        drop(sent);

        let batch = cursor.next_batch(10, &OperationContext::new()).await.unwrap();
        let mut keys: Vec<&str> =
            batch.documents.iter().map(|d| d.get_str("_id").unwrap()).collect();
        keys.sort_unstable();
        assert_eq!(keys, vec!["a", "b"]);
        assert!(batch.exhausted);

        // Every sub-cursor was handed to its consumer, never killed.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(shards.killed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_consumer_merge_releases_every_cursor() {
        let first =
            CursorResponse::new(CursorId::new(77), "db.coll", vec![]).to_document(true);
        let shards = MergeShards::replying(Ok(first));
        shards.queue_reply(Err(Error::new(ErrorCode::HostUnreachable, "consumer down")));
        let (executor, sink) = executor(&shards);
        let namespace = Namespace::new("db", "coll");

        let split = split_of(vec![Stage::group(doc! {"_id": "$key"})]);
        let dispatch = fanout_dispatch(
            &sink,
            vec!["s0", "s1"],
            vec![("s0", vec![11, 12]), ("s1", vec![21, 22])],
        );

        let error = executor.execute(&namespace, split, dispatch).await.unwrap_err();
        assert_eq!(error.code(), ErrorCode::HostUnreachable);

        // The first column transferred before the failure; everything the
        // router still held went through the kill sink: the second column
        // and the adopted consumer cursor.
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut killed = shards.killed.lock().unwrap().clone();
        killed.sort_unstable();
        assert_eq!(killed, vec![12, 22, 77]);
    }

    #[tokio::test]
    async fn test_first_batch_registers_live_stream() {
        let shards = MergeShards::replying(Ok(doc! {"ok": 1}));
        let (executor, _sink) = executor(&shards);
        let registry = CursorRegistry::new(Limits::default());
        let namespace = Namespace::new("db", "coll");

        let cursor = ClusterCursor::local(
            namespace,
            vec![Stage::documents(vec![doc! {"x": 1}, doc! {"x": 2}, doc! {"x": 3}])],
        );
        let response = executor
            .first_batch(
                &registry,
                cursor,
                CursorType::SingleTarget,
                CursorLifetime::Mortal,
                2,
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert!(!response.id.is_exhausted());
        assert_eq!(response.batch.len(), 2);
        assert_eq!(registry.stats().open, 1);
    }

    #[tokio::test]
    async fn test_first_batch_exhausted_leaves_no_entry() {
        let shards = MergeShards::replying(Ok(doc! {"ok": 1}));
        let (executor, _sink) = executor(&shards);
        let registry = CursorRegistry::new(Limits::default());
        let namespace = Namespace::new("db", "coll");

        let cursor =
            ClusterCursor::local(namespace, vec![Stage::documents(vec![doc! {"x": 1}])]);
        let response = executor
            .first_batch(
                &registry,
                cursor,
                CursorType::SingleTarget,
                CursorLifetime::Mortal,
                10,
                &OperationContext::new(),
            )
            .await
            .unwrap();

        assert!(response.id.is_exhausted());
        assert_eq!(response.batch, vec![doc! {"x": 1}]);
        assert_eq!(registry.stats().open, 0);
    }
}
