//! The router command front-end.
//!
//! Three entry points mirror the client-facing command surface:
//! `aggregate` runs the whole split/dispatch/merge flow and answers with a
//! `firstBatch` reply, `get_more` pages a registered cursor under an
//! exclusive lease, and `kill_cursors` classifies the requested ids.
//! Errors never escape as `Err`; every entry point answers with a wire
//! document, `ok: 0` replies carrying the structured error.

use std::sync::Arc;

use bson::{Bson, Document};
use tessera_core::{
    error_to_document, kill_cursors_reply, unix_time_us, Collation, CursorId, CursorResponse,
    Error, ErrorCode, Namespace, OperationContext, Result,
};
use tessera_cursor::{
    start_kill_sink, CursorLifetime, CursorRegistry, CursorType, KillResult, RegistryStats,
    ShardService,
};
use tessera_pipeline::{
    Pipeline, PipelineContext, PipelineSplitter, SplitResult, Stage, TailableMode,
};
use tessera_routing::RoutingTable;
use tracing::{debug, info};

use crate::cluster_cursor::ClusterCursor;
use crate::config::RouterConfig;
use crate::dispatch::Dispatcher;
use crate::merge_exec::MergeExecutor;

/// The query router: one instance per process.
pub struct Router {
    config: RouterConfig,
    splitter: PipelineSplitter,
    dispatcher: Dispatcher,
    executor: MergeExecutor,
    registry: Arc<CursorRegistry<ClusterCursor>>,
}

impl Router {
    /// Creates a router over a routing table and a shard transport, and
    /// starts the cursor reaper.
    #[must_use]
    pub fn new(
        config: RouterConfig,
        table: Arc<RoutingTable>,
        service: Arc<dyn ShardService>,
    ) -> Self {
        let kill_sink = start_kill_sink(Arc::clone(&service));
        let registry = Arc::new(CursorRegistry::new(config.limits));
        registry.start_reaper();
        let dispatcher = Dispatcher::new(
            table,
            Arc::clone(&service),
            kill_sink.clone(),
            config.limits,
        );
        let executor = MergeExecutor::new(service, kill_sink, config.limits);
        info!(
            exchange = config.limits.exchange_enabled,
            prohibit_router_merge = config.limits.prohibit_router_merge,
            "Router started"
        );
        Self {
            config,
            splitter: PipelineSplitter::new(config.limits.exchange_enabled),
            dispatcher,
            executor,
            registry,
        }
    }

    /// Current cursor-registry counters.
    #[must_use]
    pub fn cursor_stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    /// Runs an aggregate command and answers with the wire reply.
    pub async fn aggregate(
        &self,
        db: &str,
        request: &Document,
        opctx: &OperationContext,
    ) -> Document {
        match self.run_aggregate(db, request, opctx).await {
            Ok(reply) => reply,
            Err(error) => error_to_document(&error),
        }
    }

    /// Pages a registered cursor and answers with the wire reply.
    pub async fn get_more(
        &self,
        db: &str,
        request: &Document,
        opctx: &OperationContext,
    ) -> Document {
        match self.run_get_more(db, request, opctx).await {
            Ok(reply) => reply,
            Err(error) => error_to_document(&error),
        }
    }

    /// Kills the requested cursor ids, classifying each one.
    pub fn kill_cursors(&self, request: &Document, opctx: &OperationContext) -> Document {
        let ids = match request.get_array("cursors") {
            Ok(ids) => ids,
            Err(_) => {
                return error_to_document(&Error::new(
                    ErrorCode::FailedToParse,
                    "killCursors requires a cursors array",
                ))
            }
        };

        let mut killed = Vec::new();
        let mut not_found = Vec::new();
        let mut alive = Vec::new();
        for value in ids {
            let Some(raw) = value.as_i64() else {
                return error_to_document(&Error::new(
                    ErrorCode::FailedToParse,
                    "cursor ids must be int64",
                ));
            };
            let id = CursorId::from_wire(raw);
            match self.registry.kill(id, Some(opctx.users())) {
                KillResult::Killed => killed.push(id),
                KillResult::NotFound => not_found.push(id),
                // Ids the caller may not kill are reported alive.
                KillResult::Unauthorized => alive.push(id),
            }
        }
        debug!(
            killed = killed.len(),
            not_found = not_found.len(),
            alive = alive.len(),
            "killCursors"
        );
        kill_cursors_reply(&killed, &not_found, &alive)
    }

    async fn run_aggregate(
        &self,
        db: &str,
        request: &Document,
        opctx: &OperationContext,
    ) -> Result<Document> {
        let namespace = Self::aggregate_namespace(db, request)?;
        let stages = Self::parse_pipeline(request.get_array("pipeline").map_err(|_| {
            Error::new(ErrorCode::FailedToParse, "aggregate requires a pipeline array")
        })?)?;
        let context = PipelineContext {
            collation: request
                .get_document("collation")
                .map_or(Collation::Simple, Collation::from_document),
            explain: request.get_bool("explain").unwrap_or(false),
            ..PipelineContext::default()
        };
        let explain = context.explain;
        let batch_size = Self::requested_batch_size(request)
            .unwrap_or(self.config.limits.default_batch_size);

        let split = self.splitter.split(Pipeline::new(stages, context))?;

        if explain {
            return Ok(self.explain_reply(&namespace, &split));
        }

        match split {
            SplitResult::RouterLocal(pipeline) => {
                let (stages, _) = pipeline.into_parts();
                let cursor = ClusterCursor::local(namespace, stages);
                let response = self
                    .executor
                    .first_batch(
                        &self.registry,
                        cursor,
                        CursorType::SingleTarget,
                        CursorLifetime::Mortal,
                        batch_size,
                        opctx,
                    )
                    .await?;
                Ok(response.to_document(true))
            }
            SplitResult::Split(split) => {
                let dispatch = match self.dispatcher.dispatch(&namespace, &split, opctx).await {
                    // An absent database or collection is an empty result,
                    // not an error.
                    Err(error) if error.code() == ErrorCode::NamespaceNotFound => {
                        debug!(namespace = %namespace, "Aggregate against absent namespace");
                        return Ok(CursorResponse::new(
                            CursorId::EXHAUSTED,
                            namespace.full_name(),
                            Vec::new(),
                        )
                        .to_document(true));
                    }
                    other => other?,
                };

                let cursor_type = if dispatch.targets.len() > 1 {
                    CursorType::MultiTarget
                } else {
                    CursorType::SingleTarget
                };
                // A quiet change stream must survive the idle reaper.
                let lifetime = if split.context.tailable == TailableMode::TailableAwaitData {
                    CursorLifetime::Immortal
                } else {
                    CursorLifetime::Mortal
                };

                let cursor = self.executor.execute(&namespace, split, dispatch).await?;
                let response = self
                    .executor
                    .first_batch(&self.registry, cursor, cursor_type, lifetime, batch_size, opctx)
                    .await?;
                Ok(response.to_document(true))
            }
        }
    }

    async fn run_get_more(
        &self,
        db: &str,
        request: &Document,
        opctx: &OperationContext,
    ) -> Result<Document> {
        let id = CursorId::from_wire(request.get_i64("getMore").map_err(|_| {
            Error::new(ErrorCode::FailedToParse, "getMore requires an int64 cursor id")
        })?);
        let collection = request.get_str("collection").map_err(|_| {
            Error::new(ErrorCode::FailedToParse, "getMore requires a collection name")
        })?;
        let namespace = Namespace::new(db, collection);
        let batch_size = Self::get_more_batch_size(request)
            .unwrap_or(self.config.limits.default_batch_size);

        let mut cursor = self.registry.check_out(id, opctx.users(), unix_time_us())?;
        if cursor.namespace() != &namespace {
            self.registry.check_in(id, cursor, unix_time_us());
            return Err(Error::cursor_not_found(id.get()));
        }

        match cursor.next_batch(batch_size, opctx).await {
            Ok(batch) => {
                let reply_id = if batch.exhausted {
                    self.registry.retire(id);
                    CursorId::EXHAUSTED
                } else {
                    self.registry.check_in(id, cursor, unix_time_us());
                    id
                };
                Ok(CursorResponse::new(reply_id, namespace.full_name(), batch.documents)
                    .to_document(false))
            }
            // The cursor killed its remotes before surfacing the error;
            // drop the registry entry with it.
            Err(error) => {
                self.registry.retire(id);
                Err(error)
            }
        }
    }

    /// The namespace of an aggregate request: a collection name, or the
    /// integer 1 for collectionless aggregates.
    fn aggregate_namespace(db: &str, request: &Document) -> Result<Namespace> {
        match request.get("aggregate") {
            Some(Bson::String(coll)) => Ok(Namespace::new(db, coll.as_str())),
            Some(Bson::Int32(1)) | Some(Bson::Int64(1)) => Ok(Namespace::collectionless(db)),
            _ => Err(Error::new(
                ErrorCode::FailedToParse,
                "aggregate requires a collection name or 1",
            )),
        }
    }

    /// The batch size of an aggregate request, from the `cursor`
    /// sub-document.
    fn requested_batch_size(request: &Document) -> Option<u32> {
        let cursor = request.get_document("cursor").ok()?;
        Self::batch_size_value(cursor.get("batchSize")?)
    }

    /// The batch size of a getMore request. Unlike aggregate, getMore
    /// carries `batchSize` at the top level of the command.
    fn get_more_batch_size(request: &Document) -> Option<u32> {
        Self::batch_size_value(request.get("batchSize")?)
    }

    fn batch_size_value(requested: &Bson) -> Option<u32> {
        let requested = requested
            .as_i64()
            .or_else(|| requested.as_i32().map(i64::from))?;
        u32::try_from(requested).ok()
    }

    /// Builds the recognized stages from the wire pipeline array.
    fn parse_pipeline(wire: &[Bson]) -> Result<Vec<Stage>> {
        let mut stages = Vec::with_capacity(wire.len());
        for (index, value) in wire.iter().enumerate() {
            let spec = value.as_document().ok_or_else(|| {
                Error::new(ErrorCode::FailedToParse, "pipeline stages must be documents")
            })?;
            let mut fields = spec.iter();
            let (name, body) = fields.next().ok_or_else(|| {
                Error::new(ErrorCode::FailedToParse, "empty pipeline stage")
            })?;
            if fields.next().is_some() {
                return Err(Error::new(
                    ErrorCode::FailedToParse,
                    "a pipeline stage must have exactly one field",
                ));
            }

            let stage = Self::parse_stage(name, body)?;
            // Source stages are only valid at the head; rejecting here
            // keeps the wire error structured instead of a panic deeper in.
            if index > 0 && !stage.constraints().requires_input {
                return Err(Error::new(
                    ErrorCode::FailedToParse,
                    format!("{name} is only valid as the first stage"),
                ));
            }
            stages.push(stage);
        }
        Ok(stages)
    }

    fn parse_stage(name: &str, body: &Bson) -> Result<Stage> {
        let document_body = |what: &str| -> Result<Document> {
            body.as_document().cloned().ok_or_else(|| {
                Error::new(ErrorCode::FailedToParse, format!("{what} requires a document"))
            })
        };
        match name {
            "$match" => Ok(Stage::match_stage(document_body("$match")?)),
            "$sort" => Ok(Stage::sort(document_body("$sort")?)),
            "$group" => Ok(Stage::group(document_body("$group")?)),
            "$changeStream" => Ok(Stage::change_stream(document_body("$changeStream")?)),
            "$limit" => match body.as_i64().or_else(|| body.as_i32().map(i64::from)) {
                Some(limit) if limit > 0 => Ok(Stage::limit(limit)),
                _ => Err(Error::new(
                    ErrorCode::FailedToParse,
                    "$limit requires a positive integer",
                )),
            },
            "$skip" => match body.as_i64().or_else(|| body.as_i32().map(i64::from)) {
                Some(skip) if skip >= 0 => Ok(Stage::skip(skip)),
                _ => Err(Error::new(
                    ErrorCode::FailedToParse,
                    "$skip requires a non-negative integer",
                )),
            },
            "$out" => match body.as_str() {
                Some(target) => Ok(Stage::out(target)),
                None => Err(Error::new(
                    ErrorCode::FailedToParse,
                    "$out requires a collection name",
                )),
            },
            "$documents" => {
                let array = body.as_array().ok_or_else(|| {
                    Error::new(ErrorCode::FailedToParse, "$documents requires an array")
                })?;
                let docs: Option<Vec<Document>> =
                    array.iter().map(|v| v.as_document().cloned()).collect();
                docs.map(Stage::documents).ok_or_else(|| {
                    Error::new(ErrorCode::FailedToParse, "$documents entries must be documents")
                })
            }
            unknown => Err(Error::new(
                ErrorCode::FailedToParse,
                format!("unrecognized pipeline stage {unknown}"),
            )),
        }
    }

    /// The explain reply: the plan the router would run, without running
    /// it.
    fn explain_reply(&self, namespace: &Namespace, split: &SplitResult) -> Document {
        match split {
            SplitResult::RouterLocal(pipeline) => bson::doc! {
                "ns": namespace.full_name(),
                "mergeType": "local",
                "splitPipeline": Bson::Null,
                "pipeline": pipeline.serialize(),
                "ok": 1,
            },
            SplitResult::Split(split) => {
                let merge_type = if split.merge_on_router(self.config.limits.prohibit_router_merge)
                {
                    "router"
                } else if split.needs_primary_merge() {
                    "primaryShard"
                } else {
                    "anyShard"
                };
                bson::doc! {
                    "ns": namespace.full_name(),
                    "mergeType": merge_type,
                    "splitPipeline": {
                        "shardsPart": split.serialize_shards_part(),
                        "mergePart": split.serialize_merge_part(),
                    },
                    "exchange": split.exchange.is_some(),
                    "ok": 1,
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bson::doc;
    use std::sync::Mutex;
    use tessera_core::{Epoch, ShardId};
    use tessera_routing::{CatalogClient, RoutingInfo};

    /// Catalog double serving one unsharded namespace.
    struct OneDatabase {
        known: Namespace,
    }

    #[async_trait]
    impl CatalogClient for OneDatabase {
        async fn fetch_routing_info(&self, namespace: &Namespace) -> Result<RoutingInfo> {
            if namespace == &self.known {
                Ok(RoutingInfo::unsharded(
                    namespace.clone(),
                    Epoch::new(1),
                    ShardId::new("shard-0"),
                ))
            } else {
                Err(Error::namespace_not_found(namespace))
            }
        }
    }

    /// Shard double answering every aggregate with one scripted, already
    /// exhausted cursor.
    struct OneShotShard {
        first_batch: Vec<Document>,
        aggregates: Mutex<u32>,
    }

    #[async_trait]
    impl ShardService for OneShotShard {
        async fn run_command(&self, _shard: &ShardId, command: Document) -> Result<Document> {
            if command.contains_key("killCursors") {
                return Ok(doc! {"ok": 1});
            }
            assert!(command.contains_key("aggregate"), "unexpected command");
            *self.aggregates.lock().unwrap() += 1;
            Ok(
                CursorResponse::new(CursorId::EXHAUSTED, "db.coll", self.first_batch.clone())
                    .to_document(true),
            )
        }
    }

    fn router_with(first_batch: Vec<Document>) -> (Router, Arc<OneShotShard>) {
        let shard = Arc::new(OneShotShard {
            first_batch,
            aggregates: Mutex::new(0),
        });
        let table = Arc::new(RoutingTable::new(Arc::new(OneDatabase {
            known: Namespace::new("db", "coll"),
        })));
        let router = Router::new(
            RouterConfig::default(),
            table,
            Arc::clone(&shard) as Arc<dyn ShardService>,
        );
        (router, shard)
    }

    fn sorted_docs(n: i32) -> Vec<Document> {
        (1..=n).map(|i| doc! {"_id": i}).collect()
    }

    #[tokio::test]
    async fn test_aggregate_exhausted_in_first_batch() {
        let (router, _shard) = router_with(sorted_docs(2));
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$sort": {"_id": 1}}],
            "cursor": {"batchSize": 10},
        };

        let reply = router.aggregate("db", &request, &OperationContext::new()).await;
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 2);
        assert_eq!(router.cursor_stats().open, 0);
    }

    #[tokio::test]
    async fn test_get_more_lease_cycle() {
        let (router, _shard) = router_with(sorted_docs(5));
        let opctx = OperationContext::new();
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$sort": {"_id": 1}}],
            "cursor": {"batchSize": 2},
        };

        let reply = router.aggregate("db", &request, &opctx).await;
        let cursor = reply.get_document("cursor").unwrap();
        let id = cursor.get_i64("id").unwrap();
        assert_ne!(id, 0);
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 2);
        assert_eq!(router.cursor_stats().open, 1);

        let get_more = doc! {"getMore": id, "collection": "coll", "batchSize": 2};
        let reply = router.get_more("db", &get_more, &opctx).await;
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), id);
        let batch = cursor.get_array("nextBatch").unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].as_document().unwrap().get_i32("_id").unwrap(), 3);

        // The final page drains the stream and retires the entry.
        let reply = router.get_more("db", &get_more, &opctx).await;
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
        assert_eq!(cursor.get_array("nextBatch").unwrap().len(), 1);
        assert_eq!(router.cursor_stats().open, 0);

        // A fourth page finds nothing.
        let reply = router.get_more("db", &get_more, &opctx).await;
        assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::CursorNotFound.code());
    }

    #[tokio::test]
    async fn test_get_more_enforces_owning_users() {
        let (router, _shard) = router_with(sorted_docs(5));
        let alice = OperationContext::new().with_user("alice");
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$sort": {"_id": 1}}],
            "cursor": {"batchSize": 2},
        };
        let reply = router.aggregate("db", &request, &alice).await;
        let id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
        assert_ne!(id, 0);

        let get_more = doc! {"getMore": id, "collection": "coll", "batchSize": 2};
        let bob = OperationContext::new().with_user("bob");
        let reply = router.get_more("db", &get_more, &bob).await;
        assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::Unauthorized.code());

        // The failed attempt did not consume the lease or the stream.
        let reply = router.get_more("db", &get_more, &alice).await;
        let cursor = reply.get_document("cursor").unwrap();
        let batch = cursor.get_array("nextBatch").unwrap();
        assert_eq!(batch[0].as_document().unwrap().get_i32("_id").unwrap(), 3);
    }

    #[tokio::test]
    async fn test_kill_cursors_classification() {
        let (router, _shard) = router_with(sorted_docs(5));
        let alice = OperationContext::new().with_user("alice");
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$sort": {"_id": 1}}],
            "cursor": {"batchSize": 2},
        };
        let own = router.aggregate("db", &request, &alice).await;
        let own_id = own.get_document("cursor").unwrap().get_i64("id").unwrap();
        let other = router.aggregate("db", &request, &OperationContext::new().with_user("carol")).await;
        let other_id = other.get_document("cursor").unwrap().get_i64("id").unwrap();

        let reply = router.kill_cursors(
            &doc! {"killCursors": "coll", "cursors": [own_id, 424_242i64, other_id]},
            &alice,
        );
        assert_eq!(reply.get_array("cursorsKilled").unwrap(), &vec![Bson::Int64(own_id)]);
        assert_eq!(
            reply.get_array("cursorsNotFound").unwrap(),
            &vec![Bson::Int64(424_242)]
        );
        assert_eq!(reply.get_array("cursorsAlive").unwrap(), &vec![Bson::Int64(other_id)]);
        assert_eq!(router.cursor_stats().open, 1);
    }

    #[tokio::test]
    async fn test_absent_namespace_is_empty_ok() {
        let (router, shard) = router_with(sorted_docs(5));
        let request = doc! {
            "aggregate": "nothere",
            "pipeline": [{"$match": {"x": 1}}],
            "cursor": {"batchSize": 10},
        };

        let reply = router.aggregate("db", &request, &OperationContext::new()).await;
        assert_eq!(reply.get_i32("ok").unwrap(), 1);
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
        assert!(cursor.get_array("firstBatch").unwrap().is_empty());
        assert_eq!(*shard.aggregates.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_stage_fails_to_parse() {
        let (router, shard) = router_with(sorted_docs(5));
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$frobnicate": {}}],
            "cursor": {},
        };

        let reply = router.aggregate("db", &request, &OperationContext::new()).await;
        assert_eq!(reply.get_i32("ok").unwrap(), 0);
        assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::FailedToParse.code());
        assert_eq!(*shard.aggregates.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_explain_returns_plan_without_running() {
        let (router, shard) = router_with(sorted_docs(5));
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$sort": {"_id": 1}}, {"$limit": 3}],
            "cursor": {},
            "explain": true,
        };

        let reply = router.aggregate("db", &request, &OperationContext::new()).await;
        assert_eq!(reply.get_str("mergeType").unwrap(), "router");
        let plan = reply.get_document("splitPipeline").unwrap();
        assert!(!plan.get_array("shardsPart").unwrap().is_empty());
        assert!(!plan.get_array("mergePart").unwrap().is_empty());
        assert_eq!(*shard.aggregates.lock().unwrap(), 0);
        assert_eq!(router.cursor_stats().open, 0);
    }

    #[tokio::test]
    async fn test_router_local_documents_pipeline() {
        let (router, shard) = router_with(Vec::new());
        let request = doc! {
            "aggregate": 1,
            "pipeline": [
                {"$documents": [{"x": 1}, {"x": 2}, {"x": 3}]},
                {"$limit": 2},
            ],
            "cursor": {"batchSize": 10},
        };

        let reply = router.aggregate("db", &request, &OperationContext::new()).await;
        let cursor = reply.get_document("cursor").unwrap();
        assert_eq!(cursor.get_i64("id").unwrap(), 0);
        assert_eq!(cursor.get_array("firstBatch").unwrap().len(), 2);
        // No shard was contacted.
        assert_eq!(*shard.aggregates.lock().unwrap(), 0);
    }
}
