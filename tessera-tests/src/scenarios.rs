//! End-to-end command flows over the in-memory shard set: aggregation
//! merges, stale-routing recovery, paging, change streams, and cloning.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tessera_clone::{BulkLoader, CloneError, ClonerOptions, CollectionCloner, LoaderError};
use tessera_core::{Error, ErrorCode, Limits, Namespace, OperationContext, ShardId};
use tessera_cursor::start_kill_sink;
use tessera_router::{Router, RouterConfig};
use tessera_routing::{Chunk, RoutingTable};

use crate::mock_shard_set::{MockCatalog, MockShardSet, ScriptedReply};

fn shard(name: &str) -> ShardId {
    ShardId::new(name)
}

/// `_id` chunks: `(-inf, 3)` on shard-0, `[3, 4)` on shard-1,
/// `[4, +inf)` on shard-2.
fn three_shard_chunks() -> Vec<Chunk> {
    vec![
        Chunk::new(Bson::MinKey, bson::bson!(3), shard("shard-0")),
        Chunk::new(bson::bson!(3), bson::bson!(4), shard("shard-1")),
        Chunk::new(bson::bson!(4), Bson::MaxKey, shard("shard-2")),
    ]
}

/// Six documents spread per the chunk layout, three of them in group "a".
fn three_shard_set() -> Arc<MockShardSet> {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1, "g": "a"}, doc! {"_id": 2, "g": "b"}]);
    mock.add_shard(shard("shard-1"), vec![doc! {"_id": 3, "g": "a"}]);
    mock.add_shard(
        shard("shard-2"),
        vec![doc! {"_id": 4, "g": "b"}, doc! {"_id": 5, "g": "a"}, doc! {"_id": 6, "g": "b"}],
    );
    mock
}

fn router_over(mock: &Arc<MockShardSet>) -> (Arc<Router>, Arc<RoutingTable>, Arc<MockCatalog>) {
    let catalog = Arc::new(MockCatalog::sharded("_id", shard("shard-0"), three_shard_chunks()));
    let table = Arc::new(RoutingTable::new(
        Arc::clone(&catalog) as Arc<dyn tessera_routing::CatalogClient>
    ));
    let router = Arc::new(Router::new(
        RouterConfig::default(),
        Arc::clone(&table),
        Arc::clone(mock) as Arc<dyn tessera_cursor::ShardService>,
    ));
    (router, table, catalog)
}

fn batch_ids(reply: &Document, field: &str) -> Vec<i32> {
    reply
        .get_document("cursor")
        .unwrap()
        .get_array(field)
        .unwrap()
        .iter()
        .map(|d| d.as_document().unwrap().get_i32("_id").unwrap())
        .collect()
}

#[tokio::test]
async fn test_filter_broadcast_merges_in_any_order() {
    let mock = three_shard_set();
    let (router, _table, _catalog) = router_over(&mock);

    // The predicate is not on the chunk key, so every shard is targeted.
    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$match": {"g": "a"}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    let mut ids = batch_ids(&reply, "firstBatch");
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 3, 5]);

    for name in ["shard-0", "shard-1", "shard-2"] {
        assert_eq!(mock.aggregates_to(&shard(name)).len(), 1, "{name} was not targeted once");
    }
    assert_eq!(router.cursor_stats().open, 0);
    assert_eq!(mock.open_cursors(), 0);
}

#[tokio::test]
async fn test_sorted_limit_merge_kills_surplus_remote() {
    let mock = three_shard_set();
    // A small server batch keeps shard-2's cursor alive past the limit.
    mock.set_get_more_cap(2);
    let (router, _table, _catalog) = router_over(&mock);

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$sort": {"_id": 1}}, {"$limit": 4}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    assert_eq!(batch_ids(&reply, "firstBatch"), vec![1, 2, 3, 4]);

    // Shard-2 still held a live server cursor when the limit was reached;
    // the router killed exactly that one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let kills = mock.kills();
    assert_eq!(kills.len(), 1);
    assert_eq!(kills[0].0, shard("shard-2"));
    assert_eq!(mock.open_cursors(), 0);
}

#[tokio::test]
async fn test_stale_version_refreshes_once_and_retries() {
    let mock = three_shard_set();
    let (router, table, catalog) = router_over(&mock);
    let namespace = Namespace::new("db", "coll");

    // Warm the cache at epoch 1, then move the catalog ahead so the shard's
    // stale reply is resolved by a refresh.
    table.lookup(&namespace).await.unwrap();
    catalog.set_epoch(2);
    mock.fail_next_aggregate(
        &shard("shard-0"),
        Error::new(ErrorCode::StaleShardVersion, "epoch advanced"),
    );

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$match": {"_id": 1}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    assert_eq!(batch_ids(&reply, "firstBatch"), vec![1]);
    assert_eq!(reply.get_document("cursor").unwrap().get_i64("id").unwrap(), 0);

    // Two sends to the stale shard; only the second carries the refreshed
    // epoch. The table went upstream once to warm and once to refresh.
    let sent = mock.aggregates_to(&shard("shard-0"));
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].get_document("shardVersion").unwrap().get_i64("epoch").unwrap(), 1);
    assert_eq!(sent[1].get_document("shardVersion").unwrap().get_i64("epoch").unwrap(), 2);
    assert_eq!(table.upstream_fetches(), 2);
    // The predicate targeted the owning shard only.
    assert!(mock.aggregates_to(&shard("shard-1")).is_empty());
    assert!(mock.aggregates_to(&shard("shard-2")).is_empty());
}

#[tokio::test]
async fn test_cursor_ownership_spans_get_more() {
    let mock = three_shard_set();
    let (router, _table, _catalog) = router_over(&mock);
    let opctx = OperationContext::new();

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$sort": {"_id": 1}}],
        "cursor": {"batchSize": 2},
    };
    let reply = router.aggregate("db", &request, &opctx).await;
    let id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    assert_ne!(id, 0);
    assert_eq!(batch_ids(&reply, "firstBatch"), vec![1, 2]);
    assert_eq!(router.cursor_stats().open, 1);

    let get_more = doc! {"getMore": id, "collection": "coll", "batchSize": 2};
    let reply = router.get_more("db", &get_more, &opctx).await;
    assert_eq!(reply.get_document("cursor").unwrap().get_i64("id").unwrap(), id);
    assert_eq!(batch_ids(&reply, "nextBatch"), vec![3, 4]);

    let reply = router.get_more("db", &get_more, &opctx).await;
    assert_eq!(batch_ids(&reply, "nextBatch"), vec![5, 6]);

    // The stream drained exactly at the page boundary; the next page
    // reports exhaustion and retires the registry entry.
    let reply = router.get_more("db", &get_more, &opctx).await;
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    assert!(cursor.get_array("nextBatch").unwrap().is_empty());
    assert_eq!(router.cursor_stats().open, 0);

    let reply = router.get_more("db", &get_more, &opctx).await;
    assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::CursorNotFound.code());
}

fn has_merge_cursors_head(command: &Document) -> bool {
    command
        .get_array("pipeline")
        .ok()
        .and_then(|pipeline| pipeline.first())
        .and_then(Bson::as_document)
        .is_some_and(|head| head.contains_key("$mergeCursors"))
}

#[tokio::test]
async fn test_group_merge_transfers_ownership_to_a_shard() {
    let mock = three_shard_set();
    let (router, _table, _catalog) = router_over(&mock);

    // "g" is not the chunk key, so the group merges on one shard over a
    // $mergeCursors head instead of fanning out.
    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$group": {"_id": "$g"}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    let mut keys: Vec<&str> = cursor
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|d| d.as_document().unwrap().get_str("_id").unwrap())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a", "b"]);

    let mut merges = 0;
    for name in ["shard-0", "shard-1", "shard-2"] {
        for command in mock.aggregates_to(&shard(name)) {
            assert!(!command.contains_key("exchange"));
            if has_merge_cursors_head(&command) {
                merges += 1;
            }
        }
    }
    assert_eq!(merges, 1, "exactly one shard ran the merge");

    // The producers were handed to the merging shard, never killed.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mock.kills().is_empty());
    assert_eq!(mock.open_cursors(), 0);
    assert_eq!(router.cursor_stats().open, 0);
}

#[tokio::test]
async fn test_group_on_the_chunk_key_fans_out_across_consumers() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1, "g": "a"}, doc! {"_id": 2, "g": "b"}]);
    mock.add_shard(shard("shard-1"), vec![doc! {"_id": 3, "g": "a"}, doc! {"_id": 4, "g": "b"}]);
    let catalog = Arc::new(MockCatalog::sharded(
        "g",
        shard("shard-0"),
        vec![
            Chunk::new(Bson::MinKey, bson::bson!("b"), shard("shard-0")),
            Chunk::new(bson::bson!("b"), Bson::MaxKey, shard("shard-1")),
        ],
    ));
    let table = Arc::new(RoutingTable::new(
        Arc::clone(&catalog) as Arc<dyn tessera_routing::CatalogClient>
    ));
    let router = Arc::new(Router::new(
        RouterConfig::default(),
        table,
        Arc::clone(&mock) as Arc<dyn tessera_cursor::ShardService>,
    ));

    // The group key is the chunk key: each key range merges on its own
    // consumer shard, and no group may appear twice.
    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$group": {"_id": "$g"}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    let mut keys: Vec<&str> = cursor
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|d| d.as_document().unwrap().get_str("_id").unwrap())
        .collect();
    keys.sort_unstable();
    assert_eq!(keys, vec!["a", "b"]);

    for name in ["shard-0", "shard-1"] {
        let commands = mock.aggregates_to(&shard(name));
        let producer: Vec<&Document> =
            commands.iter().filter(|c| c.contains_key("exchange")).collect();
        assert_eq!(producer.len(), 1, "{name} produced once");
        let exchange = producer[0].get_document("exchange").unwrap();
        assert_eq!(exchange.get_i64("consumers").unwrap(), 2);
        let merges = commands.iter().filter(|c| has_merge_cursors_head(c)).count();
        assert_eq!(merges, 1, "{name} hosted one consumer merge");
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(mock.kills().is_empty());
    assert_eq!(mock.open_cursors(), 0);
    assert_eq!(router.cursor_stats().open, 0);
}

#[tokio::test]
async fn test_change_stream_gates_on_lagging_shard() {
    let mock = three_shard_set();
    let (router, _table, _catalog) = router_over(&mock);

    let event = |ct: i32, key: i32| {
        doc! {
            "clusterTime": ct,
            "uuid": 1,
            "documentKey": {"_id": key},
            "operationType": "insert",
        }
    };
    mock.script_get_more(
        &shard("shard-0"),
        ScriptedReply::Batch {
            documents: vec![event(100, 1)],
            high_water_mark: Some(doc! {"clusterTime": 103}),
        },
    );
    mock.script_get_more(
        &shard("shard-1"),
        ScriptedReply::Batch {
            documents: vec![event(101, 2)],
            high_water_mark: Some(doc! {"clusterTime": 103}),
        },
    );

    let router_task = Arc::clone(&router);
    let handle = tokio::spawn(async move {
        let request = doc! {
            "aggregate": "coll",
            "pipeline": [{"$changeStream": {}}],
            "cursor": {"batchSize": 4},
        };
        router_task.aggregate("db", &request, &OperationContext::new()).await
    });

    // Shard-2 has said nothing, so even the ct 100 event must be held back.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!handle.is_finished(), "merge released events past a lagging shard");

    // An empty batch whose high water mark passes both buffered events
    // unblocks the merge without shard-2 producing anything.
    mock.script_get_more(
        &shard("shard-2"),
        ScriptedReply::Batch {
            documents: vec![],
            high_water_mark: Some(doc! {"clusterTime": 102}),
        },
    );

    let reply = handle.await.unwrap();
    let cursor = reply.get_document("cursor").unwrap();
    let id = cursor.get_i64("id").unwrap();
    assert_ne!(id, 0, "a change stream cursor stays open");
    let times: Vec<i32> = cursor
        .get_array("firstBatch")
        .unwrap()
        .iter()
        .map(|d| d.as_document().unwrap().get_i32("clusterTime").unwrap())
        .collect();
    assert_eq!(times, vec![100, 101]);
    assert_eq!(router.cursor_stats().open, 1);

    let reply =
        router.kill_cursors(&doc! {"killCursors": "coll", "cursors": [id]}, &OperationContext::new());
    assert_eq!(reply.get_array("cursorsKilled").unwrap().len(), 1);
    assert_eq!(router.cursor_stats().open, 0);
}

/// Loader double recording inserts and lifecycle calls.
#[derive(Default)]
struct RecordingLoader {
    initialized: AtomicBool,
    committed: AtomicBool,
    aborted: AtomicBool,
    inserted: Mutex<Vec<Document>>,
}

#[async_trait]
impl BulkLoader for RecordingLoader {
    async fn init(
        &self,
        _options: &Document,
        _id_index: Option<&Document>,
        _secondary_indexes: &[Document],
    ) -> Result<(), LoaderError> {
        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn insert_documents(&self, documents: Vec<Document>) -> Result<(), LoaderError> {
        self.inserted.lock().unwrap().extend(documents);
        Ok(())
    }

    async fn commit(&self) -> Result<(), LoaderError> {
        self.committed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

fn cloner_over(
    mock: &Arc<MockShardSet>,
    loader: &Arc<RecordingLoader>,
    limits: Limits,
) -> CollectionCloner {
    let sink = start_kill_sink(Arc::clone(mock) as Arc<dyn tessera_cursor::ShardService>);
    CollectionCloner::new(
        Arc::clone(mock) as Arc<dyn tessera_cursor::ShardService>,
        Arc::clone(loader) as Arc<dyn BulkLoader>,
        sink,
        ClonerOptions::new(shard("source"), Namespace::new("db", "coll")),
        limits,
    )
}

fn source_docs(n: i32) -> Vec<Document> {
    (0..n).map(|i| doc! {"_id": i}).collect()
}

#[tokio::test]
async fn test_clone_with_two_parallel_cursors() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("source"), source_docs(1_000));
    mock.set_scan_split(vec![600, 400]);
    mock.set_get_more_cap(250);
    let loader = Arc::new(RecordingLoader::default());

    let mut limits = Limits::default();
    limits.max_cloner_cursors = 2;
    limits.backoff_base_ms = 1;
    let cloner = cloner_over(&mock, &loader, limits);

    let stats = cloner.run(&OperationContext::new()).await.unwrap();

    assert_eq!(stats.expected_documents, 1_000);
    assert_eq!(stats.documents_copied, 1_000);
    assert_eq!(stats.indexes_built, 1);
    assert!(loader.committed.load(Ordering::SeqCst));
    assert!(!loader.aborted.load(Ordering::SeqCst));

    // Interleaving across the two scan cursors is arbitrary, but every
    // document arrives exactly once.
    let mut ids: Vec<i32> = loader
        .inserted
        .lock()
        .unwrap()
        .iter()
        .map(|d| d.get_i32("_id").unwrap())
        .collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..1_000).collect::<Vec<i32>>());
    assert_eq!(mock.open_cursors(), 0);
}

#[tokio::test]
async fn test_clone_source_failure_aborts_loader() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("source"), source_docs(1_000));
    mock.set_get_more_cap(250);
    // The source drops the connection mid-stream.
    mock.die_after_serving(&shard("source"), 500);
    let loader = Arc::new(RecordingLoader::default());

    let mut limits = Limits::default();
    limits.backoff_base_ms = 1;
    let cloner = cloner_over(&mock, &loader, limits);

    let error = cloner.run(&OperationContext::new()).await.unwrap_err();
    assert!(matches!(error, CloneError::Source { phase: "getMore", .. }));

    assert!(loader.initialized.load(Ordering::SeqCst));
    assert!(loader.aborted.load(Ordering::SeqCst));
    assert!(!loader.committed.load(Ordering::SeqCst));
    // Everything served before the failure had been handed to the loader.
    assert_eq!(loader.inserted.lock().unwrap().len(), 500);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(mock.kills().len(), 1);
    assert_eq!(mock.open_cursors(), 0);
}
