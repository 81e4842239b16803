//! Cross-cutting invariants: paging partitions the stream, failed
//! dispatches leave no orphan cursors, shard commands carry the expected
//! shape, and routing staleness is bounded by the retry budget.

use std::sync::Arc;
use std::time::Duration;

use bson::{doc, Bson, Document};
use tessera_core::{Error, ErrorCode, OperationContext, ShardId};
use tessera_router::{Router, RouterConfig};
use tessera_routing::{Chunk, RoutingTable};

use crate::mock_shard_set::{MockCatalog, MockShardSet};

fn shard(name: &str) -> ShardId {
    ShardId::new(name)
}

fn router_with_chunks(
    mock: &Arc<MockShardSet>,
    chunks: Vec<Chunk>,
) -> (Arc<Router>, Arc<RoutingTable>) {
    let catalog = Arc::new(MockCatalog::sharded("_id", shard("shard-0"), chunks));
    let table = Arc::new(RoutingTable::new(catalog as Arc<dyn tessera_routing::CatalogClient>));
    let router = Arc::new(Router::new(
        RouterConfig::default(),
        Arc::clone(&table),
        Arc::clone(mock) as Arc<dyn tessera_cursor::ShardService>,
    ));
    (router, table)
}

fn full_range_chunks() -> Vec<Chunk> {
    vec![
        Chunk::new(Bson::MinKey, bson::bson!(3), shard("shard-0")),
        Chunk::new(bson::bson!(3), bson::bson!(4), shard("shard-1")),
        Chunk::new(bson::bson!(4), Bson::MaxKey, shard("shard-2")),
    ]
}

fn ids_of(reply: &Document, field: &str) -> Vec<i32> {
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
async fn test_paging_partitions_the_stream() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1}, doc! {"_id": 4}, doc! {"_id": 7}]);
    mock.add_shard(shard("shard-1"), vec![doc! {"_id": 2}, doc! {"_id": 5}, doc! {"_id": 8}]);
    mock.add_shard(shard("shard-2"), vec![doc! {"_id": 3}, doc! {"_id": 6}, doc! {"_id": 9}]);
    // One document per server batch maximizes the interleaving of buffer
    // refills with releases.
    mock.set_get_more_cap(1);
    let (router, _table) = router_with_chunks(&mock, full_range_chunks());
    let opctx = OperationContext::new();

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$sort": {"_id": 1}}],
        "cursor": {"batchSize": 4},
    };
    let reply = router.aggregate("db", &request, &opctx).await;
    let mut collected = ids_of(&reply, "firstBatch");
    let mut id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();

    while id != 0 {
        let reply = router
            .get_more("db", &doc! {"getMore": id, "collection": "coll", "batchSize": 4}, &opctx)
            .await;
        collected.extend(ids_of(&reply, "nextBatch"));
        id = reply.get_document("cursor").unwrap().get_i64("id").unwrap();
    }

    // No page re-delivers and none skips: the pages partition the sorted
    // stream exactly.
    assert_eq!(collected, (1..=9).collect::<Vec<i32>>());
    assert_eq!(router.cursor_stats().open, 0);
    assert_eq!(mock.open_cursors(), 0);
}

#[tokio::test]
async fn test_failed_dispatch_leaves_no_orphan_cursors() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1}]);
    mock.add_shard(shard("shard-1"), vec![doc! {"_id": 2}]);
    mock.add_shard(shard("shard-2"), vec![doc! {"_id": 3}]);
    mock.fail_next_aggregate(
        &shard("shard-2"),
        Error::new(ErrorCode::FailedToParse, "shard rejected the pipeline"),
    );
    let (router, _table) = router_with_chunks(&mock, full_range_chunks());

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$sort": {"_id": 1}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;
    assert_eq!(reply.get_i32("ok").unwrap(), 0);
    assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::FailedToParse.code());

    // The two cursors that did open were killed with the dispatch.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut killed_shards: Vec<ShardId> = mock.kills().into_iter().map(|(s, _)| s).collect();
    killed_shards.sort();
    assert_eq!(killed_shards, vec![shard("shard-0"), shard("shard-1")]);
    assert_eq!(mock.open_cursors(), 0);
    assert_eq!(router.cursor_stats().open, 0);
}

#[tokio::test]
async fn test_shard_commands_carry_the_establishment_shape() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1, "g": "a"}]);
    mock.add_shard(shard("shard-1"), vec![doc! {"_id": 3, "g": "a"}]);
    mock.add_shard(shard("shard-2"), vec![doc! {"_id": 5, "g": "a"}]);
    let (router, _table) = router_with_chunks(&mock, full_range_chunks());

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$match": {"g": "a"}}],
        "cursor": {"batchSize": 10},
    };
    router.aggregate("db", &request, &OperationContext::new()).await;

    let sent = mock.aggregates_to(&shard("shard-0"));
    assert_eq!(sent.len(), 1);
    let command = &sent[0];
    assert_eq!(command.get_str("aggregate").unwrap(), "coll");
    // Establishment batches are always empty; the merger pulls the data.
    assert_eq!(command.get_document("cursor").unwrap().get_i32("batchSize").unwrap(), 0);
    assert!(command.get_bool("fromRouter").unwrap());
    assert_eq!(command.get_document("shardVersion").unwrap().get_i64("epoch").unwrap(), 1);
    assert!(command.contains_key("collation"));
}

#[tokio::test]
async fn test_unowned_key_range_answers_empty_without_network() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1}]);
    // The only chunk covers [0, 10); _id 50 belongs to no shard.
    let chunks = vec![Chunk::new(bson::bson!(0), bson::bson!(10), shard("shard-0"))];
    let (router, _table) = router_with_chunks(&mock, chunks);

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$match": {"_id": 50}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    assert_eq!(reply.get_i32("ok").unwrap(), 1);
    let cursor = reply.get_document("cursor").unwrap();
    assert_eq!(cursor.get_i64("id").unwrap(), 0);
    assert!(cursor.get_array("firstBatch").unwrap().is_empty());
    assert!(mock.aggregates_to(&shard("shard-0")).is_empty());
}

#[tokio::test]
async fn test_stale_budget_bounds_the_retry_loop() {
    let mock = Arc::new(MockShardSet::new());
    mock.add_shard(shard("shard-0"), vec![doc! {"_id": 1}]);
    // More stale replies than the budget allows retries.
    for _ in 0..12 {
        mock.fail_next_aggregate(
            &shard("shard-0"),
            Error::new(ErrorCode::StaleShardVersion, "still stale"),
        );
    }
    let (router, table) = router_with_chunks(&mock, full_range_chunks());

    let request = doc! {
        "aggregate": "coll",
        "pipeline": [{"$match": {"_id": 1}}],
        "cursor": {"batchSize": 10},
    };
    let reply = router.aggregate("db", &request, &OperationContext::new()).await;

    assert_eq!(reply.get_i32("ok").unwrap(), 0);
    assert_eq!(reply.get_i32("code").unwrap(), ErrorCode::StaleShardVersion.code());
    // The default budget of 10 stale retries means 11 sends in total, each
    // retry preceded by a fresh upstream fetch.
    assert_eq!(mock.aggregates_to(&shard("shard-0")).len(), 11);
    assert_eq!(table.upstream_fetches(), 11);
    assert_eq!(router.cursor_stats().open, 0);
}
