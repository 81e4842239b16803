//! In-memory shard set and catalog doubles.
//!
//! [`MockShardSet`] implements the shard command seam at the wire level:
//! `aggregate` opens a server-side cursor over the shard's documents
//! (running the simple shards-part stages), `getMore` pages it, and
//! `killCursors` closes it. A `$mergeCursors` head merges the shard's own
//! open cursors, and an `exchange` field partitions the output into one
//! sub-cursor per consumer range, so merge hand-off runs end to end. The
//! source-side commands the cloner issues (`count`, `listIndexes`, `find`,
//! `parallelCollectionScan`) are served from the same per-shard document
//! store. Knobs inject command failures, cap batch sizes, and script
//! tailable `getMore` replies, so scenario tests exercise the router and
//! cloner without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use tessera_core::{
    compare_values, CursorId, CursorResponse, Epoch, Error, ErrorCode, Namespace, Result, ShardId,
};
use tessera_cursor::{compare_sort_keys, extract_sort_key, ShardService};
use tessera_routing::{CatalogClient, Chunk, ChunkMap, RoutingInfo};
use tokio::sync::Notify;

/// One scripted `getMore` reply, served ahead of the default data path.
///
/// A shard with scripted replies behaves as a tailable stream: once the
/// queue is empty, further `getMore`s suspend until another reply is
/// scripted or the cursor is killed, like a real server honoring
/// `maxTimeMS` on an idle await-data cursor.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Deliver a batch on the live cursor.
    Batch {
        /// The documents of the batch.
        documents: Vec<Document>,
        /// `postBatchResumeToken` attached to the reply, if any.
        high_water_mark: Option<Document>,
    },
    /// Fail the command.
    Fail(Error),
}

struct OpenCursor {
    pending: VecDeque<Document>,
    tailable: bool,
}

#[derive(Default)]
struct ShardState {
    documents: Vec<Document>,
    fail_aggregates: VecDeque<Error>,
    scripted_get_mores: VecDeque<ScriptedReply>,
    aggregates: Vec<Document>,
    served: u64,
    die_after: Option<u64>,
}

struct Inner {
    shards: HashMap<ShardId, ShardState>,
    cursors: HashMap<u64, OpenCursor>,
    kills: Vec<(ShardId, i64)>,
    index_specs: Vec<Document>,
    scan_split: Option<Vec<usize>>,
    get_more_cap: usize,
}

/// An in-memory shard set answering the shard command seam.
pub struct MockShardSet {
    inner: Mutex<Inner>,
    namespace: String,
    next_cursor_id: AtomicU64,
    wakeup: Notify,
}

impl Default for MockShardSet {
    fn default() -> Self {
        Self::new()
    }
}

impl MockShardSet {
    /// Creates an empty shard set serving the `db.coll` namespace.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                shards: HashMap::new(),
                cursors: HashMap::new(),
                kills: Vec::new(),
                index_specs: vec![doc! {"name": "_id_", "key": {"_id": 1}}],
                scan_split: None,
                get_more_cap: usize::MAX,
            }),
            namespace: "db.coll".to_string(),
            next_cursor_id: AtomicU64::new(100),
            wakeup: Notify::new(),
        }
    }

    /// Sets the documents a shard holds.
    pub fn add_shard(&self, shard: ShardId, documents: Vec<Document>) {
        self.lock().shards.entry(shard).or_default().documents = documents;
    }

    /// Queues an error for the shard's next aggregate command.
    pub fn fail_next_aggregate(&self, shard: &ShardId, error: Error) {
        self.lock()
            .shards
            .entry(shard.clone())
            .or_default()
            .fail_aggregates
            .push_back(error);
    }

    /// Queues a scripted reply for the shard's next `getMore`, waking any
    /// `getMore` currently suspended on the shard.
    pub fn script_get_more(&self, shard: &ShardId, reply: ScriptedReply) {
        self.lock()
            .shards
            .entry(shard.clone())
            .or_default()
            .scripted_get_mores
            .push_back(reply);
        self.wakeup.notify_waiters();
    }

    /// Caps how many documents one default `getMore` may return.
    pub fn set_get_more_cap(&self, cap: usize) {
        self.lock().get_more_cap = cap;
    }

    /// Makes every `getMore` against the shard fail with a network error
    /// once the shard has served at least `documents` documents.
    pub fn die_after_serving(&self, shard: &ShardId, documents: u64) {
        self.lock().shards.entry(shard.clone()).or_default().die_after = Some(documents);
    }

    /// Sets the index specs `listIndexes` reports.
    pub fn set_index_specs(&self, specs: Vec<Document>) {
        self.lock().index_specs = specs;
    }

    /// Fixes how `parallelCollectionScan` partitions the documents.
    pub fn set_scan_split(&self, sizes: Vec<usize>) {
        self.lock().scan_split = Some(sizes);
    }

    /// Every `(shard, cursor id)` pair killed so far.
    #[must_use]
    pub fn kills(&self) -> Vec<(ShardId, i64)> {
        self.lock().kills.clone()
    }

    /// The aggregate commands sent to a shard, failed attempts included.
    #[must_use]
    pub fn aggregates_to(&self, shard: &ShardId) -> Vec<Document> {
        self.lock()
            .shards
            .get(shard)
            .map(|state| state.aggregates.clone())
            .unwrap_or_default()
    }

    /// Server-side cursors currently open across all shards.
    #[must_use]
    pub fn open_cursors(&self) -> usize {
        self.lock().cursors.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn allocate_cursor(&self, inner: &mut Inner, pending: Vec<Document>, tailable: bool) -> u64 {
        let id = self.next_cursor_id.fetch_add(1, Ordering::SeqCst);
        inner.cursors.insert(id, OpenCursor { pending: pending.into(), tailable });
        id
    }

    fn handle_kill(&self, shard: &ShardId, command: &Document) -> Result<Document> {
        let ids = command
            .get_array("cursors")
            .map_err(|_| Error::new(ErrorCode::FailedToParse, "killCursors requires cursors"))?
            .clone();
        let mut inner = self.lock();
        for value in &ids {
            let id = value.as_i64().unwrap_or_default();
            inner.kills.push((shard.clone(), id));
            inner.cursors.remove(&u64::try_from(id).unwrap_or_default());
        }
        drop(inner);
        self.wakeup.notify_waiters();
        Ok(doc! {"ok": 1})
    }

    fn handle_aggregate(&self, shard: &ShardId, command: &Document) -> Result<Document> {
        let pipeline: Vec<Bson> = command.get_array("pipeline").cloned().unwrap_or_default();
        let mut inner = self.lock();

        let (source, scripted_tailable) = {
            let state = inner.shards.entry(shard.clone()).or_default();
            state.aggregates.push(command.clone());
            if let Some(error) = state.fail_aggregates.pop_front() {
                return Err(error);
            }
            (state.documents.clone(), !state.scripted_get_mores.is_empty())
        };

        // A $mergeCursors head merges the shard's own open cursors instead
        // of reading its document store.
        if let Some(spec) = pipeline
            .first()
            .and_then(Bson::as_document)
            .and_then(|head| head.get_document("$mergeCursors").ok())
        {
            let mut documents = Vec::new();
            for entry in spec.get_array("cursors").expect("$mergeCursors cursors") {
                let id = entry
                    .as_document()
                    .expect("cursor entry")
                    .get_i64("id")
                    .expect("cursor id");
                let cursor = inner
                    .cursors
                    .remove(&u64::try_from(id).unwrap_or_default())
                    .expect("merged cursor is open");
                documents.extend(cursor.pending);
            }
            if let Ok(pattern) = spec.get_document("sortKey") {
                documents.sort_by(|a, b| {
                    compare_sort_keys(
                        &extract_sort_key(a, pattern),
                        &extract_sort_key(b, pattern),
                        pattern,
                    )
                });
            }
            let (documents, _) = run_stages(documents, &pipeline[1..]);
            return Ok(
                CursorResponse::new(CursorId::EXHAUSTED, self.namespace.as_str(), documents)
                    .to_document(true),
            );
        }

        let (documents, tailable) = run_stages(source, &pipeline);
        let tailable = tailable || scripted_tailable;

        if let Ok(exchange) = command.get_document("exchange") {
            let exchange = exchange.clone();
            return self.serve_exchange(&mut inner, documents, &exchange);
        }

        if documents.is_empty() && !tailable {
            return Ok(
                CursorResponse::new(CursorId::EXHAUSTED, self.namespace.as_str(), Vec::new())
                    .to_document(true),
            );
        }
        let id = self.allocate_cursor(&mut inner, documents, tailable);
        Ok(
            CursorResponse::new(CursorId::new(id), self.namespace.as_str(), Vec::new())
                .to_document(true),
        )
    }

    /// Partitions the shards-part output by the exchange key ranges and
    /// opens one sub-cursor per consumer.
    fn serve_exchange(
        &self,
        inner: &mut Inner,
        documents: Vec<Document>,
        exchange: &Document,
    ) -> Result<Document> {
        let key = exchange.get_document("key").expect("exchange key");
        let field = key.keys().next().expect("exchange key has one field").clone();
        let boundaries: Vec<Bson> = exchange
            .get_array("boundaries")
            .expect("exchange boundaries")
            .iter()
            .map(|value| {
                value
                    .as_document()
                    .expect("boundary document")
                    .get(&field)
                    .cloned()
                    .expect("boundary carries the key field")
            })
            .collect();
        let consumers = boundaries.len() - 1;

        let mut parts: Vec<Vec<Document>> = vec![Vec::new(); consumers];
        for document in documents {
            let value = document.get(&field).cloned().unwrap_or(Bson::Null);
            let slot = (0..consumers)
                .find(|&i| {
                    compare_values(&boundaries[i], &value).is_le()
                        && compare_values(&value, &boundaries[i + 1]).is_lt()
                })
                .expect("document key falls inside an exchange range");
            parts[slot].push(document);
        }

        let mut entries: Vec<Bson> = Vec::with_capacity(consumers);
        for part in parts {
            let id = self.allocate_cursor(inner, part, false);
            entries.push(Bson::Document(
                CursorResponse::new(CursorId::new(id), self.namespace.as_str(), Vec::new())
                    .to_document(true),
            ));
        }
        Ok(doc! {"cursors": entries, "ok": 1})
    }

    async fn handle_get_more(&self, shard: &ShardId, command: &Document) -> Result<Document> {
        let raw = command
            .get_i64("getMore")
            .map_err(|_| Error::new(ErrorCode::FailedToParse, "getMore requires an int64 id"))?;
        let key = u64::try_from(raw).unwrap_or_default();
        let requested = command
            .get("batchSize")
            .and_then(|b| b.as_i64().or_else(|| b.as_i32().map(i64::from)))
            .and_then(|n| usize::try_from(n).ok());

        loop {
            let notified = self.wakeup.notified();
            {
                let mut inner = self.lock();

                let scripted = {
                    let state = inner.shards.entry(shard.clone()).or_default();
                    if let Some(threshold) = state.die_after {
                        if state.served >= threshold {
                            return Err(Error::new(
                                ErrorCode::HostUnreachable,
                                "mock source dropped the connection",
                            ));
                        }
                    }
                    state.scripted_get_mores.pop_front()
                };
                if let Some(script) = scripted {
                    match script {
                        ScriptedReply::Batch { documents, high_water_mark } => {
                            inner.shards.entry(shard.clone()).or_default().served +=
                                documents.len() as u64;
                            let mut reply = CursorResponse::new(
                                CursorId::new(key),
                                self.namespace.as_str(),
                                documents,
                            )
                            .to_document(false);
                            if let Some(mark) = high_water_mark {
                                reply
                                    .get_document_mut("cursor")
                                    .expect("cursor reply shape")
                                    .insert("postBatchResumeToken", mark);
                            }
                            return Ok(reply);
                        }
                        ScriptedReply::Fail(error) => return Err(error),
                    }
                }

                let cap = inner.get_more_cap;
                let served = match inner.cursors.get_mut(&key) {
                    None => return Err(Error::cursor_not_found(key)),
                    Some(cursor) if !cursor.tailable => {
                        let take = cursor
                            .pending
                            .len()
                            .min(cap)
                            .min(requested.unwrap_or(usize::MAX));
                        let batch: Vec<Document> = cursor.pending.drain(..take).collect();
                        Some((batch, cursor.pending.is_empty()))
                    }
                    // Tailable with nothing scripted: suspend below.
                    Some(_) => None,
                };
                if let Some((batch, exhausted)) = served {
                    if exhausted {
                        inner.cursors.remove(&key);
                    }
                    inner.shards.entry(shard.clone()).or_default().served += batch.len() as u64;
                    let id = if exhausted { CursorId::EXHAUSTED } else { CursorId::new(key) };
                    return Ok(CursorResponse::new(id, self.namespace.as_str(), batch)
                        .to_document(false));
                }
            }
            notified.await;
        }
    }

    fn handle_count(&self, shard: &ShardId) -> Result<Document> {
        let mut inner = self.lock();
        let count = inner.shards.entry(shard.clone()).or_default().documents.len();
        Ok(doc! {"n": i64::try_from(count).unwrap_or(i64::MAX), "ok": 1})
    }

    fn handle_list_indexes(&self) -> Result<Document> {
        let specs = self.lock().index_specs.clone();
        Ok(CursorResponse::new(CursorId::EXHAUSTED, self.namespace.as_str(), specs)
            .to_document(true))
    }

    fn handle_find(&self, shard: &ShardId) -> Result<Document> {
        let mut inner = self.lock();
        let documents = inner.shards.entry(shard.clone()).or_default().documents.clone();
        if documents.is_empty() {
            return Ok(
                CursorResponse::new(CursorId::EXHAUSTED, self.namespace.as_str(), Vec::new())
                    .to_document(true),
            );
        }
        let id = self.allocate_cursor(&mut inner, documents, false);
        Ok(
            CursorResponse::new(CursorId::new(id), self.namespace.as_str(), Vec::new())
                .to_document(true),
        )
    }

    fn handle_parallel_scan(&self, shard: &ShardId, command: &Document) -> Result<Document> {
        let requested = usize::try_from(command.get_i64("numCursors").unwrap_or(1)).unwrap_or(1);
        let mut inner = self.lock();
        let documents = inner.shards.entry(shard.clone()).or_default().documents.clone();
        let split = inner
            .scan_split
            .clone()
            .unwrap_or_else(|| even_split(documents.len(), requested));

        let mut entries: Vec<Bson> = Vec::with_capacity(split.len());
        let mut offset = 0;
        for size in split {
            let end = (offset + size).min(documents.len());
            let slice = documents[offset..end].to_vec();
            offset = end;
            let id = self.allocate_cursor(&mut inner, slice, false);
            entries.push(Bson::Document(
                CursorResponse::new(CursorId::new(id), self.namespace.as_str(), Vec::new())
                    .to_document(true),
            ));
        }
        Ok(doc! {"cursors": entries, "ok": 1})
    }
}

#[async_trait]
impl ShardService for MockShardSet {
    async fn run_command(&self, shard: &ShardId, command: Document) -> Result<Document> {
        if command.contains_key("killCursors") {
            return self.handle_kill(shard, &command);
        }
        if command.contains_key("getMore") {
            return self.handle_get_more(shard, &command).await;
        }
        if command.contains_key("aggregate") {
            return self.handle_aggregate(shard, &command);
        }
        if command.contains_key("count") {
            return self.handle_count(shard);
        }
        if command.contains_key("listIndexes") {
            return self.handle_list_indexes();
        }
        if command.contains_key("parallelCollectionScan") {
            return self.handle_parallel_scan(shard, &command);
        }
        if command.contains_key("find") {
            return self.handle_find(shard);
        }
        Err(Error::new(ErrorCode::FailedToParse, "mock shard set: unrecognized command"))
    }
}

/// A catalog double serving one sharded routing layout at a settable
/// epoch.
pub struct MockCatalog {
    key_field: String,
    primary: ShardId,
    chunks: Vec<Chunk>,
    epoch: AtomicU64,
}

impl MockCatalog {
    /// A catalog serving the given chunk layout at epoch 1.
    #[must_use]
    pub fn sharded(key_field: impl Into<String>, primary: ShardId, chunks: Vec<Chunk>) -> Self {
        Self {
            key_field: key_field.into(),
            primary,
            chunks,
            epoch: AtomicU64::new(1),
        }
    }

    /// Advances the epoch served on the next fetch.
    pub fn set_epoch(&self, epoch: u64) {
        self.epoch.store(epoch, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogClient for MockCatalog {
    async fn fetch_routing_info(&self, namespace: &Namespace) -> Result<RoutingInfo> {
        Ok(RoutingInfo::sharded(
            namespace.clone(),
            Epoch::new(self.epoch.load(Ordering::SeqCst)),
            self.primary.clone(),
            ChunkMap::new(self.key_field.as_str(), self.chunks.clone()),
        ))
    }
}

/// Runs the stage shapes the mock understands over the documents, and
/// reports whether a `$changeStream` made the stream tailable.
fn run_stages(mut documents: Vec<Document>, stages: &[Bson]) -> (Vec<Document>, bool) {
    let mut tailable = false;
    for value in stages {
        let spec = value.as_document().expect("pipeline stages are documents");
        let (name, body) = spec.iter().next().expect("stage has one field");
        match name.as_str() {
            "$match" => {
                let predicate = body.as_document().expect("$match body").clone();
                documents.retain(|document| matches_equality(document, &predicate));
            }
            "$sort" => {
                let pattern = body.as_document().expect("$sort body").clone();
                documents.sort_by(|a, b| {
                    compare_sort_keys(
                        &extract_sort_key(a, &pattern),
                        &extract_sort_key(b, &pattern),
                        &pattern,
                    )
                });
            }
            "$limit" => {
                let limit = stage_integer(body).expect("$limit body");
                documents.truncate(usize::try_from(limit).unwrap_or(usize::MAX));
            }
            "$skip" => {
                let skip = stage_integer(body).expect("$skip body");
                let skip = usize::try_from(skip).unwrap_or(0).min(documents.len());
                documents.drain(..skip);
            }
            "$group" => {
                let body = body.as_document().expect("$group body");
                assert!(
                    body.len() == 1 && body.contains_key("_id"),
                    "mock $group supports a bare _id only"
                );
                let path = body.get_str("_id").expect("$group _id is a field path");
                let field = path.strip_prefix('$').expect("$group _id is a field path");
                let mut keys: Vec<Bson> = Vec::new();
                for document in &documents {
                    let value = document.get(field).cloned().unwrap_or(Bson::Null);
                    if !keys.contains(&value) {
                        keys.push(value);
                    }
                }
                documents = keys.into_iter().map(|value| doc! {"_id": value}).collect();
            }
            "$changeStream" => {
                documents.clear();
                tailable = true;
            }
            other => panic!("mock shard cannot run {other}"),
        }
    }
    (documents, tailable)
}

/// Top-level equality matching, the only predicate shape the mock runs.
fn matches_equality(document: &Document, predicate: &Document) -> bool {
    predicate.iter().all(|(field, expected)| {
        assert!(
            expected
                .as_document()
                .is_none_or(|d| d.keys().all(|k| !k.starts_with('$'))),
            "mock $match supports top-level equality only"
        );
        document.get(field) == Some(expected)
    })
}

fn stage_integer(body: &Bson) -> Option<i64> {
    body.as_i64().or_else(|| body.as_i32().map(i64::from))
}

fn even_split(total: usize, cursors: usize) -> Vec<usize> {
    let cursors = cursors.max(1);
    let base = total / cursors;
    let mut remainder = total % cursors;
    (0..cursors)
        .map(|_| {
            let extra = usize::from(remainder > 0);
            remainder = remainder.saturating_sub(1);
            base + extra
        })
        .collect()
}
