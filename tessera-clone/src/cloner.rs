//! The collection cloner state machine.

use std::sync::Arc;

use bson::{doc, Document};
use tessera_core::{unix_time_us, CursorResponse, Error, ErrorCode, Limits, Namespace, OperationContext, ShardId};
use tessera_cursor::{
    get_more_command, AsyncResultsMerger, KillSink, MergerParams, MergerResult, RemoteCursor,
    ShardService,
};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use crate::error::{CloneError, LoaderError};
use crate::loader::BulkLoader;
use crate::progress::ProgressMeter;

/// Phase of a running clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneState {
    /// Constructed, not yet run.
    PreStart,
    /// Counting the source documents.
    Counting,
    /// Collecting the source index specs.
    ListingIndexes,
    /// Opening the scan cursor(s).
    EstablishingCursors,
    /// Streaming batches into the loader.
    Copying,
    /// Committing the loader.
    Finalizing,
    /// Done; the loader is committed.
    Complete,
    /// Aborting; the loader is being discarded.
    ShuttingDown,
}

/// Counters of a finished clone.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloneStats {
    /// The source's document count when the clone started.
    pub expected_documents: u64,
    /// Documents actually inserted.
    pub documents_copied: u64,
    /// Index specs handed to the loader, `_id` included.
    pub indexes_built: usize,
}

/// What and how to clone.
#[derive(Debug, Clone)]
pub struct ClonerOptions {
    /// The server to read from.
    pub source: ShardId,
    /// The collection to copy.
    pub namespace: Namespace,
    /// Collection options applied at local create.
    pub collection_options: Document,
    /// Target documents per insert batch.
    pub batch_size: u32,
    /// Insert tasks allowed in flight at once. One per scan cursor keeps
    /// at most one batch in flight per cursor.
    pub insert_workers: usize,
}

impl ClonerOptions {
    /// Options with default batching for the given source collection.
    #[must_use]
    pub fn new(source: ShardId, namespace: Namespace) -> Self {
        Self {
            source,
            namespace,
            collection_options: Document::new(),
            batch_size: 1_000,
            insert_workers: 1,
        }
    }
}

type CompletionCallback = Box<dyn FnOnce(&Result<CloneStats, CloneError>) + Send>;

/// Copies one collection from a source server into a [`BulkLoader`].
///
/// Single-shot: `run` consumes the cloner and drives the state machine to
/// `Complete` or `ShuttingDown`. The completion callback, if set, fires
/// exactly once after the loader has been committed or aborted.
pub struct CollectionCloner {
    service: Arc<dyn ShardService>,
    loader: Arc<dyn BulkLoader>,
    kill_sink: KillSink,
    options: ClonerOptions,
    limits: Limits,
    collection: String,
    state: CloneState,
    loader_initialized: bool,
    on_complete: Option<CompletionCallback>,
}

impl CollectionCloner {
    /// Creates a cloner.
    ///
    /// # Panics
    ///
    /// Panics if the namespace has no collection part or the limits fail
    /// validation.
    #[must_use]
    pub fn new(
        service: Arc<dyn ShardService>,
        loader: Arc<dyn BulkLoader>,
        kill_sink: KillSink,
        options: ClonerOptions,
        limits: Limits,
    ) -> Self {
        limits.validate();
        assert!(options.batch_size > 0, "batch size must be positive");
        let collection = options
            .namespace
            .coll()
            .map(str::to_string)
            .unwrap_or_default();
        assert!(!collection.is_empty(), "cloner needs a concrete collection");
        Self {
            service,
            loader,
            kill_sink,
            options,
            limits,
            collection,
            state: CloneState::PreStart,
            loader_initialized: false,
            on_complete: None,
        }
    }

    /// Sets the single-shot completion callback.
    #[must_use]
    pub fn on_complete(
        mut self,
        callback: impl FnOnce(&Result<CloneStats, CloneError>) + Send + 'static,
    ) -> Self {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> CloneState {
        self.state
    }

    /// Runs the clone to completion.
    ///
    /// # Errors
    ///
    /// Returns the final status; the loader has been committed on `Ok` and
    /// aborted on `Err` before this returns (and before the completion
    /// callback observes the result).
    pub async fn run(mut self, opctx: &OperationContext) -> Result<CloneStats, CloneError> {
        assert_eq!(self.state, CloneState::PreStart, "a cloner runs once");
        let result = self.execute(opctx).await;

        if result.is_err() {
            self.transition(CloneState::ShuttingDown);
            if self.loader_initialized {
                self.loader.abort().await;
            }
        }
        if let Some(callback) = self.on_complete.take() {
            callback(&result);
        }
        result
    }

    async fn execute(&mut self, opctx: &OperationContext) -> Result<CloneStats, CloneError> {
        self.transition(CloneState::Counting);
        self.check_interrupt(opctx)?;
        let count = match self.fetch_count().await {
            Ok(count) => count,
            Err(CloneError::Source { source, .. })
                if source.code() == ErrorCode::NamespaceNotFound =>
            {
                return self.create_empty().await;
            }
            Err(error) => return Err(error),
        };
        if count < 0 {
            return Err(CloneError::NegativeCount { count });
        }
        #[allow(clippy::cast_sign_loss)]
        let expected = count as u64;

        self.transition(CloneState::ListingIndexes);
        self.check_interrupt(opctx)?;
        let specs = match self.fetch_index_specs().await {
            Ok(specs) => specs,
            Err(CloneError::Source { source, .. })
                if source.code() == ErrorCode::NamespaceNotFound =>
            {
                return self.create_empty().await;
            }
            Err(error) => return Err(error),
        };
        let (id_index, secondary): (Vec<Document>, Vec<Document>) = specs
            .iter()
            .cloned()
            .partition(|spec| spec.get_str("name").is_ok_and(|name| name == "_id_"));
        let indexes_built = specs.len();

        self.transition(CloneState::EstablishingCursors);
        self.check_interrupt(opctx)?;
        self.loader
            .init(&self.options.collection_options, id_index.first(), &secondary)
            .await
            .map_err(|source| CloneError::Loader { operation: "init", source })?;
        self.loader_initialized = true;

        let remotes = self.open_cursors().await?;
        let cursors_opened = remotes.len();
        let mut params = MergerParams::arrival_order(self.collection.clone());
        params.batch_size = Some(self.options.batch_size);
        let merger =
            AsyncResultsMerger::new(Arc::clone(&self.service), params, remotes);

        self.transition(CloneState::Copying);
        info!(
            collection = %self.collection,
            expected,
            cursors = cursors_opened,
            "Copying collection"
        );
        let mut progress = ProgressMeter::new(self.collection.clone(), expected);
        let workers = Arc::new(Semaphore::new(self.options.insert_workers.max(1)));
        let mut inserts: JoinSet<Result<u64, LoaderError>> = JoinSet::new();

        let drained = self
            .copy_loop(opctx, &merger, &workers, &mut inserts, &mut progress)
            .await;

        // Drain the pool even on failure so no insert outlives the clone.
        let mut first_error = drained.err();
        while let Some(joined) = inserts.join_next().await {
            match joined {
                Ok(Ok(inserted)) => progress.add(inserted),
                Ok(Err(source)) => {
                    first_error.get_or_insert(CloneError::Loader { operation: "insert", source });
                }
                Err(join_error) => {
                    first_error.get_or_insert(CloneError::Loader {
                        operation: "insert",
                        source: LoaderError::new(join_error.to_string()),
                    });
                }
            }
        }
        if let Some(error) = first_error {
            merger.kill();
            return Err(error);
        }

        self.transition(CloneState::Finalizing);
        self.loader
            .commit()
            .await
            .map_err(|source| CloneError::Loader { operation: "commit", source })?;
        self.transition(CloneState::Complete);
        info!(
            collection = %self.collection,
            copied = progress.copied(),
            expected,
            "Clone complete"
        );
        Ok(CloneStats {
            expected_documents: expected,
            documents_copied: progress.copied(),
            indexes_built,
        })
    }

    /// Streams merged batches into the insert pool until EOF.
    async fn copy_loop(
        &self,
        opctx: &OperationContext,
        merger: &AsyncResultsMerger,
        workers: &Arc<Semaphore>,
        inserts: &mut JoinSet<Result<u64, LoaderError>>,
        progress: &mut ProgressMeter,
    ) -> Result<(), CloneError> {
        loop {
            if let Err(error) = opctx.check_for_interrupt(unix_time_us()) {
                merger.kill();
                return Err(CloneError::ShutDown { reason: error.message().to_string() });
            }
            // Surface insert failures promptly instead of at EOF.
            while let Some(joined) = inserts.try_join_next() {
                match joined {
                    Ok(Ok(inserted)) => progress.add(inserted),
                    Ok(Err(source)) => {
                        merger.kill();
                        return Err(CloneError::Loader { operation: "insert", source });
                    }
                    Err(join_error) => {
                        merger.kill();
                        return Err(CloneError::Loader {
                            operation: "insert",
                            source: LoaderError::new(join_error.to_string()),
                        });
                    }
                }
            }

            if !merger.ready() {
                if let Err(error) = merger.next_event().await {
                    merger.kill();
                    return Err(CloneError::Source { phase: "getMore", attempts: 1, source: error });
                }
                continue;
            }

            let mut batch = Vec::with_capacity(self.options.batch_size as usize);
            let mut reached_eof = false;
            while batch.len() < self.options.batch_size as usize && merger.ready() {
                match merger.next_ready() {
                    Ok(MergerResult::Document(document)) => batch.push(document),
                    Ok(MergerResult::Eof) => {
                        reached_eof = true;
                        break;
                    }
                    Ok(MergerResult::CloseChangeStream) => {
                        unreachable!("clone cursors are plain scans")
                    }
                    Err(error) => {
                        return Err(CloneError::Source {
                            phase: "getMore",
                            attempts: 1,
                            source: error,
                        })
                    }
                }
            }

            if !batch.is_empty() {
                let Ok(permit) = Arc::clone(workers).acquire_owned().await else {
                    unreachable!("the insert semaphore is never closed")
                };
                let loader = Arc::clone(&self.loader);
                inserts.spawn(async move {
                    let inserted = batch.len() as u64;
                    let result = loader.insert_documents(batch).await.map(|()| inserted);
                    drop(permit);
                    result
                });
            }
            if reached_eof {
                return Ok(());
            }
        }
    }

    async fn fetch_count(&self) -> Result<i64, CloneError> {
        let reply = self
            .source_command(
                "count",
                self.limits.count_attempts,
                doc! { "count": self.collection.clone() },
            )
            .await?;
        reply
            .get("n")
            .and_then(|n| n.as_i64().or_else(|| n.as_i32().map(i64::from)))
            .ok_or_else(|| CloneError::Source {
                phase: "count",
                attempts: 1,
                source: Error::new(ErrorCode::FailedToParse, "count reply missing n"),
            })
    }

    /// Collects the full index spec list through the paged fetcher. Only
    /// the first command spends the phase's attempt budget.
    async fn fetch_index_specs(&self) -> Result<Vec<Document>, CloneError> {
        let first = self
            .source_command(
                "listIndexes",
                self.limits.list_indexes_attempts,
                doc! { "listIndexes": self.collection.clone(), "cursor": {} },
            )
            .await?;
        let mut response = Self::parse_cursor_reply("listIndexes", &first)?;
        let mut specs = response.batch;
        while !response.id.is_exhausted() {
            let page = self
                .source_command(
                    "listIndexes",
                    1,
                    get_more_command(response.id, &self.collection, None, None),
                )
                .await?;
            response = Self::parse_cursor_reply("listIndexes", &page)?;
            specs.append(&mut response.batch);
        }
        debug!(collection = %self.collection, indexes = specs.len(), "Collected index specs");
        Ok(specs)
    }

    /// Opens the scan cursors: one plain `find` under the default
    /// parallelism, a parallel scan otherwise.
    async fn open_cursors(&self) -> Result<Vec<RemoteCursor>, CloneError> {
        if self.limits.max_cloner_cursors <= 1 {
            let command = doc! {
                "find": self.collection.clone(),
                "noCursorTimeout": true,
                "batchSize": 0,
            };
            let reply = self
                .source_command("find", self.limits.find_attempts, command)
                .await?;
            let response = Self::parse_cursor_reply("find", &reply)?;
            return Ok(vec![self.wrap_cursor(response)]);
        }

        let command = doc! {
            "parallelCollectionScan": self.collection.clone(),
            "numCursors": i64::from(self.limits.max_cloner_cursors),
            "noCursorTimeout": true,
        };
        let reply = self
            .source_command("parallelCollectionScan", self.limits.find_attempts, command)
            .await?;
        let entries = reply.get_array("cursors").map_err(|_| CloneError::Source {
            phase: "parallelCollectionScan",
            attempts: 1,
            source: Error::new(ErrorCode::FailedToParse, "scan reply missing cursors"),
        })?;
        let mut remotes = Vec::with_capacity(entries.len());
        for entry in entries {
            let sub = entry.as_document().ok_or_else(|| CloneError::Source {
                phase: "parallelCollectionScan",
                attempts: 1,
                source: Error::new(ErrorCode::FailedToParse, "scan cursor entry not a document"),
            })?;
            remotes.push(self.wrap_cursor(Self::parse_cursor_reply("parallelCollectionScan", sub)?));
        }
        Ok(remotes)
    }

    fn wrap_cursor(&self, response: CursorResponse) -> RemoteCursor {
        RemoteCursor::new(
            self.options.source.clone(),
            self.collection.clone(),
            response,
            self.kill_sink.clone(),
        )
    }

    fn parse_cursor_reply(
        phase: &'static str,
        reply: &Document,
    ) -> Result<CursorResponse, CloneError> {
        CursorResponse::from_document(reply)
            .map_err(|source| CloneError::Source { phase, attempts: 1, source })
    }

    /// The source collection does not exist: create it empty locally and
    /// finish successfully.
    async fn create_empty(&mut self) -> Result<CloneStats, CloneError> {
        info!(collection = %self.collection, "Source collection absent, creating empty");
        self.loader
            .init(&self.options.collection_options, None, &[])
            .await
            .map_err(|source| CloneError::Loader { operation: "init", source })?;
        self.loader_initialized = true;
        self.transition(CloneState::Finalizing);
        self.loader
            .commit()
            .await
            .map_err(|source| CloneError::Loader { operation: "commit", source })?;
        self.transition(CloneState::Complete);
        Ok(CloneStats::default())
    }

    /// Runs one source command with the phase's retry budget. Only
    /// transient network errors retry, with exponential backoff.
    async fn source_command(
        &self,
        phase: &'static str,
        attempts: u32,
        command: Document,
    ) -> Result<Document, CloneError> {
        assert!(attempts > 0, "attempt budget must be positive");
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.service.run_command(&self.options.source, command.clone()).await {
                Ok(reply) => return Ok(reply),
                Err(error) if attempt < attempts && error.code().is_retriable_network() => {
                    warn!(phase, attempt, error = %error, "Retrying source command");
                    sleep(Duration::from_millis(
                        self.limits.backoff_base_ms << (attempt - 1).min(10),
                    ))
                    .await;
                }
                Err(source) => {
                    return Err(CloneError::Source { phase, attempts: attempt, source })
                }
            }
        }
    }

    fn check_interrupt(&self, opctx: &OperationContext) -> Result<(), CloneError> {
        opctx
            .check_for_interrupt(unix_time_us())
            .map_err(|error| CloneError::ShutDown { reason: error.message().to_string() })
    }

    fn transition(&mut self, next: CloneState) {
        debug!(collection = %self.collection, from = ?self.state, to = ?next, "Cloner phase");
        self.state = next;
    }
}
