//! The async results merger: a pull-style iterator over N remote cursors.
//!
//! The merger is single-threaded cooperative. One lock serializes all
//! state; the only suspension point is [`AsyncResultsMerger::next_event`].
//! Network fetches run on spawned tasks holding a weak handle, so a
//! dropped merger never keeps its remotes alive (the remotes' own
//! kill-on-drop covers the server side).
//!
//! Ordering: with a sort pattern the merger performs a k-way merge on the
//! extracted sort keys and releases a document only when no empty
//! non-exhausted remote could still produce a smaller one. Without a sort
//! pattern, documents are released in arrival order, round-robin over
//! non-empty buffers.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use bson::{Bson, Document};
use tessera_core::{CursorResponse, Error, ErrorCode, Result, ShardId};
use tokio::sync::Notify;
use tracing::{debug, trace};

use crate::remote::RemoteCursor;
use crate::shard_service::{get_more_command, ShardService};
use crate::sort_key::{compare_sort_keys, extract_sort_key};

/// Parameters fixed at merger construction.
#[derive(Debug, Clone)]
pub struct MergerParams {
    /// Collection name used in `getMore` commands to the remotes.
    pub collection: String,
    /// Sort pattern for ordered merging; `None` means arrival order.
    pub sort_key: Option<Document>,
    /// Tailable await-data mode: end-of-data never closes the stream.
    pub tailable_await_data: bool,
    /// Batch size hint forwarded on `getMore`.
    pub batch_size: Option<u32>,
    /// Server-side wait bound for await-data `getMore`s, in milliseconds.
    pub await_data_timeout_ms: u64,
}

impl MergerParams {
    /// Arrival-order parameters for the given collection.
    #[must_use]
    pub fn arrival_order(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            sort_key: None,
            tailable_await_data: false,
            batch_size: None,
            await_data_timeout_ms: 1_000,
        }
    }

    /// Ordered-merge parameters for the given collection and sort pattern.
    #[must_use]
    pub fn sorted(collection: impl Into<String>, sort_key: Document) -> Self {
        Self {
            sort_key: Some(sort_key),
            ..Self::arrival_order(collection)
        }
    }
}

/// One result pulled out of the merger.
#[derive(Debug, Clone, PartialEq)]
pub enum MergerResult {
    /// The next merged document.
    Document(Document),
    /// Every remote is exhausted and drained. Permanent unless tailable.
    Eof,
    /// A change stream observed an invalidate event and must be closed.
    CloseChangeStream,
}

struct MergerState {
    remotes: Vec<RemoteCursor>,
    /// First surfaced fetch error; sticky.
    failure: Option<Error>,
    killed: bool,
    close_stream: bool,
    /// Next remote to prefer in arrival-order mode.
    round_robin: usize,
}

struct MergerInner {
    service: Arc<dyn ShardService>,
    params: MergerParams,
    state: Mutex<MergerState>,
    wakeup: Notify,
}

/// A pull-style merger over N remote cursors. See the module docs.
pub struct AsyncResultsMerger {
    inner: Arc<MergerInner>,
}

impl AsyncResultsMerger {
    /// Creates a merger owning the given remote cursors.
    #[must_use]
    pub fn new(
        service: Arc<dyn ShardService>,
        params: MergerParams,
        remotes: Vec<RemoteCursor>,
    ) -> Self {
        Self {
            inner: Arc::new(MergerInner {
                service,
                params,
                state: Mutex::new(MergerState {
                    remotes,
                    failure: None,
                    killed: false,
                    close_stream: false,
                    round_robin: 0,
                }),
                wakeup: Notify::new(),
            }),
        }
    }

    /// Returns true when [`Self::next_ready`] can produce a result without
    /// any I/O.
    #[must_use]
    pub fn ready(&self) -> bool {
        let state = self.inner.lock_state();
        self.inner.ready_locked(&state)
    }

    /// Returns the next result. Must only be called when [`Self::ready`]
    /// is true.
    ///
    /// # Errors
    ///
    /// Surfaces the first remote fetch error, or `CursorKilled` after
    /// [`Self::kill`].
    ///
    /// # Panics
    ///
    /// Panics if the merger is not ready.
    pub fn next_ready(&self) -> Result<MergerResult> {
        let mut state = self.inner.lock_state();
        assert!(self.inner.ready_locked(&state), "next_ready while not ready");

        if state.killed {
            return Err(Error::new(ErrorCode::CursorKilled, "merger was killed"));
        }
        if let Some(failure) = state.failure.clone() {
            return Err(failure);
        }
        if state.close_stream && !self.inner.any_buffered(&state) {
            return Ok(MergerResult::CloseChangeStream);
        }

        let result = if self.inner.params.sort_key.is_some() {
            self.inner.pop_sorted(&mut state)
        } else {
            self.inner.pop_arrival(&mut state)
        };
        Ok(result)
    }

    /// Suspends until [`Self::ready`] would return true, scheduling
    /// `getMore`s on whichever remotes are holding progress back.
    ///
    /// Cancellable: dropping the future leaves any scheduled fetches to
    /// complete into the merger's buffers.
    ///
    /// # Errors
    ///
    /// Currently infallible; the `Result` mirrors the rest of the pull
    /// contract so callers thread errors through one channel.
    pub async fn next_event(&self) -> Result<()> {
        loop {
            // Register for wakeup before the ready check, so a completion
            // racing with this call is never missed.
            let notified = self.inner.wakeup.notified();
            {
                let mut state = self.inner.lock_state();
                if self.inner.ready_locked(&state) {
                    return Ok(());
                }
                self.inner.schedule_fetches(&mut state);
            }
            notified.await;
        }
    }

    /// Returns true once every remote has reported cursor id 0 and its
    /// buffer is drained.
    #[must_use]
    pub fn remotes_exhausted(&self) -> bool {
        let state = self.inner.lock_state();
        state.remotes.iter().all(RemoteCursor::done)
    }

    /// Kills every non-exhausted remote and poisons the merger. Idempotent.
    ///
    /// Races with in-flight `getMore`s are benign: a completion observed
    /// after the kill discards its batch, and the `killCursors` already
    /// sent here covers the cursor id it was fetched on.
    pub fn kill(&self) {
        let mut state = self.inner.lock_state();
        if state.killed {
            return;
        }
        state.killed = true;
        for remote in &mut state.remotes {
            remote.kill();
        }
        debug!(remotes = state.remotes.len(), "Merger killed");
        self.inner.wakeup.notify_waiters();
    }
}

impl MergerInner {
    fn lock_state(&self) -> MutexGuard<'_, MergerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn any_buffered(&self, state: &MergerState) -> bool {
        state.remotes.iter().any(|remote| remote.buffered() > 0)
    }

    fn ready_locked(&self, state: &MergerState) -> bool {
        if state.killed || state.failure.is_some() {
            return true;
        }
        if state.close_stream && !self.any_buffered(state) {
            return true;
        }
        if self.params.sort_key.is_some() {
            self.sorted_ready(state)
        } else {
            self.arrival_ready(state)
        }
    }

    fn arrival_ready(&self, state: &MergerState) -> bool {
        if self.any_buffered(state) {
            return true;
        }
        // All buffers empty: EOF is a result too, unless tailable.
        !self.params.tailable_await_data && state.remotes.iter().all(RemoteCursor::done)
    }

    /// Ordered-merge readiness: the minimum head is releasable only when
    /// no empty non-exhausted remote could still produce a smaller key.
    /// For tailable streams an empty remote stops blocking once its
    /// high-water-mark promise is strictly greater than the candidate.
    fn sorted_ready(&self, state: &MergerState) -> bool {
        let pattern = self.params.sort_key.as_ref().map_or_else(Document::new, Clone::clone);
        let Some(minimum) = self.min_head_key(state, &pattern) else {
            return !self.params.tailable_await_data
                && state.remotes.iter().all(RemoteCursor::done);
        };

        for remote in &state.remotes {
            if remote.buffered() > 0 || remote.server_exhausted() {
                continue;
            }
            if self.params.tailable_await_data {
                let promised_past_minimum = remote.high_water_mark().is_some_and(|mark| {
                    compare_sort_keys(mark, &minimum, &pattern) == Ordering::Greater
                });
                if promised_past_minimum {
                    continue;
                }
            }
            return false;
        }
        true
    }

    /// Sort key of the smallest head-of-buffer document, if any.
    fn min_head_key(&self, state: &MergerState, pattern: &Document) -> Option<Document> {
        let mut minimum: Option<Document> = None;
        for remote in &state.remotes {
            let Some(head) = remote.peek() else { continue };
            let key = extract_sort_key(head, pattern);
            let smaller = minimum
                .as_ref()
                .is_none_or(|current| compare_sort_keys(&key, current, pattern) == Ordering::Less);
            if smaller {
                minimum = Some(key);
            }
        }
        minimum
    }

    fn pop_sorted(&self, state: &mut MergerState) -> MergerResult {
        let pattern = self.params.sort_key.as_ref().map_or_else(Document::new, Clone::clone);
        let mut best: Option<(usize, Document)> = None;
        for (index, remote) in state.remotes.iter().enumerate() {
            let Some(head) = remote.peek() else { continue };
            let key = extract_sort_key(head, &pattern);
            let smaller = best.as_ref().is_none_or(|(_, current)| {
                compare_sort_keys(&key, current, &pattern) == Ordering::Less
            });
            if smaller {
                best = Some((index, key));
            }
        }
        match best {
            Some((index, _)) => {
                let document = state.remotes[index]
                    .pop()
                    .unwrap_or_else(|| unreachable!("peeked head vanished"));
                MergerResult::Document(document)
            }
            None => {
                assert!(!self.params.tailable_await_data, "tailable stream has no EOF");
                MergerResult::Eof
            }
        }
    }

    fn pop_arrival(&self, state: &mut MergerState) -> MergerResult {
        let count = state.remotes.len();
        for offset in 0..count {
            let index = (state.round_robin + offset) % count.max(1);
            if let Some(document) = state.remotes[index].pop() {
                state.round_robin = (index + 1) % count;
                return MergerResult::Document(document);
            }
        }
        assert!(!self.params.tailable_await_data, "tailable stream has no EOF");
        MergerResult::Eof
    }

    /// Issues a `getMore` for every empty, non-exhausted remote with no
    /// request already in flight.
    fn schedule_fetches(self: &Arc<Self>, state: &mut MergerState) {
        if state.killed {
            return;
        }
        for index in 0..state.remotes.len() {
            let remote = &mut state.remotes[index];
            if remote.server_exhausted() || remote.request_in_flight() || remote.buffered() > 0 {
                continue;
            }
            remote.mark_request_issued();

            let max_time_ms = self.params.tailable_await_data.then_some(self.params.await_data_timeout_ms);
            let command = get_more_command(
                remote.cursor_id(),
                &self.params.collection,
                self.params.batch_size,
                max_time_ms,
            );
            let shard: ShardId = remote.shard_id().clone();
            trace!(shard = %shard, cursor_id = remote.cursor_id().get(), "Scheduling getMore");

            let weak: Weak<Self> = Arc::downgrade(self);
            let service = Arc::clone(&self.service);
            tokio::spawn(async move {
                let outcome = service.run_command(&shard, command).await;
                // A dropped merger drops its remotes, whose kill-on-drop
                // already covered this cursor id.
                if let Some(inner) = weak.upgrade() {
                    inner.complete_fetch(index, outcome);
                }
            });
        }
    }

    fn complete_fetch(&self, index: usize, outcome: Result<Document>) {
        let mut state = self.lock_state();
        let killed = state.killed;
        let remote = &mut state.remotes[index];

        if killed {
            // The kill already sent killCursors for this cursor id; the
            // late batch is discarded.
            remote.mark_request_failed();
            self.wakeup.notify_waiters();
            return;
        }

        match outcome.and_then(|reply| {
            let mark = post_batch_resume_token(&reply);
            CursorResponse::from_document(&reply).map(|response| (response, mark))
        }) {
            Ok((response, mark)) => {
                remote.apply_response(response, mark);
            }
            Err(error) if error.code() == ErrorCode::CloseChangeStream => {
                remote.mark_request_failed();
                remote.kill();
                state.close_stream = true;
            }
            Err(error) => {
                remote.mark_request_failed();
                if state.failure.is_none() {
                    state.failure = Some(error);
                }
            }
        }
        self.wakeup.notify_waiters();
    }
}

/// Extracts `cursor.postBatchResumeToken` from a `getMore` reply, the
/// shard's promise that no future document sorts at or below it.
fn post_batch_resume_token(reply: &Document) -> Option<Document> {
    reply
        .get("cursor")
        .and_then(Bson::as_document)?
        .get("postBatchResumeToken")
        .and_then(Bson::as_document)
        .cloned()
}
