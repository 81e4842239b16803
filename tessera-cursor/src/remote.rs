//! Remote cursor handles with kill-on-drop ownership.

use std::collections::VecDeque;
use std::sync::Arc;

use bson::Document;
use tessera_core::{CursorId, CursorResponse, ShardId};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::shard_service::{kill_cursors_command, ShardService};

/// A queued request to kill one remote cursor at its origin shard.
#[derive(Debug)]
struct KillRequest {
    shard: ShardId,
    collection: String,
    cursor_id: CursorId,
}

/// Handle for scheduling asynchronous `killCursors` sends.
///
/// Dropping a live [`RemoteCursor`] enqueues a kill here; a background
/// task drains the queue so destructors never block on the network.
#[derive(Debug, Clone)]
pub struct KillSink {
    tx: mpsc::UnboundedSender<KillRequest>,
}

impl KillSink {
    /// Enqueues a kill for the given cursor. Best effort: if the sink's
    /// drain task is gone (process shutdown), the request is dropped.
    pub fn enqueue(&self, shard: ShardId, collection: String, cursor_id: CursorId) {
        assert!(!cursor_id.is_exhausted(), "cannot kill the exhausted sentinel");
        let _ = self.tx.send(KillRequest { shard, collection, cursor_id });
    }
}

/// Starts the kill sink's drain task on the current runtime.
///
/// Failures are logged and dropped: a kill is best-effort cleanup, and the
/// shard's own idle timeout is the backstop.
#[must_use]
pub fn start_kill_sink(service: Arc<dyn ShardService>) -> KillSink {
    let (tx, mut rx) = mpsc::unbounded_channel::<KillRequest>();
    tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            let command = kill_cursors_command(&request.collection, &[request.cursor_id]);
            match service.run_command(&request.shard, command).await {
                Ok(_) => debug!(
                    shard = %request.shard,
                    cursor_id = request.cursor_id.get(),
                    "Killed remote cursor"
                ),
                Err(error) => warn!(
                    shard = %request.shard,
                    cursor_id = request.cursor_id.get(),
                    %error,
                    "Failed to kill remote cursor"
                ),
            }
        }
    });
    KillSink { tx }
}

/// A handle to one server-side cursor on one shard.
///
/// Ownership is exclusive: whoever holds the `RemoteCursor` is responsible
/// for the server-side cursor. Dropping a live handle schedules a
/// `killCursors` at the origin unless ownership was dismissed (the
/// transferred-to-merger case) or the cursor is already exhausted.
#[derive(Debug)]
pub struct RemoteCursor {
    /// The shard holding the cursor.
    shard_id: ShardId,
    /// Collection name used in `getMore`/`killCursors` commands.
    collection: String,
    /// Server-side cursor id; zero once the server reports exhaustion.
    cursor_id: CursorId,
    /// Documents received but not yet consumed.
    buffer: VecDeque<Document>,
    /// Ownership was handed to someone else; drop must not kill.
    dismissed: bool,
    /// A `getMore` for this cursor is in flight.
    request_in_flight: bool,
    /// Minimum sort key the shard promises for future documents
    /// (tailable streams only).
    high_water_mark: Option<Document>,
    /// Where drop-time kills are scheduled.
    kill_sink: KillSink,
}

impl RemoteCursor {
    /// Creates a remote cursor from the establishment response.
    #[must_use]
    pub fn new(
        shard_id: ShardId,
        collection: impl Into<String>,
        response: CursorResponse,
        kill_sink: KillSink,
    ) -> Self {
        Self {
            shard_id,
            collection: collection.into(),
            cursor_id: response.id,
            buffer: response.batch.into(),
            dismissed: false,
            request_in_flight: false,
            high_water_mark: None,
            kill_sink,
        }
    }

    /// Returns the shard holding the cursor.
    #[must_use]
    pub const fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    /// Returns the collection name.
    #[must_use]
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Returns the server-side cursor id.
    #[must_use]
    pub const fn cursor_id(&self) -> CursorId {
        self.cursor_id
    }

    /// Returns true once the server has no more data for this cursor.
    #[must_use]
    pub const fn server_exhausted(&self) -> bool {
        self.cursor_id.is_exhausted()
    }

    /// Returns true once the server is exhausted and the local buffer is
    /// drained.
    #[must_use]
    pub fn done(&self) -> bool {
        self.server_exhausted() && self.buffer.is_empty()
    }

    /// Returns the buffered document count.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the head of the buffer without consuming it.
    #[must_use]
    pub fn peek(&self) -> Option<&Document> {
        self.buffer.front()
    }

    /// Consumes the head of the buffer.
    pub fn pop(&mut self) -> Option<Document> {
        self.buffer.pop_front()
    }

    /// Returns the promised minimum sort key, if the shard sent one.
    #[must_use]
    pub const fn high_water_mark(&self) -> Option<&Document> {
        self.high_water_mark.as_ref()
    }

    /// Returns true if a `getMore` for this cursor is in flight.
    #[must_use]
    pub const fn request_in_flight(&self) -> bool {
        self.request_in_flight
    }

    /// Marks a `getMore` as issued.
    pub fn mark_request_issued(&mut self) {
        assert!(!self.request_in_flight, "getMore already in flight");
        assert!(!self.server_exhausted(), "getMore on an exhausted cursor");
        self.request_in_flight = true;
    }

    /// Applies a `getMore` reply: new cursor id, appended batch, and an
    /// optional high-water-mark promise.
    pub fn apply_response(&mut self, response: CursorResponse, high_water_mark: Option<Document>) {
        assert!(self.request_in_flight, "response without a request");
        self.request_in_flight = false;
        self.cursor_id = response.id;
        self.buffer.extend(response.batch);
        if high_water_mark.is_some() {
            self.high_water_mark = high_water_mark;
        }
    }

    /// Records that an in-flight request failed.
    pub fn mark_request_failed(&mut self) {
        assert!(self.request_in_flight, "failure without a request");
        self.request_in_flight = false;
    }

    /// Dismisses ownership: drop will no longer kill the server cursor.
    ///
    /// Used when ownership transfers to a merger shard.
    pub fn dismiss(&mut self) {
        self.dismissed = true;
    }

    /// Kills the server-side cursor now (asynchronously) and forgets it.
    /// Idempotent.
    pub fn kill(&mut self) {
        if !self.dismissed && !self.cursor_id.is_exhausted() {
            self.kill_sink.enqueue(
                self.shard_id.clone(),
                self.collection.clone(),
                self.cursor_id,
            );
        }
        self.cursor_id = CursorId::EXHAUSTED;
        self.buffer.clear();
    }
}

impl Drop for RemoteCursor {
    fn drop(&mut self) {
        if !self.dismissed && !self.cursor_id.is_exhausted() {
            self.kill_sink.enqueue(
                self.shard_id.clone(),
                self.collection.clone(),
                self.cursor_id,
            );
        }
    }
}
