//! Concurrent cursor establishment with per-shard retry.
//!
//! The establisher issues one cursor-opening command per shard in
//! parallel, retries transient failures per the caller's policy, and
//! guarantees that a failed overall establishment leaves no cursor alive
//! on any shard that did reply.

use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tessera_core::{CursorResponse, Error, ErrorCode, Limits, Result, ShardId};
use tracing::{debug, warn};

use crate::remote::{KillSink, RemoteCursor};
use crate::shard_service::ShardService;

/// Per-shard retry policy for cursor establishment.
///
/// Retries apply only to transient network errors (host unreachable,
/// network timeout, not-primary). Stale-routing errors surface to the
/// dispatcher, which owns the refresh-and-rebuild loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts per shard, including the first.
    pub attempts: u32,
    /// Base for the exponential backoff between attempts, in milliseconds.
    pub backoff_base_ms: u64,
}

impl RetryPolicy {
    /// The policy for idempotent reads: a small attempt budget with
    /// exponential backoff.
    #[must_use]
    pub const fn idempotent_reads(limits: &Limits) -> Self {
        Self {
            attempts: limits.establish_attempts,
            backoff_base_ms: limits.backoff_base_ms,
        }
    }

    /// No retries. Used for transactional dispatches, where a retry could
    /// double-execute the transaction's first statement on a participant.
    #[must_use]
    pub const fn none() -> Self {
        Self { attempts: 1, backoff_base_ms: 0 }
    }

    /// Backoff before the given retry (1-based), with jitter.
    fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(10);
        let base = self.backoff_base_ms.saturating_mul(1_u64 << exponent);
        let jitter = rand::thread_rng().gen_range(0..=self.backoff_base_ms.max(1));
        Duration::from_millis(base.saturating_add(jitter))
    }
}

/// The outcome of a successful establishment run.
#[derive(Debug)]
pub struct EstablishedCursors {
    /// The opened cursors, in request order.
    pub cursors: Vec<RemoteCursor>,
    /// Shards that failed after retries, recorded only when partial
    /// results were allowed.
    pub unreachable: Vec<ShardId>,
}

/// Concurrently opens cursors on a set of shards.
#[derive(Clone)]
pub struct CursorEstablisher {
    service: Arc<dyn ShardService>,
    kill_sink: KillSink,
    retry_policy: RetryPolicy,
    allow_partial_results: bool,
}

impl CursorEstablisher {
    /// Creates an establisher over the given shard service.
    #[must_use]
    pub fn new(
        service: Arc<dyn ShardService>,
        kill_sink: KillSink,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            service,
            kill_sink,
            retry_policy,
            allow_partial_results: false,
        }
    }

    /// Allows partial results: failing shards are recorded as unreachable
    /// instead of failing the run. Opt-in for change streams and some
    /// administrative aggregations.
    #[must_use]
    pub const fn allow_partial_results(mut self, allow: bool) -> Self {
        self.allow_partial_results = allow;
        self
    }

    /// Opens one cursor per (shard, command) pair, all in parallel.
    ///
    /// The first non-retriable failure cancels the requests still in
    /// flight, and every cursor that was opened during the run is killed
    /// before the error is propagated, so a failed dispatch leaves no
    /// orphan cursors on any shard.
    ///
    /// # Errors
    ///
    /// Returns the first non-retriable shard error, unless partial results
    /// are allowed.
    pub async fn establish(
        &self,
        collection: &str,
        requests: Vec<(ShardId, Document)>,
    ) -> Result<EstablishedCursors> {
        if requests.is_empty() {
            return Ok(EstablishedCursors { cursors: Vec::new(), unreachable: Vec::new() });
        }

        let mut in_flight: FuturesUnordered<_> = requests
            .into_iter()
            .enumerate()
            .map(|(index, (shard, command))| {
                let service = Arc::clone(&self.service);
                let policy = self.retry_policy;
                async move {
                    let outcome = open_one(service.as_ref(), &shard, command, policy).await;
                    (index, shard, outcome)
                }
            })
            .collect();

        let mut slots: Vec<Option<(ShardId, CursorResponse)>> = Vec::new();
        slots.resize_with(in_flight.len(), || None);
        let mut unreachable = Vec::new();
        let mut first_error: Option<Error> = None;

        while let Some((index, shard, outcome)) = in_flight.next().await {
            match outcome {
                Ok(response) => {
                    slots[index] = Some((shard, response));
                }
                Err(error) if self.allow_partial_results => {
                    warn!(shard = %shard, %error, "Shard unreachable, continuing without it");
                    unreachable.push(shard);
                }
                Err(error) => {
                    // The run has already failed: stop waiting on the
                    // remaining shards and cancel their requests.
                    first_error = Some(error);
                    break;
                }
            }
        }
        drop(in_flight);

        let cursors: Vec<RemoteCursor> = slots
            .into_iter()
            .flatten()
            .map(|(shard, response)| {
                RemoteCursor::new(shard, collection, response, self.kill_sink.clone())
            })
            .collect();

        if let Some(error) = first_error {
            debug!(opened = cursors.len(), %error, "Establishment failed, killing opened cursors");
            drop(cursors);
            return Err(error);
        }
        Ok(EstablishedCursors { cursors, unreachable })
    }

    /// Opens `consumers` sub-cursors per (shard, command) pair, all in
    /// parallel. Each shard answers an exchange-bearing command with
    /// `{cursors: [<cursor reply>, ...], ok: 1}`, one entry per consumer.
    ///
    /// The result is producer-major: `result[p][c]` is producer `p`'s
    /// sub-cursor feeding consumer `c`. Partial results never apply to a
    /// fan-out; the first non-retriable failure cancels the requests still
    /// in flight and kills every sub-cursor already opened.
    ///
    /// # Errors
    ///
    /// Returns the first non-retriable shard error.
    pub async fn establish_fanout(
        &self,
        collection: &str,
        requests: Vec<(ShardId, Document)>,
        consumers: usize,
    ) -> Result<Vec<Vec<RemoteCursor>>> {
        assert!(consumers > 0, "a fan-out needs at least one consumer");
        let mut in_flight: FuturesUnordered<_> = requests
            .into_iter()
            .enumerate()
            .map(|(index, (shard, command))| {
                let service = Arc::clone(&self.service);
                let policy = self.retry_policy;
                async move {
                    let outcome =
                        open_fanout(service.as_ref(), &shard, command, policy, consumers).await;
                    (index, shard, outcome)
                }
            })
            .collect();

        let mut slots: Vec<Option<(ShardId, Vec<CursorResponse>)>> = Vec::new();
        slots.resize_with(in_flight.len(), || None);
        let mut first_error: Option<Error> = None;

        while let Some((index, shard, outcome)) = in_flight.next().await {
            match outcome {
                Ok(responses) => {
                    slots[index] = Some((shard, responses));
                }
                Err(error) => {
                    first_error = Some(error);
                    break;
                }
            }
        }
        drop(in_flight);

        let rows: Vec<Vec<RemoteCursor>> = slots
            .into_iter()
            .flatten()
            .map(|(shard, responses)| {
                responses
                    .into_iter()
                    .map(|response| {
                        RemoteCursor::new(
                            shard.clone(),
                            collection,
                            response,
                            self.kill_sink.clone(),
                        )
                    })
                    .collect()
            })
            .collect();

        if let Some(error) = first_error {
            debug!(producers = rows.len(), %error, "Fan-out failed, killing opened sub-cursors");
            drop(rows);
            return Err(error);
        }
        Ok(rows)
    }
}

/// Runs one command on one shard, retrying transient errors.
async fn run_with_retry(
    service: &dyn ShardService,
    shard: &ShardId,
    command: Document,
    policy: RetryPolicy,
) -> Result<Document> {
    assert!(policy.attempts > 0, "attempt budget must be positive");
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match service.run_command(shard, command.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(error) if error.code().is_retriable_network() && attempt < policy.attempts => {
                let backoff = policy.backoff(attempt);
                debug!(
                    shard = %shard,
                    attempt,
                    backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                    %error,
                    "Retrying cursor establishment"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(error) => return Err(error),
        }
    }
}

/// Opens one cursor on one shard.
async fn open_one(
    service: &dyn ShardService,
    shard: &ShardId,
    command: Document,
    policy: RetryPolicy,
) -> Result<CursorResponse> {
    let reply = run_with_retry(service, shard, command, policy).await?;
    CursorResponse::from_document(&reply)
}

/// Opens one producer's sub-cursor set.
async fn open_fanout(
    service: &dyn ShardService,
    shard: &ShardId,
    command: Document,
    policy: RetryPolicy,
    consumers: usize,
) -> Result<Vec<CursorResponse>> {
    let reply = run_with_retry(service, shard, command, policy).await?;
    let entries = reply.get_array("cursors").map_err(|_| {
        Error::new(ErrorCode::FailedToParse, "exchange reply is missing its cursors array")
    })?;
    if entries.len() != consumers {
        return Err(Error::new(
            ErrorCode::FailedToParse,
            format!("exchange reply carried {} cursors, expected {consumers}", entries.len()),
        ));
    }
    entries
        .iter()
        .map(|entry| {
            let reply = entry.as_document().ok_or_else(|| {
                Error::new(ErrorCode::FailedToParse, "exchange cursor entries must be documents")
            })?;
            CursorResponse::from_document(reply)
        })
        .collect()
}
