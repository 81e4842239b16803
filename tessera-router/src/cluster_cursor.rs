//! The client-facing cursor: merge-part execution over the merged stream.
//!
//! A cluster cursor pairs the async results merger with the merge-part
//! stages that run router-side. Each `next_batch` pulls merged documents,
//! threads them through the stage logic chain, and assembles one
//! client-facing batch. Router-local pipelines (no shards contacted) use
//! the same chain with the source stage synthesizing input.

use std::fmt;

use bson::Document;
use tessera_core::{unix_time_us, Namespace, OperationContext, Result};
use tessera_cursor::{AsyncResultsMerger, MergerResult};
use tessera_pipeline::{Stage, StageOutput};
use tracing::debug;

/// One batch pulled from a cluster cursor.
#[derive(Debug)]
pub struct BatchResult {
    /// The documents, in merge order.
    pub documents: Vec<Document>,
    /// True when the stream is permanently done; the cursor id reported
    /// to the client must then be zero.
    pub exhausted: bool,
}

/// A registered client-facing cursor over a merged (or router-local)
/// document stream.
pub struct ClusterCursor {
    namespace: Namespace,
    /// Absent for router-local pipelines.
    merger: Option<AsyncResultsMerger>,
    /// Router-side stages; every one carries execution logic.
    stages: Vec<Stage>,
    finished: bool,
}

impl fmt::Debug for ClusterCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterCursor")
            .field("namespace", &self.namespace)
            .field("merged", &self.merger.is_some())
            .field("stages", &self.stages.len())
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl ClusterCursor {
    /// Creates a cursor over a merged stream with router-side merge
    /// stages.
    ///
    /// # Panics
    ///
    /// Panics if any stage lacks router-side execution logic; the merge
    /// executor must not route such a pipeline here.
    #[must_use]
    pub fn merged(namespace: Namespace, merger: AsyncResultsMerger, stages: Vec<Stage>) -> Self {
        assert!(stages.iter().all(Stage::has_logic), "merge stage without router logic");
        Self { namespace, merger: Some(merger), stages, finished: false }
    }

    /// Creates a cursor for a router-local pipeline; the first stage
    /// synthesizes the input.
    ///
    /// # Panics
    ///
    /// Panics if any stage lacks execution logic, or if the first stage
    /// consumes input (there is nothing to feed it).
    #[must_use]
    pub fn local(namespace: Namespace, stages: Vec<Stage>) -> Self {
        assert!(stages.iter().all(Stage::has_logic), "local stage without router logic");
        assert!(
            stages.first().is_some_and(|stage| !stage.constraints().requires_input),
            "local pipeline needs a source stage"
        );
        Self { namespace, merger: None, stages, finished: false }
    }

    /// Returns the namespace the cursor runs against.
    #[must_use]
    pub const fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    /// Pulls the next client-facing batch.
    ///
    /// Returns early with a partial batch once at least one document is
    /// assembled and the merger would block; returns an empty batch only
    /// at exhaustion (or for an await-data stream with nothing new).
    ///
    /// # Errors
    ///
    /// Propagates merger errors and interruption; on either, the remotes
    /// are killed before the error surfaces.
    pub async fn next_batch(
        &mut self,
        batch_size: u32,
        opctx: &OperationContext,
    ) -> Result<BatchResult> {
        let mut documents: Vec<Document> = Vec::new();
        if self.finished {
            return Ok(BatchResult { documents, exhausted: true });
        }

        while documents.len() < batch_size as usize {
            if let Err(interrupt) = opctx.check_for_interrupt(unix_time_us()) {
                self.kill();
                return Err(interrupt);
            }

            let input = match &self.merger {
                Some(merger) => {
                    if !merger.ready() {
                        if !documents.is_empty() {
                            break;
                        }
                        merger.next_event().await?;
                    }
                    match merger.next_ready() {
                        Ok(MergerResult::Document(document)) => Some(document),
                        Ok(MergerResult::Eof) => None,
                        Ok(MergerResult::CloseChangeStream) => {
                            self.finished = true;
                            break;
                        }
                        Err(error) => {
                            self.kill();
                            return Err(error);
                        }
                    }
                }
                // Router-local: the source stage synthesizes documents.
                None => None,
            };
            let upstream_eof = input.is_none();

            match Self::advance_chain(&mut self.stages, input) {
                StageOutput::Advanced(document) => documents.push(document),
                StageOutput::NeedsMoreInput => {
                    if upstream_eof && self.merger.is_some() {
                        // Nothing further can arrive; the chain is done.
                        self.finish();
                        break;
                    }
                }
                StageOutput::Eof => {
                    self.finish();
                    break;
                }
            }
        }

        Ok(BatchResult { documents, exhausted: self.finished })
    }

    /// Kills the underlying remotes. Idempotent.
    pub fn kill(&mut self) {
        self.finished = true;
        if let Some(merger) = &self.merger {
            merger.kill();
        }
    }

    /// Marks the stream done, proactively killing remotes that still hold
    /// data (a router-side limit can finish before the shards do).
    fn finish(&mut self) {
        self.finished = true;
        if let Some(merger) = &self.merger {
            if !merger.remotes_exhausted() {
                debug!(namespace = %self.namespace, "Stream finished early, killing remotes");
                merger.kill();
            }
        }
    }

    /// Threads one input (or upstream EOF) through the stage chain.
    fn advance_chain(stages: &mut [Stage], input: Option<Document>) -> StageOutput {
        let mut current = input;
        for stage in stages.iter_mut() {
            let Some(logic) = stage.logic_mut() else {
                unreachable!("constructors reject stages without logic");
            };
            match logic.execute_on_next(current.take()) {
                StageOutput::Advanced(document) => current = Some(document),
                other => return other,
            }
        }
        match current {
            Some(document) => StageOutput::Advanced(document),
            None => StageOutput::Eof,
        }
    }
}
