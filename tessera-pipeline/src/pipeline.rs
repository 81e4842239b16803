//! Pipelines: an ordered sequence of stages plus evaluation context.

use bson::{Bson, Document};
use tessera_core::Collation;

use crate::stage::Stage;

/// Cursor tailing mode for a pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailableMode {
    /// A normal cursor: EOF on all remotes closes the stream.
    #[default]
    None,
    /// Tailable: EOF does not close the stream; no server-side wait.
    Tailable,
    /// Tailable with a bounded server-side wait for new data.
    TailableAwaitData,
}

/// Evaluation context threaded through a pipeline.
#[derive(Debug, Clone, Default)]
pub struct PipelineContext {
    /// Collation for string comparisons.
    pub collation: Collation,
    /// Collection UUID, if resolved.
    pub uuid: Option<String>,
    /// Explain request: produce a plan instead of a cursor.
    pub explain: bool,
    /// Cursor tailing mode.
    pub tailable: TailableMode,
}

/// A validated aggregation pipeline.
#[derive(Debug)]
pub struct Pipeline {
    /// The stages, in order.
    stages: Vec<Stage>,
    /// Evaluation context.
    context: PipelineContext,
}

impl Pipeline {
    /// Creates a pipeline from stages and a context.
    ///
    /// # Panics
    ///
    /// Panics if a source-synthesizing stage (`requires_input == false`)
    /// appears anywhere but first - the predecessor's output would have
    /// nowhere to go.
    #[must_use]
    pub fn new(stages: Vec<Stage>, context: PipelineContext) -> Self {
        for stage in stages.iter().skip(1) {
            assert!(
                stage.constraints().requires_input,
                "source stages may only appear first"
            );
        }
        Self { stages, context }
    }

    /// Returns the stages.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Returns the evaluation context.
    #[must_use]
    pub const fn context(&self) -> &PipelineContext {
        &self.context
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if the pipeline has no stages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns true if any stage is a change-stream stage.
    #[must_use]
    pub fn has_change_stream(&self) -> bool {
        self.stages
            .iter()
            .any(|stage| stage.constraints().change_stream)
    }

    /// Returns the predicate of a leading `$match`, used for shard
    /// targeting. The predicate must be the first stage to be usable -
    /// later filters see transformed documents.
    #[must_use]
    pub fn leading_match(&self) -> Option<&Document> {
        let first = self.stages.first()?;
        if first.name() == "$match" {
            first.body().as_document()
        } else {
            None
        }
    }

    /// Decomposes the pipeline into stages and context.
    #[must_use]
    pub fn into_parts(self) -> (Vec<Stage>, PipelineContext) {
        (self.stages, self.context)
    }

    /// Serializes the stages as the wire `pipeline` array.
    #[must_use]
    pub fn serialize(&self) -> Vec<Bson> {
        serialize_stages(&self.stages)
    }
}

/// Serializes a slice of stages as the wire `pipeline` array.
#[must_use]
pub(crate) fn serialize_stages(stages: &[Stage]) -> Vec<Bson> {
    stages
        .iter()
        .map(|stage| Bson::Document(stage.serialize_for_shard()))
        .collect()
}
