//! Opaque pipeline stages and their advertised constraints.

use std::fmt;

use bson::{Bson, Document};

/// Where a stage is permitted to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostRequirement {
    /// Anywhere: on any shard or on the router.
    Any,
    /// Only on the primary shard of the owning database.
    PrimaryShard,
    /// Only on the router process.
    Router,
    /// On exactly one shard (any of them).
    AnyShard,
    /// On every targeted shard in parallel.
    AllShards,
}

/// Constraints a stage advertises to the splitter.
///
/// These are the only facts the core knows about a stage; what the stage
/// computes is an external concern.
#[derive(Debug, Clone, PartialEq)]
pub struct StageConstraints {
    /// Does the stage consume documents from a predecessor? A stage with
    /// `requires_input == false` synthesizes its own source and may only
    /// appear first.
    pub requires_input: bool,
    /// Where the stage may run.
    pub host_requirement: HostRequirement,
    /// Must the stage run at most once across the whole query?
    pub needs_merge: bool,
    /// May a `$match`-like filter swap ahead of this stage?
    pub can_swap_with_match: bool,
    /// May a `$limit`-like truncation swap ahead of this stage?
    pub can_swap_with_limit: bool,
    /// Is this a change-stream stage (special split rules)?
    pub change_stream: bool,
    /// If the stage ends the shards part, the merged stream must re-order
    /// on this key (sort pattern, field name to +-1 direction).
    pub sort_boundary: Option<Document>,
    /// When the stage lands in the merge part, may a copy also run on each
    /// shard to bound what the shards return (the `$limit` pattern)?
    pub duplicate_to_shards: bool,
    /// Does the merge stage benefit from an exchange fan-out?
    pub prefers_exchange: bool,
}

impl StageConstraints {
    /// Constraints for a plain parallelizable stage (`$match`-like).
    #[must_use]
    pub const fn parallel() -> Self {
        Self {
            requires_input: true,
            host_requirement: HostRequirement::Any,
            needs_merge: false,
            can_swap_with_match: true,
            can_swap_with_limit: true,
            change_stream: false,
            sort_boundary: None,
            duplicate_to_shards: false,
            prefers_exchange: false,
        }
    }

    /// Returns true if the stage may run on the router.
    #[must_use]
    pub const fn runs_on_router(&self) -> bool {
        matches!(
            self.host_requirement,
            HostRequirement::Any | HostRequirement::Router
        )
    }

    /// Returns true if the stage forces the split boundary.
    #[must_use]
    pub const fn forces_merge(&self) -> bool {
        self.needs_merge
            || matches!(
                self.host_requirement,
                HostRequirement::PrimaryShard | HostRequirement::Router
            )
    }
}

/// Output of one `execute_on_next` call on a stage's logic.
#[derive(Debug, Clone, PartialEq)]
pub enum StageOutput {
    /// A document to pass downstream.
    Advanced(Document),
    /// The stage needs another input document before producing output.
    NeedsMoreInput,
    /// The stage will produce nothing further; upstream may be abandoned.
    Eof,
}

/// The narrow execution seam for stages that can run on the router.
///
/// `input` is `None` once the upstream is exhausted; the stage may still
/// flush buffered output across repeated `None` calls until it reports
/// `Eof`.
pub trait StageLogic: Send + Sync + fmt::Debug {
    /// Feeds one input (or upstream EOF) and returns the stage's output.
    fn execute_on_next(&mut self, input: Option<Document>) -> StageOutput;
}

/// An opaque pipeline stage.
pub struct Stage {
    /// Wire name, e.g. `$match`.
    name: String,
    /// The stage body as it serializes for shards.
    body: Bson,
    /// Advertised constraints.
    constraints: StageConstraints,
    /// Router-side execution seam, when the stage library provides one.
    logic: Option<Box<dyn StageLogic>>,
}

impl Stage {
    /// Creates an opaque stage with the given constraints and no
    /// router-side logic.
    #[must_use]
    pub fn new(name: impl Into<String>, body: Bson, constraints: StageConstraints) -> Self {
        let name = name.into();
        assert!(name.starts_with('$'), "stage names start with '$'");
        Self { name, body, constraints, logic: None }
    }

    /// Attaches router-side execution logic.
    #[must_use]
    pub fn with_logic(mut self, logic: Box<dyn StageLogic>) -> Self {
        self.logic = Some(logic);
        self
    }

    /// Returns the stage's wire name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stage body.
    #[must_use]
    pub const fn body(&self) -> &Bson {
        &self.body
    }

    /// Returns the advertised constraints.
    #[must_use]
    pub const fn constraints(&self) -> &StageConstraints {
        &self.constraints
    }

    /// Returns true if router-side logic is available.
    #[must_use]
    pub const fn has_logic(&self) -> bool {
        self.logic.is_some()
    }

    /// Returns a mutable handle to the router-side logic, if any.
    pub fn logic_mut(&mut self) -> Option<&mut Box<dyn StageLogic>> {
        self.logic.as_mut()
    }

    /// Serializes the stage for a shard-directed command: `{name: body}`.
    #[must_use]
    pub fn serialize_for_shard(&self) -> Document {
        let mut doc = Document::new();
        doc.insert(self.name.clone(), self.body.clone());
        doc
    }

    /// Creates the shard-side copy of a `duplicate_to_shards` stage.
    ///
    /// The copy carries the same name and body but no merge requirement
    /// and no router-side logic; the shards execute it natively.
    #[must_use]
    pub fn duplicate_for_shards(&self) -> Self {
        assert!(
            self.constraints.duplicate_to_shards,
            "stage does not permit shard duplication"
        );
        Self {
            name: self.name.clone(),
            body: self.body.clone(),
            constraints: StageConstraints {
                needs_merge: false,
                duplicate_to_shards: false,
                ..self.constraints.clone()
            },
            logic: None,
        }
    }

    // Built-in constructors for the stages the core itself manipulates.
    // Everything else enters through `Stage::new`.

    /// A `$match` filter stage.
    #[must_use]
    pub fn match_stage(predicate: Document) -> Self {
        Self::new("$match", Bson::Document(predicate), StageConstraints::parallel())
    }

    /// A `$sort` stage; ends the shards part and records the merge key.
    #[must_use]
    pub fn sort(pattern: Document) -> Self {
        let constraints = StageConstraints {
            needs_merge: true,
            can_swap_with_match: true,
            can_swap_with_limit: false,
            sort_boundary: Some(pattern.clone()),
            ..StageConstraints::parallel()
        };
        Self::new("$sort", Bson::Document(pattern), constraints)
    }

    /// A `$limit` stage with router-side truncation logic.
    #[must_use]
    pub fn limit(limit: i64) -> Self {
        assert!(limit > 0, "limit must be positive");
        let constraints = StageConstraints {
            needs_merge: true,
            can_swap_with_match: false,
            duplicate_to_shards: true,
            ..StageConstraints::parallel()
        };
        Self::new("$limit", Bson::Int64(limit), constraints)
            .with_logic(Box::new(LimitLogic { remaining: limit }))
    }

    /// A `$skip` stage with router-side logic.
    #[must_use]
    pub fn skip(skip: i64) -> Self {
        assert!(skip >= 0, "skip cannot be negative");
        let constraints = StageConstraints {
            needs_merge: true,
            can_swap_with_match: false,
            can_swap_with_limit: false,
            ..StageConstraints::parallel()
        };
        Self::new("$skip", Bson::Int64(skip), constraints)
            .with_logic(Box::new(SkipLogic { remaining: skip }))
    }

    /// A `$group` stage; must merge, and benefits from an exchange.
    #[must_use]
    pub fn group(body: Document) -> Self {
        let constraints = StageConstraints {
            needs_merge: true,
            can_swap_with_match: false,
            can_swap_with_limit: false,
            prefers_exchange: true,
            ..StageConstraints::parallel()
        };
        Self::new("$group", Bson::Document(body), constraints)
    }

    /// An output stage that persists to an unsharded collection on the
    /// primary shard (`$merge`/`$out` family).
    #[must_use]
    pub fn out(target: impl Into<String>) -> Self {
        let constraints = StageConstraints {
            needs_merge: true,
            host_requirement: HostRequirement::PrimaryShard,
            can_swap_with_match: false,
            can_swap_with_limit: false,
            ..StageConstraints::parallel()
        };
        Self::new("$out", Bson::String(target.into()), constraints)
    }

    /// A `$changeStream` source stage.
    #[must_use]
    pub fn change_stream(options: Document) -> Self {
        let constraints = StageConstraints {
            requires_input: false,
            host_requirement: HostRequirement::AllShards,
            change_stream: true,
            can_swap_with_match: false,
            can_swap_with_limit: false,
            ..StageConstraints::parallel()
        };
        Self::new("$changeStream", Bson::Document(options), constraints)
    }

    /// A router-only source stage that synthesizes documents
    /// (`$documents` family).
    #[must_use]
    pub fn documents(docs: Vec<Document>) -> Self {
        let constraints = StageConstraints {
            requires_input: false,
            host_requirement: HostRequirement::Router,
            can_swap_with_match: false,
            can_swap_with_limit: false,
            ..StageConstraints::parallel()
        };
        let array: Vec<Bson> = docs.iter().cloned().map(Bson::Document).collect();
        Self::new("$documents", Bson::Array(array), constraints)
            .with_logic(Box::new(DocumentsLogic { pending: docs }))
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("constraints", &self.constraints)
            .field("has_logic", &self.logic.is_some())
            .finish_non_exhaustive()
    }
}

/// Router-side `$limit` execution.
#[derive(Debug)]
struct LimitLogic {
    remaining: i64,
}

impl StageLogic for LimitLogic {
    fn execute_on_next(&mut self, input: Option<Document>) -> StageOutput {
        if self.remaining == 0 {
            return StageOutput::Eof;
        }
        match input {
            Some(doc) => {
                self.remaining -= 1;
                StageOutput::Advanced(doc)
            }
            None => StageOutput::Eof,
        }
    }
}

/// Router-side `$skip` execution.
#[derive(Debug)]
struct SkipLogic {
    remaining: i64,
}

impl StageLogic for SkipLogic {
    fn execute_on_next(&mut self, input: Option<Document>) -> StageOutput {
        match input {
            Some(doc) => {
                if self.remaining > 0 {
                    self.remaining -= 1;
                    StageOutput::NeedsMoreInput
                } else {
                    StageOutput::Advanced(doc)
                }
            }
            None => StageOutput::Eof,
        }
    }
}

/// Router-side `$documents` source.
#[derive(Debug)]
struct DocumentsLogic {
    pending: Vec<Document>,
}

impl StageLogic for DocumentsLogic {
    fn execute_on_next(&mut self, _input: Option<Document>) -> StageOutput {
        if self.pending.is_empty() {
            StageOutput::Eof
        } else {
            StageOutput::Advanced(self.pending.remove(0))
        }
    }
}
