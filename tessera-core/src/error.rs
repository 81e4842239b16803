//! Error types for Tessera operations.
//!
//! Following `TigerStyle`: all errors must be handled explicitly.
//! The error model mirrors the wire shape - every error carries a numeric
//! code and a code name, and may carry labels the client driver acts on.

use std::fmt;

/// The result type for Tessera operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Wire-level error codes recognized by the router core.
///
/// The numeric values are part of the protocol and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Host is unreachable.
    HostUnreachable = 6,
    /// A command document could not be parsed.
    FailedToParse = 9,
    /// The authenticated users do not own the resource.
    Unauthorized = 13,
    /// The namespace does not exist.
    NamespaceNotFound = 26,
    /// The cursor id is not registered (or has been reaped).
    CursorNotFound = 43,
    /// The operation exceeded its time limit.
    ExceededTimeLimit = 50,
    /// The shard rejected a command carrying a stale shard version.
    StaleShardVersion = 63,
    /// A network round trip timed out.
    NetworkTimeout = 89,
    /// The shard rejected a command carrying a stale routing epoch.
    StaleEpoch = 150,
    /// A query matched more documents than the operation permits.
    TooManyMatchingDocuments = 182,
    /// The cursor was killed while the operation was using it.
    CursorKilled = 237,
    /// The requested read snapshot is no longer available.
    SnapshotUnavailable = 246,
    /// A change stream must be closed (invalidate event observed).
    CloseChangeStream = 267,
    /// The cursor is exclusively leased by another operation.
    CursorInUse = 292,
    /// The targeted node is not the primary of its replica set.
    NotPrimary = 10107,
    /// The operation was interrupted (client kill or deadline cascade).
    Interrupted = 11601,
}

impl ErrorCode {
    /// Returns the wire code name token.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::HostUnreachable => "HostUnreachable",
            Self::FailedToParse => "FailedToParse",
            Self::Unauthorized => "Unauthorized",
            Self::NamespaceNotFound => "NamespaceNotFound",
            Self::CursorNotFound => "CursorNotFound",
            Self::ExceededTimeLimit => "ExceededTimeLimit",
            Self::StaleShardVersion => "StaleShardVersion",
            Self::NetworkTimeout => "NetworkTimeout",
            Self::StaleEpoch => "StaleEpoch",
            Self::TooManyMatchingDocuments => "TooManyMatchingDocuments",
            Self::CursorKilled => "CursorKilled",
            Self::SnapshotUnavailable => "SnapshotUnavailable",
            Self::CloseChangeStream => "CloseChangeStream",
            Self::CursorInUse => "CursorInUse",
            Self::NotPrimary => "NotPrimary",
            Self::Interrupted => "Interrupted",
        }
    }

    /// Returns the numeric wire code.
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Builds a code from its numeric wire value, if recognized.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        match code {
            6 => Some(Self::HostUnreachable),
            9 => Some(Self::FailedToParse),
            13 => Some(Self::Unauthorized),
            26 => Some(Self::NamespaceNotFound),
            43 => Some(Self::CursorNotFound),
            50 => Some(Self::ExceededTimeLimit),
            63 => Some(Self::StaleShardVersion),
            89 => Some(Self::NetworkTimeout),
            150 => Some(Self::StaleEpoch),
            182 => Some(Self::TooManyMatchingDocuments),
            237 => Some(Self::CursorKilled),
            246 => Some(Self::SnapshotUnavailable),
            267 => Some(Self::CloseChangeStream),
            292 => Some(Self::CursorInUse),
            10107 => Some(Self::NotPrimary),
            11601 => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Returns true for the stale-routing family of errors.
    ///
    /// These are locally recoverable by refreshing the routing table,
    /// up to the stale-retry budget.
    #[must_use]
    pub const fn is_stale_routing(self) -> bool {
        matches!(self, Self::StaleShardVersion | Self::StaleEpoch)
    }

    /// Returns true for transient network errors that idempotent reads
    /// may retry per the caller's retry policy.
    #[must_use]
    pub const fn is_retriable_network(self) -> bool {
        matches!(
            self,
            Self::HostUnreachable | Self::NetworkTimeout | Self::NotPrimary
        )
    }

    /// Returns true for cursor-lifecycle errors, which map 1:1 to client
    /// error codes and are never retried inside the core.
    #[must_use]
    pub const fn is_cursor_lifecycle(self) -> bool {
        matches!(
            self,
            Self::CursorNotFound | Self::CursorInUse | Self::CursorKilled
        )
    }
}

/// Labels attached to errors for the client driver's benefit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLabel {
    /// The whole transaction may be retried by the client driver.
    TransientTransaction,
    /// The individual write may be retried by the client driver.
    RetryableWrite,
}

impl ErrorLabel {
    /// Returns the wire token for this label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::TransientTransaction => "TransientTransactionError",
            Self::RetryableWrite => "RetryableWriteError",
        }
    }

    /// Parses a wire token into a label, if recognized.
    #[must_use]
    pub fn from_str_opt(token: &str) -> Option<Self> {
        match token {
            "TransientTransactionError" => Some(Self::TransientTransaction),
            "RetryableWriteError" => Some(Self::RetryableWrite),
            _ => None,
        }
    }
}

/// An error surfaced by the router core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Error {
    /// The wire code.
    code: ErrorCode,
    /// Human-readable description.
    message: String,
    /// Labels for the client driver.
    labels: Vec<ErrorLabel>,
}

impl Error {
    /// Creates a new error with the given code and message.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            labels: Vec::new(),
        }
    }

    /// Attaches a label to this error.
    #[must_use]
    pub fn with_label(mut self, label: ErrorLabel) -> Self {
        if !self.labels.contains(&label) {
            self.labels.push(label);
        }
        self
    }

    /// Returns the wire code.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        self.code
    }

    /// Returns the message text.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the attached labels.
    #[must_use]
    pub fn labels(&self) -> &[ErrorLabel] {
        &self.labels
    }

    /// Returns true if this error carries the given label.
    #[must_use]
    pub fn has_label(&self, label: ErrorLabel) -> bool {
        self.labels.contains(&label)
    }

    // Convenience constructors for the common cases.

    /// The namespace does not exist.
    #[must_use]
    pub fn namespace_not_found(ns: &impl fmt::Display) -> Self {
        Self::new(ErrorCode::NamespaceNotFound, format!("namespace {ns} not found"))
    }

    /// The cursor id is not registered.
    #[must_use]
    pub fn cursor_not_found(id: u64) -> Self {
        Self::new(ErrorCode::CursorNotFound, format!("cursor {id} not found"))
    }

    /// The cursor is leased by another operation.
    #[must_use]
    pub fn cursor_in_use(id: u64) -> Self {
        Self::new(ErrorCode::CursorInUse, format!("cursor {id} is already in use"))
    }

    /// The authenticated users do not own the cursor.
    #[must_use]
    pub fn unauthorized(what: &str) -> Self {
        Self::new(ErrorCode::Unauthorized, format!("not authorized for {what}"))
    }

    /// The operation was interrupted.
    #[must_use]
    pub fn interrupted(reason: &str) -> Self {
        Self::new(ErrorCode::Interrupted, format!("operation interrupted: {reason}"))
    }

    /// The operation ran past its deadline.
    #[must_use]
    pub fn exceeded_time_limit(operation: &str) -> Self {
        Self::new(
            ErrorCode::ExceededTimeLimit,
            format!("operation {operation} exceeded its time limit"),
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code.name(), self.code.code(), self.message)
    }
}

impl std::error::Error for Error {}
