//! Per-operation context: deadline, authenticated users, transaction state.
//!
//! Every request into the router carries an `OperationContext`. The context
//! is cheap to clone (shared interior state) so it can travel into spawned
//! network tasks, and interruption observed anywhere cascades everywhere.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bson::Document;

use crate::error::{Error, Result};
use crate::types::ShardId;

/// Cluster transaction descriptor for an operation.
///
/// The dispatcher uses this to attach `lsid` / `txnNumber` / `autocommit`
/// fields to shard-directed commands, `startTransaction` on the first
/// contact with each participant, and the read concern only on a
/// participant's first command.
#[derive(Debug, Clone)]
pub struct TxnContext {
    /// Logical session id.
    lsid: String,
    /// Transaction number within the session.
    txn_number: i64,
    /// Read concern to attach on each participant's first command.
    read_concern: Option<Document>,
    /// Shards already contacted inside this transaction.
    participants: Arc<Mutex<BTreeSet<ShardId>>>,
}

impl TxnContext {
    /// Creates a new transaction descriptor.
    #[must_use]
    pub fn new(lsid: impl Into<String>, txn_number: i64) -> Self {
        Self {
            lsid: lsid.into(),
            txn_number,
            read_concern: None,
            participants: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Sets the read concern attached on first contact with a participant.
    #[must_use]
    pub fn with_read_concern(mut self, read_concern: Document) -> Self {
        self.read_concern = Some(read_concern);
        self
    }

    /// Returns the logical session id.
    #[must_use]
    pub fn lsid(&self) -> &str {
        &self.lsid
    }

    /// Returns the transaction number.
    #[must_use]
    pub const fn txn_number(&self) -> i64 {
        self.txn_number
    }

    /// Returns the read concern, if one was set.
    #[must_use]
    pub const fn read_concern(&self) -> Option<&Document> {
        self.read_concern.as_ref()
    }

    /// Records contact with a participant shard.
    ///
    /// Returns true if this was the first contact inside this transaction;
    /// the caller then attaches `startTransaction` and the read concern.
    pub fn mark_participant(&self, shard: &ShardId) -> bool {
        self.participants
            .lock()
            .expect("participant set poisoned")
            .insert(shard.clone())
    }

    /// Returns the set of participants contacted so far.
    #[must_use]
    pub fn participants(&self) -> BTreeSet<ShardId> {
        self.participants
            .lock()
            .expect("participant set poisoned")
            .clone()
    }
}

/// Context threaded through one router operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    /// Authenticated user names for this operation.
    users: BTreeSet<String>,
    /// Absolute deadline in microseconds since the Unix epoch.
    deadline_us: Option<u64>,
    /// Set when the operation is interrupted (client kill, shutdown).
    interrupted: Arc<AtomicBool>,
    /// Transaction descriptor, when running inside a cluster transaction.
    txn: Option<TxnContext>,
}

impl OperationContext {
    /// Creates a context with no users, no deadline, and no transaction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            users: BTreeSet::new(),
            deadline_us: None,
            interrupted: Arc::new(AtomicBool::new(false)),
            txn: None,
        }
    }

    /// Adds an authenticated user.
    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.users.insert(user.into());
        self
    }

    /// Sets the absolute deadline in microseconds since the Unix epoch.
    #[must_use]
    pub const fn with_deadline_us(mut self, deadline_us: u64) -> Self {
        self.deadline_us = Some(deadline_us);
        self
    }

    /// Attaches a transaction descriptor.
    #[must_use]
    pub fn with_txn(mut self, txn: TxnContext) -> Self {
        self.txn = Some(txn);
        self
    }

    /// Returns the authenticated users.
    #[must_use]
    pub const fn users(&self) -> &BTreeSet<String> {
        &self.users
    }

    /// Returns the transaction descriptor, if any.
    #[must_use]
    pub const fn txn(&self) -> Option<&TxnContext> {
        self.txn.as_ref()
    }

    /// Returns the deadline, if any.
    #[must_use]
    pub const fn deadline_us(&self) -> Option<u64> {
        self.deadline_us
    }

    /// Marks the operation interrupted. Idempotent.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }

    /// Returns true if the operation has been interrupted.
    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    /// Checks for interruption and deadline expiry.
    ///
    /// # Errors
    ///
    /// Returns `Interrupted` if the operation was marked interrupted, or
    /// `ExceededTimeLimit` if `current_time_us` is past the deadline.
    pub fn check_for_interrupt(&self, current_time_us: u64) -> Result<()> {
        if self.is_interrupted() {
            return Err(Error::interrupted("operation was killed"));
        }
        if let Some(deadline) = self.deadline_us {
            if current_time_us > deadline {
                return Err(Error::exceeded_time_limit("request"));
            }
        }
        Ok(())
    }
}

impl Default for OperationContext {
    fn default() -> Self {
        Self::new()
    }
}
