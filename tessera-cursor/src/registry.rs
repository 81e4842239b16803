//! The process-wide registry of client-facing cursors.
//!
//! Cursors are keyed by a random non-zero 64-bit id. Access is an
//! exclusive lease: `check_out` removes the payload so a second
//! concurrent `getMore` on the same id fails with `CursorInUse`, and
//! `check_in` restores it. Kills are safe while leased; deletion then
//! happens at check-in.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tessera_core::{unix_time_us, CursorId, Error, Limits, Namespace, Result};
use tracing::{debug, info};

/// Whether the reaper may collect an idle cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorLifetime {
    /// Reaped after `cursor_timeout_us` without a getMore.
    Mortal,
    /// Never reaped; destroyed only by exhaustion or explicit kill.
    Immortal,
}

/// How many shards feed the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorType {
    /// One remote cursor on one shard.
    SingleTarget,
    /// A merged stream over several shards.
    MultiTarget,
}

/// Outcome of a kill request, in the shape the killCursors reply needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillResult {
    /// The cursor was found and destroyed (or marked for destruction at
    /// check-in, if currently leased).
    Killed,
    /// No cursor with that id exists.
    NotFound,
    /// The cursor exists but the requesting users do not own it.
    Unauthorized,
}

enum Slot<T> {
    Available(T),
    Leased,
}

struct Entry<T> {
    namespace: Namespace,
    owning_users: BTreeSet<String>,
    lifetime: CursorLifetime,
    cursor_type: CursorType,
    last_access_us: u64,
    kill_pending: bool,
    slot: Slot<T>,
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegistryStats {
    /// Cursors currently registered.
    pub open: u64,
    /// Cursors currently checked out.
    pub leased: u64,
    /// Cursors reaped for idleness since process start.
    pub reaped_total: u64,
}

/// Process-wide table of active router-side cursors.
///
/// Generic over the payload so the router stores its cluster cursors and
/// tests store whatever double they need.
pub struct CursorRegistry<T> {
    limits: Limits,
    entries: Mutex<HashMap<CursorId, Entry<T>>>,
    reaped_total: Mutex<u64>,
}

impl<T> CursorRegistry<T> {
    /// Creates an empty registry governed by the given limits.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        limits.validate();
        Self {
            limits,
            entries: Mutex::new(HashMap::new()),
            reaped_total: Mutex::new(0),
        }
    }

    fn lock_entries(&self) -> MutexGuard<'_, HashMap<CursorId, Entry<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Registers a cursor and returns its new id.
    ///
    /// The id is random, non-zero, and unique within the process; clients
    /// must not be able to guess another session's id.
    pub fn register(
        &self,
        value: T,
        namespace: Namespace,
        owning_users: BTreeSet<String>,
        lifetime: CursorLifetime,
        cursor_type: CursorType,
        current_time_us: u64,
    ) -> CursorId {
        let mut entries = self.lock_entries();
        let mut rng = rand::thread_rng();
        let id = loop {
            let candidate = CursorId::new(rng.gen_range(1..=u64::MAX));
            if !entries.contains_key(&candidate) {
                break candidate;
            }
        };
        entries.insert(
            id,
            Entry {
                namespace,
                owning_users,
                lifetime,
                cursor_type,
                last_access_us: current_time_us,
                kill_pending: false,
                slot: Slot::Available(value),
            },
        );
        debug!(cursor_id = id.get(), open = entries.len(), "Registered cursor");
        id
    }

    /// Takes an exclusive lease on a cursor.
    ///
    /// # Errors
    ///
    /// `CursorNotFound` if no such id, `Unauthorized` if the owning users
    /// are not a subset of the authenticated users, `CursorInUse` if the
    /// cursor is already leased.
    pub fn check_out(
        &self,
        id: CursorId,
        authenticated_users: &BTreeSet<String>,
        current_time_us: u64,
    ) -> Result<T> {
        let mut entries = self.lock_entries();
        let entry = entries
            .get_mut(&id)
            .ok_or_else(|| Error::cursor_not_found(id.get()))?;

        if !entry.owning_users.is_subset(authenticated_users) {
            return Err(Error::unauthorized("cursor"));
        }
        match std::mem::replace(&mut entry.slot, Slot::Leased) {
            Slot::Available(value) => {
                entry.last_access_us = current_time_us;
                Ok(value)
            }
            Slot::Leased => Err(Error::cursor_in_use(id.get())),
        }
    }

    /// Releases a lease, restoring the payload.
    ///
    /// If a kill arrived while the cursor was leased, the entry is deleted
    /// instead and the payload dropped.
    pub fn check_in(&self, id: CursorId, value: T, current_time_us: u64) {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(&id) else {
            // Reaper and kill never remove a leased entry, so the id must
            // still be present.
            unreachable!("check_in of unregistered cursor");
        };
        assert!(matches!(entry.slot, Slot::Leased), "check_in without a lease");

        if entry.kill_pending {
            entries.remove(&id);
            debug!(cursor_id = id.get(), "Deferred kill applied at check-in");
            return;
        }
        entry.last_access_us = current_time_us;
        entry.slot = Slot::Available(value);
    }

    /// Destroys a leased cursor without restoring it (exhaustion path).
    pub fn retire(&self, id: CursorId) {
        let mut entries = self.lock_entries();
        let removed = entries.remove(&id);
        assert!(
            removed.is_some_and(|entry| matches!(entry.slot, Slot::Leased)),
            "retire without a lease"
        );
    }

    /// Kills a cursor. Idempotent: killing an absent id reports
    /// `NotFound`, which is not an error at this layer.
    ///
    /// `authenticated_users` of `None` bypasses the ownership check (the
    /// reaper and process shutdown use this).
    pub fn kill(
        &self,
        id: CursorId,
        authenticated_users: Option<&BTreeSet<String>>,
    ) -> KillResult {
        let mut entries = self.lock_entries();
        let Some(entry) = entries.get_mut(&id) else {
            return KillResult::NotFound;
        };
        if let Some(users) = authenticated_users {
            if !entry.owning_users.is_subset(users) {
                return KillResult::Unauthorized;
            }
        }
        if matches!(entry.slot, Slot::Leased) {
            entry.kill_pending = true;
        } else {
            entries.remove(&id);
        }
        debug!(cursor_id = id.get(), "Killed cursor");
        KillResult::Killed
    }

    /// Kills every mortal, unleased cursor idle past the timeout. Returns
    /// the reaped ids.
    pub fn reap(&self, current_time_us: u64) -> Vec<CursorId> {
        let timeout_us = self.limits.cursor_timeout_us;
        let mut entries = self.lock_entries();
        let expired: Vec<CursorId> = entries
            .iter()
            .filter(|(_, entry)| {
                entry.lifetime == CursorLifetime::Mortal
                    && matches!(entry.slot, Slot::Available(_))
                    && current_time_us.saturating_sub(entry.last_access_us) > timeout_us
            })
            .map(|(id, _)| *id)
            .collect();
        for id in &expired {
            entries.remove(id);
        }
        drop(entries);
        if !expired.is_empty() {
            let mut total = match self.reaped_total.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            *total += expired.len() as u64;
            info!(reaped = expired.len(), "Reaped idle cursors");
        }
        expired
    }

    /// Returns the namespace a cursor was registered under, if present.
    #[must_use]
    pub fn namespace_of(&self, id: CursorId) -> Option<Namespace> {
        self.lock_entries().get(&id).map(|entry| entry.namespace.clone())
    }

    /// Returns the cursor type, if present.
    #[must_use]
    pub fn type_of(&self, id: CursorId) -> Option<CursorType> {
        self.lock_entries().get(&id).map(|entry| entry.cursor_type)
    }

    /// Returns current registry counters.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let entries = self.lock_entries();
        let leased = entries
            .values()
            .filter(|entry| matches!(entry.slot, Slot::Leased))
            .count() as u64;
        let reaped_total = match self.reaped_total.lock() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        };
        RegistryStats {
            open: entries.len() as u64,
            leased,
            reaped_total,
        }
    }
}

impl<T: Send + 'static> CursorRegistry<T> {
    /// Spawns the background reaper loop for this registry.
    ///
    /// The task holds a weak handle, so dropping the last strong reference
    /// to the registry stops the loop.
    pub fn start_reaper(self: &Arc<Self>) {
        let interval = Duration::from_micros(self.limits.reaper_interval_us);
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = weak.upgrade() else { return };
                registry.reap(unix_time_us());
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(ToString::to_string).collect()
    }

    fn registry() -> CursorRegistry<String> {
        CursorRegistry::new(Limits::default())
    }

    fn register(reg: &CursorRegistry<String>, owner: &str, now: u64) -> CursorId {
        reg.register(
            "payload".to_string(),
            Namespace::new("db", "coll"),
            users(&[owner]),
            CursorLifetime::Mortal,
            CursorType::MultiTarget,
            now,
        )
    }

    #[test]
    fn test_lease_cycle() {
        let reg = registry();
        let id = register(&reg, "alice", 0);

        let value = reg.check_out(id, &users(&["alice"]), 10).unwrap();
        assert_eq!(value, "payload");
        assert_eq!(reg.stats().leased, 1);

        // A second concurrent getMore on the same id is rejected.
        let error = reg.check_out(id, &users(&["alice"]), 11).unwrap_err();
        assert_eq!(error.code(), tessera_core::ErrorCode::CursorInUse);

        reg.check_in(id, value, 20);
        assert_eq!(reg.stats().leased, 0);
        let _ = reg.check_out(id, &users(&["alice"]), 30).unwrap();
    }

    #[test]
    fn test_authorization_is_subset_of_authenticated() {
        let reg = registry();
        let id = register(&reg, "alice", 0);

        let error = reg.check_out(id, &users(&["bob"]), 1).unwrap_err();
        assert_eq!(error.code(), tessera_core::ErrorCode::Unauthorized);

        // The cursor stays valid for its owner afterwards.
        let value = reg.check_out(id, &users(&["alice", "admin"]), 2).unwrap();
        reg.check_in(id, value, 3);
    }

    #[test]
    fn test_kill_is_idempotent() {
        let reg = registry();
        let id = register(&reg, "alice", 0);

        assert_eq!(reg.kill(id, None), KillResult::Killed);
        assert_eq!(reg.kill(id, None), KillResult::NotFound);
        assert_eq!(reg.stats().open, 0);
    }

    #[test]
    fn test_kill_while_leased_defers_to_check_in() {
        let reg = registry();
        let id = register(&reg, "alice", 0);
        let value = reg.check_out(id, &users(&["alice"]), 1).unwrap();

        assert_eq!(reg.kill(id, None), KillResult::Killed);
        // Still present until the lease is returned.
        assert_eq!(reg.stats().open, 1);

        reg.check_in(id, value, 2);
        assert_eq!(reg.stats().open, 0);
        let error = reg.check_out(id, &users(&["alice"]), 3).unwrap_err();
        assert_eq!(error.code(), tessera_core::ErrorCode::CursorNotFound);
    }

    #[test]
    fn test_kill_checks_ownership() {
        let reg = registry();
        let id = register(&reg, "alice", 0);
        assert_eq!(reg.kill(id, Some(&users(&["bob"]))), KillResult::Unauthorized);
        assert_eq!(reg.kill(id, Some(&users(&["alice"]))), KillResult::Killed);
    }

    #[test]
    fn test_reaper_collects_idle_mortal_cursors() {
        let limits = Limits { cursor_timeout_us: 100, ..Limits::default() };
        let reg: CursorRegistry<String> = CursorRegistry::new(limits);
        let mortal = reg.register(
            "m".to_string(),
            Namespace::new("db", "coll"),
            users(&["alice"]),
            CursorLifetime::Mortal,
            CursorType::SingleTarget,
            0,
        );
        let immortal = reg.register(
            "i".to_string(),
            Namespace::new("db", "coll"),
            users(&["alice"]),
            CursorLifetime::Immortal,
            CursorType::SingleTarget,
            0,
        );

        assert!(reg.reap(100).is_empty(), "not yet past the timeout");
        let reaped = reg.reap(101);
        assert_eq!(reaped, vec![mortal]);
        assert!(reg.namespace_of(immortal).is_some());
        assert_eq!(reg.stats().reaped_total, 1);
    }

    #[test]
    fn test_reaper_skips_leased_cursors() {
        let limits = Limits { cursor_timeout_us: 100, ..Limits::default() };
        let reg: CursorRegistry<String> = CursorRegistry::new(limits);
        let id = register_with(&reg, 0);
        let value = reg.check_out(id, &users(&["alice"]), 0).unwrap();

        assert!(reg.reap(10_000).is_empty());
        reg.check_in(id, value, 10_000);
        assert_eq!(reg.reap(100_000), vec![id]);
    }

    fn register_with(reg: &CursorRegistry<String>, now: u64) -> CursorId {
        reg.register(
            "payload".to_string(),
            Namespace::new("db", "coll"),
            users(&["alice"]),
            CursorLifetime::Mortal,
            CursorType::MultiTarget,
            now,
        )
    }

    #[test]
    fn test_register_kill_equals_full_cycle_then_kill() {
        let reg = registry();

        let id = register(&reg, "alice", 0);
        let value = reg.check_out(id, &users(&["alice"]), 1).unwrap();
        reg.check_in(id, value, 2);
        reg.kill(id, None);
        let after_cycle = reg.stats();

        let id = register(&reg, "alice", 0);
        reg.kill(id, None);
        assert_eq!(reg.stats(), after_cycle);
    }
}
