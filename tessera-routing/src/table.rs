//! The routing table: cached routing info with coalesced refresh.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tessera_core::{Epoch, Namespace, Result};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::info::RoutingInfo;

/// Upstream source of routing information (the config/catalog servers).
///
/// Tests replace this with an in-memory double; production wires it to the
/// catalog client.
#[async_trait]
pub trait CatalogClient: Send + Sync + 'static {
    /// Fetches the current routing info for a namespace.
    ///
    /// # Errors
    ///
    /// Returns `NamespaceNotFound` if the namespace does not exist, or a
    /// network error if the catalog is unreachable.
    async fn fetch_routing_info(&self, namespace: &Namespace) -> Result<RoutingInfo>;
}

/// A cached entry, stamped with the table generation at insert time.
#[derive(Debug, Clone)]
struct CachedEntry {
    info: Arc<RoutingInfo>,
    generation: u64,
}

/// Cached mapping from namespace to routing info.
///
/// # Guarantees
///
/// - Reads are a single `RwLock` read acquisition on hit.
/// - `invalidate` is epoch-guarded: a competitor that already refreshed to
///   a newer epoch is not undone.
/// - Concurrent `refresh` calls for one namespace coalesce into a single
///   upstream fetch; waiters reuse the fetched entry.
pub struct RoutingTable {
    /// Upstream catalog.
    catalog: Arc<dyn CatalogClient>,
    /// Cache entries by namespace.
    cache: RwLock<HashMap<Namespace, CachedEntry>>,
    /// Per-namespace refresh gates.
    gates: Mutex<HashMap<Namespace, Arc<Mutex<()>>>>,
    /// Bumped on every insert; lets waiters detect a refresh that
    /// completed while they were queued on the gate.
    generation: AtomicU64,
    /// Number of upstream fetches performed (observability and tests).
    upstream_fetches: AtomicU64,
}

impl RoutingTable {
    /// Creates a routing table over the given catalog client.
    #[must_use]
    pub fn new(catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            catalog,
            cache: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            upstream_fetches: AtomicU64::new(0),
        }
    }

    /// Returns the cached routing info for a namespace, if present.
    pub async fn lookup_cached(&self, namespace: &Namespace) -> Option<Arc<RoutingInfo>> {
        self.cache
            .read()
            .await
            .get(namespace)
            .map(|entry| Arc::clone(&entry.info))
    }

    /// Returns routing info for a namespace, fetching on miss.
    ///
    /// # Errors
    ///
    /// Returns `NamespaceNotFound` (or a network error) from the upstream
    /// fetch on miss.
    pub async fn lookup(&self, namespace: &Namespace) -> Result<Arc<RoutingInfo>> {
        if let Some(info) = self.lookup_cached(namespace).await {
            return Ok(info);
        }
        self.refresh(namespace).await
    }

    /// Drops the cached entry iff its epoch is at or below `observed_epoch`.
    ///
    /// The guard keeps a concurrent competitor's newer refresh from being
    /// undone by a stale-error straggler.
    pub async fn invalidate(&self, namespace: &Namespace, observed_epoch: Epoch) {
        let mut cache = self.cache.write().await;
        if let Some(entry) = cache.get(namespace) {
            if entry.info.epoch() <= observed_epoch {
                debug!(
                    namespace = %namespace,
                    cached_epoch = entry.info.epoch().get(),
                    observed_epoch = observed_epoch.get(),
                    "Invalidating routing entry"
                );
                cache.remove(namespace);
            }
        }
    }

    /// Refreshes the routing info for a namespace from the catalog.
    ///
    /// Concurrent refreshes for one namespace coalesce: only the first
    /// caller through the gate fetches; waiters reuse its entry.
    ///
    /// # Errors
    ///
    /// Propagates the upstream fetch error.
    ///
    /// # Panics
    ///
    /// Panics if the catalog reports an epoch below the one already
    /// cached - epochs are monotonic per namespace and a regression means
    /// state corruption.
    pub async fn refresh(&self, namespace: &Namespace) -> Result<Arc<RoutingInfo>> {
        let started_at = self.generation.load(Ordering::SeqCst);
        let gate = {
            let mut gates = self.gates.lock().await;
            Arc::clone(gates.entry(namespace.clone()).or_default())
        };
        let _guard = gate.lock().await;

        // A refresh that completed while we were queued on the gate is the
        // coalesced result we were waiting for.
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(namespace) {
                if entry.generation > started_at {
                    return Ok(Arc::clone(&entry.info));
                }
            }
        }

        self.upstream_fetches.fetch_add(1, Ordering::SeqCst);
        let fetched = self.catalog.fetch_routing_info(namespace).await?;

        let mut cache = self.cache.write().await;
        if let Some(previous) = cache.get(namespace) {
            assert!(
                fetched.epoch() >= previous.info.epoch(),
                "catalog returned a regressed epoch"
            );
        }
        let info = Arc::new(fetched);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        cache.insert(
            namespace.clone(),
            CachedEntry { info: Arc::clone(&info), generation },
        );
        info!(
            namespace = %namespace,
            epoch = info.epoch().get(),
            sharded = info.is_sharded(),
            "Refreshed routing entry"
        );
        Ok(info)
    }

    /// Returns how many upstream fetches this table has performed.
    #[must_use]
    pub fn upstream_fetches(&self) -> u64 {
        self.upstream_fetches.load(Ordering::SeqCst)
    }
}
