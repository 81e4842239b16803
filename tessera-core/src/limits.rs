//! System limits and configuration bounds.
//!
//! Following `TigerStyle`: put limits on everything.
//! Every retry budget, timeout, and parallelism knob recognized by the
//! router core is enumerated here with an explicit default.

/// Default retry budget for stale-version rebuilds.
pub const MAX_STALE_RETRIES_DEFAULT: u32 = 10;

/// Default idle timeout for mortal cursors (10 minutes).
pub const CURSOR_TIMEOUT_US_DEFAULT: u64 = 600_000_000;

/// Default sweep interval for the cursor reaper (60 seconds).
pub const REAPER_INTERVAL_US_DEFAULT: u64 = 60_000_000;

/// Default per-shard attempt budget for idempotent cursor establishment.
pub const ESTABLISH_ATTEMPTS_DEFAULT: u32 = 3;

/// Default base for exponential retry backoff in milliseconds.
pub const BACKOFF_BASE_MS_DEFAULT: u64 = 10;

/// Default attempt budget for each retried cloner phase.
pub const CLONER_ATTEMPTS_DEFAULT: u32 = 3;

/// Default cloner parallelism (one plain find cursor).
pub const MAX_CLONER_CURSORS_DEFAULT: u32 = 1;

/// Default number of documents per client-facing batch.
pub const BATCH_SIZE_DEFAULT: u32 = 101;

/// Maximum supported cloner parallelism.
pub const MAX_CLONER_CURSORS_MAX: u32 = 64;

/// System-wide limits for the Tessera router core.
///
/// All limits are explicit and configurable. Default values are chosen
/// to be safe for most deployments while allowing customization.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    // Routing limits.
    /// Retry budget for stale-version rebuilds.
    pub max_stale_retries: u32,

    // Cursor lifecycle limits.
    /// Idle timeout for mortal cursors in microseconds.
    pub cursor_timeout_us: u64,
    /// Sweep interval for the cursor reaper in microseconds.
    pub reaper_interval_us: u64,
    /// Documents per client-facing batch when the client does not say.
    pub default_batch_size: u32,

    // Merge policy limits.
    /// Force off router-local merges even when the merge part permits them.
    pub prohibit_router_merge: bool,
    /// Allow exchange-mode merges when the splitter emits an exchange spec.
    pub exchange_enabled: bool,

    // Establishment limits.
    /// Per-shard attempt budget for idempotent cursor establishment.
    pub establish_attempts: u32,
    /// Base for exponential retry backoff in milliseconds.
    pub backoff_base_ms: u64,

    // Cloner limits.
    /// Attempt budget for the cloner's count phase.
    pub count_attempts: u32,
    /// Attempt budget for the cloner's listIndexes phase.
    pub list_indexes_attempts: u32,
    /// Attempt budget for the cloner's find phase.
    pub find_attempts: u32,
    /// Number of concurrent cursors the cloner may open.
    pub max_cloner_cursors: u32,
}

impl Limits {
    /// Validates internal consistency of the limits.
    ///
    /// # Panics
    ///
    /// Panics if any limit is zero where a zero makes no sense, or if the
    /// cloner parallelism exceeds the supported maximum.
    pub fn validate(&self) {
        assert!(self.max_stale_retries > 0, "stale retry budget must be positive");
        assert!(self.cursor_timeout_us > 0, "cursor timeout must be positive");
        assert!(self.reaper_interval_us > 0, "reaper interval must be positive");
        assert!(self.establish_attempts > 0, "establish attempts must be positive");
        assert!(self.max_cloner_cursors > 0, "cloner cursors must be positive");
        assert!(
            self.max_cloner_cursors <= MAX_CLONER_CURSORS_MAX,
            "cloner cursors exceed supported maximum"
        );
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_stale_retries: MAX_STALE_RETRIES_DEFAULT,
            cursor_timeout_us: CURSOR_TIMEOUT_US_DEFAULT,
            reaper_interval_us: REAPER_INTERVAL_US_DEFAULT,
            default_batch_size: BATCH_SIZE_DEFAULT,
            prohibit_router_merge: false,
            exchange_enabled: true,
            establish_attempts: ESTABLISH_ATTEMPTS_DEFAULT,
            backoff_base_ms: BACKOFF_BASE_MS_DEFAULT,
            count_attempts: CLONER_ATTEMPTS_DEFAULT,
            list_indexes_attempts: CLONER_ATTEMPTS_DEFAULT,
            find_attempts: CLONER_ATTEMPTS_DEFAULT,
            max_cloner_cursors: MAX_CLONER_CURSORS_DEFAULT,
        }
    }
}
