//! Router configuration.

use tessera_core::Limits;

/// Configuration for one router process.
///
/// Wraps the system [`Limits`]; the merge policy knobs the router reads
/// (`prohibit_router_merge`, `exchange_enabled`) live there too.
#[derive(Debug, Clone, Copy)]
pub struct RouterConfig {
    /// System limits and policy knobs.
    pub limits: Limits,
}

impl RouterConfig {
    /// Creates a config and validates it.
    #[must_use]
    pub fn new(limits: Limits) -> Self {
        limits.validate();
        Self { limits }
    }

    /// Forces merges off the router even when the merge part permits them.
    #[must_use]
    pub const fn prohibit_router_merge(mut self, prohibit: bool) -> Self {
        self.limits.prohibit_router_merge = prohibit;
        self
    }

    /// Enables or disables exchange-mode merges.
    #[must_use]
    pub const fn exchange_enabled(mut self, enabled: bool) -> Self {
        self.limits.exchange_enabled = enabled;
        self
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self::new(Limits::default())
    }
}
