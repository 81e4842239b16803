//! Copy-progress reporting.

use std::time::{Duration, Instant};

use tracing::info;

/// Log at least this often while documents are flowing.
const LOG_INTERVAL: Duration = Duration::from_secs(10);
/// Or after this many documents since the last log line.
const LOG_EVERY_DOCS: u64 = 10_000;

/// Tracks copied documents against the expected total and logs on a
/// document/time cadence.
pub(crate) struct ProgressMeter {
    collection: String,
    expected: u64,
    copied: u64,
    logged_at: Instant,
    logged_docs: u64,
}

impl ProgressMeter {
    pub(crate) fn new(collection: impl Into<String>, expected: u64) -> Self {
        Self {
            collection: collection.into(),
            expected,
            copied: 0,
            logged_at: Instant::now(),
            logged_docs: 0,
        }
    }

    pub(crate) const fn copied(&self) -> u64 {
        self.copied
    }

    pub(crate) fn add(&mut self, documents: u64) {
        self.copied += documents;
        if self.copied - self.logged_docs >= LOG_EVERY_DOCS
            || self.logged_at.elapsed() >= LOG_INTERVAL
        {
            info!(
                collection = %self.collection,
                copied = self.copied,
                expected = self.expected,
                "Clone progress"
            );
            self.logged_at = Instant::now();
            self.logged_docs = self.copied;
        }
    }
}
