//! Tunables for the synchronization core.

use std::time::Duration;

/// Limits and idle timeouts shared by the registry and the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Longest document kept, in characters (0 = unlimited).
    pub max_chars: usize,
    /// Maximum number of live views (0 = unlimited).
    pub max_views: usize,
    /// Views idle longer than this are dropped by the sweep.
    pub view_timeout: Duration,
    /// Stored documents untouched for this long are purged from storage.
    pub text_timeout: Duration,
    /// Partially received buffers idle longer than this are discarded.
    pub buffer_timeout: Duration,
    /// Time budget for a single diff computation.
    pub diff_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_chars: 0,
            max_views: 10_000,
            view_timeout: Duration::from_secs(30 * 60),
            text_timeout: Duration::from_secs(24 * 60 * 60),
            buffer_timeout: Duration::from_secs(15 * 60),
            diff_timeout: Duration::from_millis(100),
        }
    }
}

impl SyncConfig {
    /// Short timeouts so sweeps can be exercised in tests.
    pub fn for_testing() -> Self {
        Self {
            max_views: 100,
            view_timeout: Duration::from_millis(50),
            text_timeout: Duration::from_secs(60),
            buffer_timeout: Duration::from_millis(50),
            diff_timeout: Duration::from_secs(1),
            ..Self::default()
        }
    }
}
