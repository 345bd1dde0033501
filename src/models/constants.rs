/// Default number of remediation attempts per fix loop.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base inter-attempt delay for the fix loop, doubled per attempt.
pub const DEFAULT_RETRY_BASE_MS: u64 = 250;

/// Cap on the inter-attempt delay.
pub const DEFAULT_RETRY_MAX_MS: u64 = 5_000;

/// Similarity below which a fix memory match is ignored.
pub const DEFAULT_MIN_SIMILARITY: f64 = 0.3;

/// Broadcast ring size for the event bus.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Cadence of the timeout sweeper.
pub const DEFAULT_SWEEP_INTERVAL_MS: u64 = 1_000;

/// Maximum number of matches returned by a fix memory recall.
pub const DEFAULT_RECALL_LIMIT: usize = 5;

/// Timeout for a single remediation command.
pub const DEFAULT_REMEDIATION_TIMEOUT_SECS: u64 = 300;

/// Block reasons emitted by the executor.
pub mod reasons {
    pub const GATE_REJECTED: &str = "gate rejected";
    pub const GATE_TIMEOUT: &str = "gate timeout";
    pub const TIMEOUT: &str = "timeout";
    pub const CANCELLED: &str = "cancelled";
}
