use std::time::Duration;

/// Every tunable named in the spec's configuration table, with the
/// documented defaults. `from_env` mirrors the way `sync15-adapter`'s
/// examples pulled account config out of the environment: best-effort
/// parse, fall back to `Default::default()` on anything missing or
/// malformed.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub batch_size: usize,
    pub change_feed_limit: usize,
    pub change_feed_limit_max: usize,
    pub rate_limit_threshold: u32,
    pub rate_limit_base_backoff: Duration,
    pub rate_limit_max_backoff: Duration,
    pub mutation_retry_limit: u32,
    pub network_timeout: Duration,
    pub wait_for_completion_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            batch_size: 50,
            change_feed_limit: 100,
            change_feed_limit_max: 500,
            rate_limit_threshold: 3,
            rate_limit_base_backoff: Duration::from_secs(30),
            rate_limit_max_backoff: Duration::from_secs(300),
            mutation_retry_limit: 5,
            network_timeout: Duration::from_secs(15),
            wait_for_completion_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        SyncConfig {
            batch_size: env_usize("SYNC_BATCH_SIZE", defaults.batch_size),
            change_feed_limit: env_usize("SYNC_CHANGE_FEED_LIMIT", defaults.change_feed_limit),
            change_feed_limit_max: defaults.change_feed_limit_max,
            rate_limit_threshold: env_u32("SYNC_RATE_LIMIT_THRESHOLD", defaults.rate_limit_threshold),
            rate_limit_base_backoff: Duration::from_secs(env_u64(
                "SYNC_RATE_LIMIT_BASE_BACKOFF_S",
                defaults.rate_limit_base_backoff.as_secs(),
            )),
            rate_limit_max_backoff: Duration::from_secs(env_u64(
                "SYNC_RATE_LIMIT_MAX_BACKOFF_S",
                defaults.rate_limit_max_backoff.as_secs(),
            )),
            mutation_retry_limit: env_u32("SYNC_MUTATION_RETRY_LIMIT", defaults.mutation_retry_limit),
            network_timeout: Duration::from_secs(env_u64(
                "SYNC_NETWORK_TIMEOUT_S",
                defaults.network_timeout.as_secs(),
            )),
            wait_for_completion_timeout: Duration::from_secs(env_u64(
                "SYNC_WAIT_FOR_COMPLETION_TIMEOUT_S",
                defaults.wait_for_completion_timeout.as_secs(),
            )),
        }
    }
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
