//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// HTTP server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:4444").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
    /// Maximum accepted size of a planning request body in bytes.
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_bind() -> String {
    "0.0.0.0:4444".to_string()
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_max_request_bytes() -> usize {
    8 * 1024 * 1024
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            metrics_enabled: default_metrics_enabled(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

/// Upstream mirror configuration.
///
/// The mirror root is the directory served to clients and the base every
/// requested relative path is resolved against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MirrorConfig {
    /// Local directory holding the synced patch set.
    #[serde(default = "default_mirror_root")]
    pub root: PathBuf,
    /// Git URL of the upstream repository. When unset, the root is served as-is
    /// and resync requests are no-ops.
    #[serde(default)]
    pub repo_url: Option<String>,
    /// Shared key expected in the `key` query parameter of the update webhook.
    /// When unset or empty, the webhook rejects every request.
    #[serde(default)]
    pub webhook_key: Option<String>,
    /// Sync once before accepting requests (default: true).
    #[serde(default = "default_sync_on_startup")]
    pub sync_on_startup: bool,
    /// Delay between a webhook call and the resync it triggers (default: 5).
    #[serde(default = "default_resync_delay_secs")]
    pub resync_delay_secs: u64,
}

fn default_mirror_root() -> PathBuf {
    PathBuf::from("eqemupatcher")
}

fn default_sync_on_startup() -> bool {
    true
}

fn default_resync_delay_secs() -> u64 {
    5
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            root: default_mirror_root(),
            repo_url: None,
            webhook_key: None,
            sync_on_startup: default_sync_on_startup(),
            resync_delay_secs: default_resync_delay_secs(),
        }
    }
}

impl MirrorConfig {
    /// Get the resync debounce delay as a Duration.
    pub fn resync_delay(&self) -> Duration {
        Duration::from_secs(self.resync_delay_secs)
    }

    /// The webhook key, if one is set. An empty key counts as unset.
    pub fn effective_webhook_key(&self) -> Option<&str> {
        self.webhook_key.as_deref().filter(|key| !key.is_empty())
    }
}

/// Zip chunk planning and scratch archive lifecycle configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChunkConfig {
    /// Budget applied when a request omits `max_chunk_size` or sends a non-positive value.
    #[serde(default = "default_max_chunk_size")]
    pub default_max_chunk_size: u64,
    /// Directory holding scratch archives.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,
    /// Seconds after a download completes before its archive and handle are reclaimed.
    #[serde(default = "default_reclaim_delay_secs")]
    pub reclaim_delay_secs: u64,
    /// Maximum age in seconds of a handle or scratch archive before the janitor removes it.
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    /// Interval in seconds between janitor sweeps.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_max_chunk_size() -> u64 {
    crate::DEFAULT_MAX_CHUNK_SIZE
}

fn default_scratch_dir() -> PathBuf {
    std::env::temp_dir().join("patcher")
}

fn default_reclaim_delay_secs() -> u64 {
    180 // 3 minutes
}

fn default_max_age_secs() -> u64 {
    60
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            default_max_chunk_size: default_max_chunk_size(),
            scratch_dir: default_scratch_dir(),
            reclaim_delay_secs: default_reclaim_delay_secs(),
            max_age_secs: default_max_age_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl ChunkConfig {
    /// Get the post-download reclaim delay as a Duration.
    pub fn reclaim_delay(&self) -> Duration {
        Duration::from_secs(self.reclaim_delay_secs)
    }

    /// Get the janitor max age as a Duration.
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Get the janitor sweep interval as a Duration.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    /// Validate chunk configuration.
    /// Returns an error for configs that would cause runtime issues.
    pub fn validate(&self) -> Result<(), String> {
        if self.default_max_chunk_size == 0 {
            return Err("chunks.default_max_chunk_size cannot be 0".to_string());
        }

        // tokio::time::interval panics on a zero period
        if self.sweep_interval_secs == 0 {
            return Err("chunks.sweep_interval_secs cannot be 0. \
                 Use a value >= 1 second."
                .to_string());
        }

        Ok(())
    }
}

/// Rate limiting configuration for the planning endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Enable rate limiting (default: true).
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Sustained planning requests per minute per client IP.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Bucket capacity: requests a fresh client may issue back to back.
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Trusted proxy IP addresses/CIDR ranges.
    /// Only requests from these IPs will have X-Forwarded-For/X-Real-IP headers trusted.
    /// If empty, forwarded headers are never trusted (only direct connection IP is used).
    /// Use ["*"] to trust all proxies (NOT recommended for production).
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    /// Maximum number of unique client IPs to track before rejecting new ones (default: 100000).
    /// When the limit is reached, new IPs are rejected with 429 until cleanup runs.
    #[serde(default = "default_max_entries")]
    pub max_entries: u32,
    /// Interval in seconds between cleanup sweeps of stale entries (default: 60).
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// Time-to-live in seconds for idle client entries (default: 300).
    /// Should be at least 2x the refill window so eviction cannot reset a depleted bucket early.
    #[serde(default = "default_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_requests_per_minute() -> u32 {
    10
}

fn default_burst_size() -> u32 {
    10
}

fn default_max_entries() -> u32 {
    100_000
}

fn default_cleanup_interval_secs() -> u64 {
    60
}

fn default_entry_ttl_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            requests_per_minute: default_requests_per_minute(),
            burst_size: default_burst_size(),
            trusted_proxies: Vec::new(),
            max_entries: default_max_entries(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            entry_ttl_secs: default_entry_ttl_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Get the cleanup interval as a Duration.
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    /// Validate rate limit configuration for dangerous settings.
    /// Returns warnings for configs that are insecure but allowed,
    /// and errors for configs that are unsafe and should be rejected.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !self.enabled {
            return Ok(warnings);
        }

        if self.cleanup_interval_secs == 0 {
            return Err("rate_limit.cleanup_interval_secs cannot be 0. \
                 This would cause a panic when creating the cleanup timer. \
                 Use a value >= 1 second."
                .to_string());
        }

        if self.requests_per_minute == 0 || self.burst_size == 0 {
            return Err(
                "rate_limit.requests_per_minute and rate_limit.burst_size must be >= 1".to_string(),
            );
        }

        if self.trusted_proxies.len() == 1 && self.trusted_proxies[0] == "*" {
            warnings.push(
                "rate_limit.trusted_proxies=['*'] trusts ALL forwarded headers. \
                 This allows clients to spoof their IP address and bypass rate limits. \
                 Only use this setting in development or behind a trusted reverse proxy."
                    .to_string(),
            );
        }

        if self.entry_ttl_secs < 120 {
            warnings.push(format!(
                "rate_limit.entry_ttl_secs={} is very short. \
                 Entries may be evicted before their bucket refills, \
                 allowing clients to bypass limits by waiting. \
                 Recommended minimum: 120 seconds.",
                self.entry_ttl_secs
            ));
        }

        Ok(warnings)
    }
}

/// Complete application configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Server configuration.
    #[serde(default)]
    pub server: ServerConfig,
    /// Upstream mirror configuration.
    #[serde(default)]
    pub mirror: MirrorConfig,
    /// Chunk planning and scratch archive configuration.
    #[serde(default)]
    pub chunks: ChunkConfig,
    /// Rate limiting configuration.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

impl AppConfig {
    /// Create a test configuration rooted at the given directories.
    ///
    /// **For testing only.** Disables startup sync and uses the default lifetimes.
    pub fn for_testing(root: impl Into<PathBuf>, scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            server: ServerConfig::default(),
            mirror: MirrorConfig {
                root: root.into(),
                sync_on_startup: false,
                ..Default::default()
            },
            chunks: ChunkConfig {
                scratch_dir: scratch_dir.into(),
                ..Default::default()
            },
            rate_limit: RateLimitConfig::default(),
        }
    }

    /// Validate every section, returning non-fatal warnings on success.
    pub fn validate(&self) -> crate::Result<Vec<String>> {
        self.chunks.validate().map_err(crate::Error::InvalidConfig)?;
        self.rate_limit
            .validate()
            .map_err(crate::Error::InvalidConfig)
    }
}
