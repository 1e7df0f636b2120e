// ─── Engine Configuration ───
// Every tunable the engine uses, with defaults matching the live service.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const ENV_PREFIX: &str = "PATCHLINE_";

/// Retry schedule for a single download.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 3_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt number `attempt` (1-based). The first attempt never waits.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let shift = (attempt - 2).min(16);
        let delay = self.base_delay_ms.saturating_mul(1_u64 << shift);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root for caches, runtimes, tools and game trees. `None` uses the
    /// platform data directory.
    pub data_dir: Option<PathBuf>,

    // ── Endpoints ───────────────────────────────────────
    pub patch_origin: String,
    pub patch_steps_url: String,
    pub runtime_manifest_url: String,
    pub tool_base_url: String,

    // ── Version discovery ───────────────────────────────
    pub probe_checkpoints: Vec<u32>,
    pub probe_delay_ms: u64,
    pub max_probe_step: u32,
    pub version_cache_ttl_secs: u64,
    pub listing_concurrency: usize,

    // ── Transfers ───────────────────────────────────────
    pub download_retry: RetryPolicy,
    pub progress_interval_ms: u64,
    pub connect_timeout_secs: u64,
    /// Longest silence tolerated mid-response before the read fails as a
    /// transient timeout.
    pub read_timeout_secs: u64,
    pub probe_timeout_secs: u64,
    pub api_timeout_secs: u64,

    // ── Runtime install ─────────────────────────────────
    pub rename_attempts: u32,
    pub rename_delay_ms: u64,
    pub min_free_disk_bytes: u64,

    // ── Post-install ────────────────────────────────────
    /// Swap in the community online-fix client and server on Windows.
    pub enable_online_fix: bool,
    pub online_fix_release_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            patch_origin: "https://game-patches.hytale.com".to_string(),
            patch_steps_url: "https://api.hylauncher.fun/v1/pwr".to_string(),
            runtime_manifest_url: "https://launcher.hytale.com/version/release/jre.json"
                .to_string(),
            tool_base_url: "https://broth.itch.zone/butler".to_string(),
            probe_checkpoints: vec![1, 5, 10, 25],
            probe_delay_ms: 100,
            max_probe_step: 1_000,
            version_cache_ttl_secs: 5 * 60,
            listing_concurrency: 4,
            download_retry: RetryPolicy::default(),
            progress_interval_ms: 200,
            connect_timeout_secs: 60,
            read_timeout_secs: 30,
            probe_timeout_secs: 10,
            api_timeout_secs: 30,
            rename_attempts: 5,
            rename_delay_ms: 2_000,
            min_free_disk_bytes: 512 * 1024 * 1024,
            enable_online_fix: false,
            online_fix_release_url:
                "https://api.github.com/repos/ArchDevs/HyLauncher/releases/latest".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `PATCHLINE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let var = |name: &str| {
            lookup(&format!("{ENV_PREFIX}{name}"))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(dir) = var("DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(url) = var("PATCH_ORIGIN") {
            config.patch_origin = url.trim_end_matches('/').to_string();
        }
        if let Some(url) = var("PATCH_STEPS_URL") {
            config.patch_steps_url = url;
        }
        if let Some(url) = var("RUNTIME_MANIFEST_URL") {
            config.runtime_manifest_url = url;
        }
        if let Some(url) = var("TOOL_BASE_URL") {
            config.tool_base_url = url.trim_end_matches('/').to_string();
        }
        if let Some(ms) = var("PROBE_DELAY_MS").and_then(|v| v.parse().ok()) {
            config.probe_delay_ms = ms;
        }
        if let Some(secs) = var("READ_TIMEOUT_SECS").and_then(|v| v.parse::<u64>().ok()) {
            config.read_timeout_secs = secs.max(1);
        }
        if let Some(attempts) = var("DOWNLOAD_ATTEMPTS").and_then(|v| v.parse::<u32>().ok()) {
            config.download_retry.max_attempts = attempts.clamp(1, 10);
        }
        if let Some(flag) = var("ONLINE_FIX") {
            config.enable_online_fix = matches!(flag.as_str(), "1" | "true" | "yes" | "on");
        }
        config
    }

    pub fn probe_delay(&self) -> Duration {
        Duration::from_millis(self.probe_delay_ms)
    }

    pub fn version_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.version_cache_ttl_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs.max(1))
    }

    pub fn rename_delay(&self) -> Duration {
        Duration::from_millis(self.rename_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(3));
        assert_eq!(policy.delay_for(3), Duration::from_secs(6));
        assert_eq!(policy.delay_for(4), Duration::from_secs(12));
        assert_eq!(policy.delay_for(9), Duration::from_secs(60));
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("PATCHLINE_PATCH_ORIGIN", "http://127.0.0.1:9000/"),
            ("PATCHLINE_DOWNLOAD_ATTEMPTS", "99"),
            ("PATCHLINE_PROBE_DELAY_MS", " 0 "),
            ("PATCHLINE_READ_TIMEOUT_SECS", "0"),
            ("PATCHLINE_ONLINE_FIX", "true"),
        ]
        .into_iter()
        .collect();
        let config = EngineConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.patch_origin, "http://127.0.0.1:9000");
        assert_eq!(config.download_retry.max_attempts, 10);
        assert_eq!(config.probe_delay_ms, 0);
        assert_eq!(config.read_timeout_secs, 1);
        assert!(config.enable_online_fix);
        assert_eq!(config.probe_checkpoints, vec![1, 5, 10, 25]);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: EngineConfig = serde_json::from_str(r#"{"probe_delay_ms": 150}"#).unwrap();
        assert_eq!(config.probe_delay_ms, 150);
        assert_eq!(config.version_cache_ttl_secs, 300);
        assert!(!config.enable_online_fix);
    }
}
