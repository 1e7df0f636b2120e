// ─── Version Resolver ───
// Finds the newest published version of a branch without a listing API:
// probe a ladder of checkpoints for a base, grow an exponential upper bound,
// then binary search between the two.
//
// Assumes existence is monotonic inside one run: once N is absent nothing
// above N is expected to exist.
//
// Every uncached probe is followed by `probe_delay`. Listing runs probes in
// parallel, so each slot waits `probe_delay * listing_concurrency` and the
// origin sees the same request rate as a sequential search.

use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use reqwest::Client;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::config::EngineConfig;
use crate::core::error::{LauncherError, LauncherResult};
use crate::core::paths::Platform;

use super::cache::TtlCache;
use super::coalesce::Coalescer;
use super::probe::{DiscoveryError, HttpVersionProbe, VersionProbe};

type Discovery<T> = Result<T, DiscoveryError>;

pub struct VersionResolver {
    probe: Arc<dyn VersionProbe>,
    platform: Platform,
    checkpoints: Vec<u32>,
    probe_delay: Duration,
    max_step: u32,
    listing_concurrency: usize,

    latest: TtlCache<u32>,
    listings: TtlCache<Vec<u32>>,
    existence: TtlCache<bool>,
    latest_flights: Coalescer<Discovery<u32>>,
    listing_flights: Coalescer<Discovery<Vec<u32>>>,
}

impl VersionResolver {
    pub fn new(probe: Arc<dyn VersionProbe>, platform: Platform, config: &EngineConfig) -> Self {
        let ttl = config.version_cache_ttl();
        let mut checkpoints = config.probe_checkpoints.clone();
        checkpoints.retain(|v| *v > 0);
        Self {
            probe,
            platform,
            checkpoints,
            probe_delay: config.probe_delay(),
            max_step: config.max_probe_step.max(1),
            listing_concurrency: config.listing_concurrency.max(1),
            latest: TtlCache::new(ttl),
            listings: TtlCache::new(ttl),
            existence: TtlCache::new(ttl),
            latest_flights: Coalescer::new(),
            listing_flights: Coalescer::new(),
        }
    }

    /// Resolver probing the configured patch origin over HTTP.
    pub fn http(client: Client, platform: Platform, config: &EngineConfig) -> Self {
        let probe = HttpVersionProbe::new(client, config.patch_origin.clone(), platform.clone());
        Self::new(Arc::new(probe), platform, config)
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    // ── Public operations ───────────────────────────────

    /// Highest published version of `branch`. Cached for the TTL; concurrent
    /// callers share one probe run.
    #[instrument(skip(self, cancel))]
    pub async fn find_latest(&self, branch: &str, cancel: &CancellationToken) -> LauncherResult<u32> {
        validate_branch(branch)?;
        let key = self.cache_key(branch);
        if let Some(version) = self.latest.get(&key) {
            debug!("latest {} = {} (cached)", key, version);
            return Ok(version);
        }

        let this = self;
        let flight_key = key.as_str();
        let flight = self.latest_flights.run(flight_key, move || async move {
            // A flight that landed just before we joined may have filled it.
            if let Some(version) = this.latest.get(flight_key) {
                return Ok(version);
            }
            let version = this.discover_latest(branch).await?;
            this.latest.insert(flight_key, version);
            info!("Latest {} version on {}: {}", branch, this.platform, version);
            Ok(version)
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            result = flight => result.map_err(LauncherError::from),
        }
    }

    /// Every published version in the discovered range, ascending.
    ///
    /// One request per version: only for explicit user requests.
    #[instrument(skip(self, cancel))]
    pub async fn list_available_versions(
        &self,
        branch: &str,
        cancel: &CancellationToken,
    ) -> LauncherResult<Vec<u32>> {
        validate_branch(branch)?;
        let key = self.cache_key(branch);
        if let Some(versions) = self.listings.get(&key) {
            return Ok(versions);
        }

        let this = self;
        let flight_key = key.as_str();
        let flight = self.listing_flights.run(flight_key, move || async move {
            if let Some(versions) = this.listings.get(flight_key) {
                return Ok(versions);
            }
            let versions = this.discover_all(branch).await?;
            this.listings.insert(flight_key, versions.clone());
            Ok(versions)
        });

        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            result = flight => result.map_err(LauncherError::from),
        }
    }

    /// Listings for several branches at once. Each branch keeps its own
    /// outcome so one unreachable channel does not hide the others.
    pub async fn list_available_versions_all(
        &self,
        branches: &[&str],
        cancel: &CancellationToken,
    ) -> Vec<(String, LauncherResult<Vec<u32>>)> {
        let listings = branches
            .iter()
            .map(|branch| async move {
                let result = self.list_available_versions(branch, cancel).await;
                (branch.to_string(), result)
            });
        futures_util::future::join_all(listings).await
    }

    pub async fn version_exists(
        &self,
        branch: &str,
        version: u32,
        cancel: &CancellationToken,
    ) -> LauncherResult<bool> {
        validate_branch(branch)?;
        if version == 0 {
            return Ok(false);
        }
        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            result = self.exists(branch, version) => result.map_err(LauncherError::from),
        }
    }

    pub fn clear_cache(&self) {
        self.latest.clear();
        self.listings.clear();
        self.existence.clear();
        debug!("version caches cleared");
    }

    // ── Search ──────────────────────────────────────────

    async fn discover_latest(&self, branch: &str) -> Discovery<u32> {
        let base = self.find_base(branch).await?;
        let upper = self.upper_bound(branch, base).await?;
        self.binary_search(branch, base, upper).await
    }

    async fn discover_all(&self, branch: &str) -> Discovery<Vec<u32>> {
        let base = self.find_base(branch).await?;
        let upper = self.upper_bound(branch, base).await?;
        debug!("listing {} versions {}..={}", branch, base, upper);

        let pace = self
            .probe_delay
            .saturating_mul(u32::try_from(self.listing_concurrency).unwrap_or(u32::MAX));
        let probed: Vec<(u32, Discovery<bool>)> = stream::iter(base..=upper)
            .map(|version| async move {
                (version, self.exists_paced(branch, version, pace).await)
            })
            .buffered(self.listing_concurrency)
            .collect()
            .await;

        let mut versions = Vec::new();
        for (version, exists) in probed {
            if exists? {
                versions.push(version);
            }
        }
        Ok(versions)
    }

    /// First checkpoint that exists.
    async fn find_base(&self, branch: &str) -> Discovery<u32> {
        let mut unreachable = None;
        for &checkpoint in &self.checkpoints {
            match self.exists(branch, checkpoint).await {
                Ok(true) => {
                    debug!("base checkpoint for {}: {}", branch, checkpoint);
                    return Ok(checkpoint);
                }
                Ok(false) => {}
                Err(err) => unreachable = Some(err),
            }
        }
        Err(unreachable.unwrap_or_else(|| DiscoveryError::NoVersionsPublished {
            branch: branch.to_string(),
            platform: self.platform.to_string(),
        }))
    }

    /// A version known to be absent, or where the step ceiling stopped us.
    async fn upper_bound(&self, branch: &str, base: u32) -> Discovery<u32> {
        let mut current = base;
        let mut step = base.max(10);
        loop {
            let next = current.saturating_add(step);
            if !self.exists(branch, next).await? {
                return Ok(next);
            }
            current = next;
            step = step.saturating_mul(2);
            if step > self.max_step {
                return Ok(current.saturating_add(step));
            }
        }
    }

    /// Highest existing version in `[low, high]`; `low` is known to exist.
    async fn binary_search(&self, branch: &str, mut low: u32, mut high: u32) -> Discovery<u32> {
        while low < high {
            let mid = low + (high - low + 1) / 2;
            if self.exists(branch, mid).await? {
                low = mid;
            } else {
                high = mid - 1;
            }
        }
        Ok(low)
    }

    async fn exists(&self, branch: &str, version: u32) -> Discovery<bool> {
        self.exists_paced(branch, version, self.probe_delay).await
    }

    /// Cached existence probe. Presence never expires; absence lives for
    /// the TTL; failures are not cached at all. `pace` follows every probe
    /// that reached the origin.
    async fn exists_paced(&self, branch: &str, version: u32, pace: Duration) -> Discovery<bool> {
        let key = format!("{}-{}", self.cache_key(branch), version);
        if let Some(exists) = self.existence.get(&key) {
            return Ok(exists);
        }

        let result = self.probe.exists(branch, version).await;
        if !pace.is_zero() {
            tokio::time::sleep(pace).await;
        }
        let exists = result?;
        if exists {
            self.existence.insert_permanent(key, true);
        } else {
            self.existence.insert(key, false);
        }
        Ok(exists)
    }

    fn cache_key(&self, branch: &str) -> String {
        format!("{}-{}-{}", self.platform.os, self.platform.arch, branch)
    }
}

fn validate_branch(branch: &str) -> LauncherResult<()> {
    let valid = !branch.is_empty()
        && branch
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid && branch != "." && branch != ".." {
        Ok(())
    } else {
        Err(LauncherError::Validation(format!("invalid branch name: {branch:?}")))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Answers "exists iff 1 <= v <= latest", counting every call.
    pub(crate) struct OracleProbe {
        pub latest: u32,
        pub unreachable: bool,
        pub latency: Duration,
        pub calls: AtomicUsize,
    }

    impl OracleProbe {
        pub fn new(latest: u32) -> Self {
            Self {
                latest,
                unreachable: false,
                latency: Duration::ZERO,
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl VersionProbe for OracleProbe {
        async fn exists(&self, branch: &str, version: u32) -> Result<bool, DiscoveryError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }
            if self.unreachable {
                return Err(DiscoveryError::Unreachable {
                    branch: branch.to_string(),
                    platform: "linux/amd64".to_string(),
                    detail: "connection refused".to_string(),
                });
            }
            Ok(version >= 1 && version <= self.latest)
        }
    }

    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            probe_delay_ms: 0,
            ..EngineConfig::default()
        }
    }

    fn resolver(probe: Arc<OracleProbe>) -> VersionResolver {
        VersionResolver::new(probe, Platform::new("linux", "amd64"), &test_config())
    }

    #[tokio::test]
    async fn finds_exact_latest_for_any_k_in_range() {
        for k in [1, 2, 9, 10, 11, 17, 31, 100, 640, 1000, 1271, 2000, 2550] {
            let probe = Arc::new(OracleProbe::new(k));
            let found = resolver(probe)
                .find_latest("release", &CancellationToken::new())
                .await
                .unwrap();
            assert_eq!(found, k, "oracle latest = {k}");
        }
    }

    #[tokio::test]
    async fn no_checkpoint_is_an_error_not_zero() {
        let probe = Arc::new(OracleProbe::new(0));
        let err = resolver(probe.clone())
            .find_latest("release", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::NoVersionsPublished { .. }));
        assert_eq!(probe.calls(), 4);
    }

    #[tokio::test]
    async fn unreachable_origin_is_distinguished() {
        let probe = Arc::new(OracleProbe {
            unreachable: true,
            ..OracleProbe::new(17)
        });
        let resolver = resolver(probe.clone());
        let err = resolver
            .find_latest("release", &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::ServerUnreachable { .. }));
        assert_eq!(err.kind(), crate::core::error::ErrorKind::Network);

        // Failures are not cached: the next call probes again.
        let before = probe.calls();
        let _ = resolver
            .find_latest("release", &CancellationToken::new())
            .await;
        assert!(probe.calls() > before);
    }

    #[tokio::test]
    async fn latest_is_cached_per_branch() {
        let probe = Arc::new(OracleProbe::new(17));
        let resolver = resolver(probe.clone());
        let cancel = CancellationToken::new();

        assert_eq!(resolver.find_latest("release", &cancel).await.unwrap(), 17);
        let after_first = probe.calls();
        assert_eq!(resolver.find_latest("release", &cancel).await.unwrap(), 17);
        assert_eq!(probe.calls(), after_first);

        resolver.clear_cache();
        assert_eq!(resolver.find_latest("release", &cancel).await.unwrap(), 17);
        assert_eq!(probe.calls(), after_first * 2);
    }

    #[tokio::test]
    async fn ttl_expiry_triggers_new_discovery() {
        let probe = Arc::new(OracleProbe::new(17));
        let config = EngineConfig {
            version_cache_ttl_secs: 0,
            ..test_config()
        };
        let resolver =
            VersionResolver::new(probe.clone(), Platform::new("linux", "amd64"), &config);
        let cancel = CancellationToken::new();

        resolver.find_latest("release", &cancel).await.unwrap();
        let after_first = probe.calls();
        resolver.find_latest("release", &cancel).await.unwrap();
        // Positive probes are permanent, absent ones and the result expire.
        assert!(probe.calls() > after_first);
        assert!(probe.calls() < after_first * 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_probe_run() {
        let single = Arc::new(OracleProbe::new(17));
        resolver(single.clone())
            .find_latest("release", &CancellationToken::new())
            .await
            .unwrap();
        let one_run = single.calls();

        let probe = Arc::new(OracleProbe {
            latency: Duration::from_millis(5),
            ..OracleProbe::new(17)
        });
        let resolver = resolver(probe.clone());
        let cancel = CancellationToken::new();
        let results = futures_util::future::join_all(
            (0..8).map(|_| resolver.find_latest("release", &cancel)),
        )
        .await;

        assert!(results.iter().all(|r| matches!(r, Ok(17))));
        assert_eq!(probe.calls(), one_run);
    }

    #[tokio::test]
    async fn cancellation_returns_promptly() {
        let probe = Arc::new(OracleProbe {
            latency: Duration::from_secs(30),
            ..OracleProbe::new(17)
        });
        let resolver = resolver(probe);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = resolver.find_latest("release", &cancel).await.unwrap_err();
        assert!(matches!(err, LauncherError::Cancelled));
    }

    #[tokio::test]
    async fn listing_returns_every_existing_version() {
        let probe = Arc::new(OracleProbe::new(17));
        let resolver = resolver(probe);
        let versions = resolver
            .list_available_versions("release", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(versions, (1..=17).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn parallel_listing_keeps_sequential_request_rate() {
        let delay = Duration::from_millis(20);
        let probe = Arc::new(OracleProbe::new(5));
        let config = EngineConfig {
            probe_delay_ms: 20,
            listing_concurrency: 4,
            ..test_config()
        };
        let resolver =
            VersionResolver::new(probe.clone(), Platform::new("linux", "amd64"), &config);

        let started = std::time::Instant::now();
        let versions = resolver
            .list_available_versions("release", &CancellationToken::new())
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert_eq!(versions, vec![1, 2, 3, 4, 5]);
        // No faster than one probe per delay, as if run one at a time.
        let calls = u32::try_from(probe.calls()).unwrap();
        assert!(elapsed >= delay * calls, "{calls} probes in {elapsed:?}");
    }

    #[tokio::test]
    async fn listing_several_branches_keeps_each_outcome() {
        let probe = Arc::new(OracleProbe::new(3));
        let resolver = resolver(probe);
        let listings = resolver
            .list_available_versions_all(&["release", "bad/branch"], &CancellationToken::new())
            .await;
        assert_eq!(listings[0].0, "release");
        assert_eq!(listings[0].1.as_ref().unwrap(), &vec![1, 2, 3]);
        assert!(matches!(listings[1].1, Err(LauncherError::Validation(_))));
    }

    #[tokio::test]
    async fn pinned_versions_are_checked_individually() {
        let probe = Arc::new(OracleProbe::new(17));
        let resolver = resolver(probe);
        let cancel = CancellationToken::new();
        assert!(resolver.version_exists("release", 12, &cancel).await.unwrap());
        assert!(!resolver.version_exists("release", 18, &cancel).await.unwrap());
        assert!(!resolver.version_exists("release", 0, &cancel).await.unwrap());
    }

    #[test]
    fn branch_names_are_validated() {
        assert!(validate_branch("pre-release").is_ok());
        assert!(validate_branch("").is_err());
        assert!(validate_branch("../etc").is_err());
        assert!(validate_branch("..").is_err());
    }
}
