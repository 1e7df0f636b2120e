// ─── Install Coordinator ───
// One install at a time: resolve the target version, provision the runtime
// and the diff tool, patch the tree, run fixups, then record the version.
// The marker is the commit point; nothing before it counts as installed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::error::{ErrorKind, LauncherError, LauncherResult};
use crate::core::fsutil::{is_executable, remove_dir_if_exists};
use crate::core::paths::LauncherPaths;
use crate::core::patch::PatchPipeline;
use crate::core::progress::{ProgressSink, Stage};
use crate::core::version::marker::clear_marker;
use crate::core::version::{read_marker, write_marker, VersionResolver};

use super::fixups::{default_fixups, FixupContext, PostInstallFixup};
use super::provision::Provision;

const LATEST_VARIANT: &str = "latest";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "version", rename_all = "camelCase")]
pub enum VersionPolicy {
    /// Exactly this version, in its own install tree.
    Pinned(u32),
    /// Newest remote version; resolution errors are fatal.
    Latest,
    /// Track the newest remote version, falling back to the installed one
    /// while offline.
    Auto,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallRequest {
    pub branch: String,
    pub policy: VersionPolicy,
}

impl InstallRequest {
    pub fn new(branch: impl Into<String>, policy: VersionPolicy) -> Self {
        Self {
            branch: branch.into(),
            policy,
        }
    }

    /// Install tree name under `shared/games/<branch>/`.
    pub fn variant(&self) -> String {
        match self.policy {
            VersionPolicy::Pinned(version) => version.to_string(),
            VersionPolicy::Latest | VersionPolicy::Auto => LATEST_VARIANT.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedVersion {
    pub branch: String,
    pub version: u32,
    pub variant: String,
    pub game_dir: PathBuf,
    pub client_binary: PathBuf,
    /// `false` when the tree was already at `version`.
    pub patched: bool,
}

/// Clears the in-progress flag on every exit path, unwinding included.
struct InstallGuard<'a> {
    flag: &'a Mutex<bool>,
}

impl<'a> InstallGuard<'a> {
    fn acquire(flag: &'a Mutex<bool>) -> LauncherResult<Self> {
        let mut busy = flag.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *busy {
            return Err(LauncherError::InstallInProgress);
        }
        *busy = true;
        Ok(Self { flag })
    }
}

impl Drop for InstallGuard<'_> {
    fn drop(&mut self) {
        let mut busy = self
            .flag
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *busy = false;
    }
}

pub struct InstallCoordinator {
    paths: LauncherPaths,
    resolver: Arc<VersionResolver>,
    runtime: Arc<dyn Provision>,
    tool: Arc<dyn Provision>,
    pipeline: Arc<PatchPipeline>,
    fixups: Vec<Arc<dyn PostInstallFixup>>,
    installing: Mutex<bool>,
}

impl InstallCoordinator {
    pub fn new(
        paths: LauncherPaths,
        resolver: Arc<VersionResolver>,
        runtime: Arc<dyn Provision>,
        tool: Arc<dyn Provision>,
        pipeline: Arc<PatchPipeline>,
    ) -> Self {
        Self {
            paths,
            resolver,
            runtime,
            tool,
            pipeline,
            fixups: default_fixups(),
            installing: Mutex::new(false),
        }
    }

    pub fn with_fixups(mut self, fixups: Vec<Arc<dyn PostInstallFixup>>) -> Self {
        self.fixups = fixups;
        self
    }

    /// Fixups in the order they run after patching.
    pub fn fixup_names(&self) -> Vec<&str> {
        self.fixups.iter().map(|fixup| fixup.name()).collect()
    }

    pub fn is_installing(&self) -> bool {
        *self
            .installing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn game_dir(&self, branch: &str, variant: &str) -> PathBuf {
        self.paths.game_dir(branch, variant)
    }

    /// Version recorded for the tree, if its marker is backed by a runnable
    /// client binary.
    pub fn verify_installed(&self, branch: &str, variant: &str) -> LauncherResult<Option<u32>> {
        let game_dir = self.game_dir(branch, variant);
        let Some(version) = read_marker(&game_dir)? else {
            return Ok(None);
        };
        let binary = LauncherPaths::client_binary(&game_dir);
        if is_executable(&binary) {
            Ok(Some(version))
        } else {
            debug!(
                "Marker {} in {:?} has no runnable client at {:?}",
                version, game_dir, binary
            );
            Ok(None)
        }
    }

    /// Bring the requested tree to its target version.
    ///
    /// A second call while one is running fails with
    /// [`LauncherError::InstallInProgress`] instead of waiting.
    #[instrument(skip(self, progress, cancel), fields(branch = %request.branch))]
    pub async fn ensure_installed(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<ResolvedVersion> {
        let _guard = InstallGuard::acquire(&self.installing)?;
        let branch = request.branch.as_str();
        if let VersionPolicy::Pinned(0) = request.policy {
            return Err(LauncherError::Validation(
                "version 0 means not installed and cannot be pinned".into(),
            ));
        }

        let variant = request.variant();
        let game_dir = self.game_dir(branch, &variant);
        let client_binary = LauncherPaths::client_binary(&game_dir);

        // ── Verify ──
        progress.report(Stage::Verify, 0.0, "Verifying installation...");
        let local = self.verify_installed(branch, &variant)?;
        progress.report(Stage::Verify, 100.0, "Verification done");

        // ── Version ──
        progress.report(Stage::Version, 0.0, "Resolving version...");
        let target = self.resolve_target(request, local, cancel).await?;
        progress.report(Stage::Version, 100.0, &format!("Target version {target}"));

        let resolved = |patched: bool| ResolvedVersion {
            branch: branch.to_string(),
            version: target,
            variant: variant.clone(),
            game_dir: game_dir.clone(),
            client_binary: client_binary.clone(),
            patched,
        };

        if local == Some(target)
            && self.runtime.is_ready(cancel).await
            && self.tool.is_ready(cancel).await
        {
            info!("{} {} already installed at {:?}", branch, target, game_dir);
            progress.report(Stage::Complete, 100.0, "Ready");
            return Ok(resolved(false));
        }

        // ── Runtime + tool ──
        tokio::try_join!(
            self.runtime.ensure(branch, progress, cancel),
            self.tool.ensure(branch, progress, cancel),
        )?;

        // ── Patch ──
        let from = self.prepare_tree(&game_dir, local, target).await?;
        self.pipeline
            .apply_chain(branch, from, target, &game_dir, progress, cancel)
            .await?;

        if !client_binary.is_file() {
            return Err(LauncherError::io(
                &client_binary,
                std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "installation incomplete: client binary missing after patching",
                ),
            ));
        }

        // ── Fixups ──
        let ctx = FixupContext {
            branch,
            version: target,
            game_dir: &game_dir,
            client_binary: &client_binary,
        };
        let count = self.fixups.len().max(1) as f64;
        for (index, fixup) in self.fixups.iter().enumerate() {
            progress.report(
                Stage::OnlineFix,
                index as f64 / count * 100.0,
                &format!("Applying {}...", fixup.name()),
            );
            fixup.apply(&ctx).await?;
        }
        progress.report(Stage::OnlineFix, 100.0, "Fixups applied");

        write_marker(&game_dir, target)?;
        info!("Installed {} version {} in {:?}", branch, target, game_dir);
        progress.report(Stage::Complete, 100.0, "Installation complete");
        Ok(resolved(true))
    }

    async fn resolve_target(
        &self,
        request: &InstallRequest,
        local: Option<u32>,
        cancel: &CancellationToken,
    ) -> LauncherResult<u32> {
        let branch = request.branch.as_str();
        match request.policy {
            VersionPolicy::Pinned(version) => {
                if local == Some(version) {
                    return Ok(version);
                }
                if self.resolver.version_exists(branch, version, cancel).await? {
                    Ok(version)
                } else {
                    Err(LauncherError::VersionNotFound {
                        branch: branch.to_string(),
                        version,
                    })
                }
            }
            VersionPolicy::Latest => self.resolver.find_latest(branch, cancel).await,
            VersionPolicy::Auto => match self.resolver.find_latest(branch, cancel).await {
                Ok(version) => Ok(version),
                Err(err) if err.kind() == ErrorKind::Network => match local {
                    Some(installed) => {
                        warn!(
                            "Cannot check for {} updates ({}); staying on {}",
                            branch, err, installed
                        );
                        Ok(installed)
                    }
                    None => Err(err),
                },
                Err(err) => Err(err),
            },
        }
    }

    /// Version to patch from. The marker is dropped first so an interrupted
    /// chain never looks installed; a tree ahead of the target restarts
    /// from scratch.
    async fn prepare_tree(
        &self,
        game_dir: &Path,
        local: Option<u32>,
        target: u32,
    ) -> LauncherResult<u32> {
        clear_marker(game_dir)?;
        match local {
            Some(installed) if installed <= target => Ok(installed),
            Some(installed) => {
                warn!(
                    "Installed version {} is ahead of target {}, reinstalling",
                    installed, target
                );
                remove_dir_if_exists(game_dir).await?;
                Ok(0)
            }
            None => Ok(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{EngineConfig, RetryPolicy};
    use crate::core::downloader::Downloader;
    use crate::core::patch::applier::tests::{FakeApplier, Outcome};
    use crate::core::patch::steps::tests::{step, StaticSource};
    use crate::core::patch::PatchStep;
    use crate::core::paths::Platform;
    use crate::core::progress::tests::RecordingSink;
    use crate::core::progress::NoopSink;
    use crate::core::test_support::serve;
    use crate::core::version::marker::marker_path;
    use crate::core::version::resolver::tests::{test_config, OracleProbe};
    use async_trait::async_trait;
    use axum::routing::get;
    use axum::Router;
    use reqwest::Client;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct FakeProvision {
        ready: AtomicBool,
        ensures: AtomicUsize,
        latency: Duration,
    }

    impl FakeProvision {
        fn new() -> Self {
            Self {
                ready: AtomicBool::new(false),
                ensures: AtomicUsize::new(0),
                latency: Duration::from_millis(20),
            }
        }

        fn ensures(&self) -> usize {
            self.ensures.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Provision for FakeProvision {
        fn name(&self) -> &'static str {
            "fake"
        }

        async fn is_ready(&self, _cancel: &CancellationToken) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        async fn ensure(
            &self,
            _branch: &str,
            _progress: &dyn ProgressSink,
            _cancel: &CancellationToken,
        ) -> LauncherResult<PathBuf> {
            tokio::time::sleep(self.latency).await;
            self.ensures.fetch_add(1, Ordering::SeqCst);
            self.ready.store(true, Ordering::SeqCst);
            Ok(PathBuf::from("/fake"))
        }
    }

    /// Records whether the marker already existed when it ran.
    struct MarkerSpy {
        saw_marker: Mutex<Option<bool>>,
    }

    #[async_trait]
    impl PostInstallFixup for MarkerSpy {
        fn name(&self) -> &str {
            "marker-spy"
        }

        async fn apply(&self, ctx: &FixupContext<'_>) -> LauncherResult<()> {
            *self.saw_marker.lock().unwrap() = Some(marker_path(ctx.game_dir).exists());
            Ok(())
        }
    }

    struct Harness {
        _temp: tempfile::TempDir,
        paths: LauncherPaths,
        probe: Arc<OracleProbe>,
        source: Arc<StaticSource>,
        applier: Arc<FakeApplier>,
        runtime: Arc<FakeProvision>,
        tool: Arc<FakeProvision>,
        coordinator: InstallCoordinator,
    }

    fn client_rel() -> PathBuf {
        LauncherPaths::client_binary(Path::new(""))
    }

    async fn harness_with(
        probe: OracleProbe,
        steps: impl FnOnce(&str) -> Vec<PatchStep>,
        applier: FakeApplier,
    ) -> Harness {
        let router = Router::new().route("/files/:name", get(|| async { "patch bytes" }));
        let base = serve(router).await;

        let temp = tempfile::tempdir().unwrap();
        let paths = LauncherPaths::new(temp.path());
        paths.ensure_layout().unwrap();

        let probe = Arc::new(probe);
        let resolver = Arc::new(VersionResolver::new(
            probe.clone(),
            Platform::new("linux", "amd64"),
            &test_config(),
        ));
        let source = Arc::new(StaticSource::new(steps(&base)));
        let applier = Arc::new(applier);
        let config = EngineConfig::default();
        let downloader = Downloader::new(Client::new(), &config).with_retry(RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        });
        let pipeline = Arc::new(PatchPipeline::new(
            source.clone(),
            applier.clone(),
            downloader,
            paths.clone(),
        ));
        let runtime = Arc::new(FakeProvision::new());
        let tool = Arc::new(FakeProvision::new());
        let coordinator = InstallCoordinator::new(
            paths.clone(),
            resolver,
            runtime.clone(),
            tool.clone(),
            pipeline,
        );

        Harness {
            _temp: temp,
            paths,
            probe,
            source,
            applier,
            runtime,
            tool,
            coordinator,
        }
    }

    async fn harness(latest: u32) -> Harness {
        harness_with(
            OracleProbe::new(latest),
            |base| vec![step(0, latest, base)],
            FakeApplier::new([]).creating([client_rel()]),
        )
        .await
    }

    fn install_existing(paths: &LauncherPaths, variant: &str, version: u32) {
        let game_dir = paths.game_dir("release", variant);
        let binary = LauncherPaths::client_binary(&game_dir);
        std::fs::create_dir_all(binary.parent().unwrap()).unwrap();
        std::fs::write(&binary, b"elf").unwrap();
        crate::core::fsutil::set_executable(&binary).unwrap();
        write_marker(&game_dir, version).unwrap();
    }

    #[tokio::test]
    async fn fresh_install_reaches_latest() {
        let h = harness(17).await;
        let sink = RecordingSink::default();
        let request = InstallRequest::new("release", VersionPolicy::Latest);

        let resolved = h
            .coordinator
            .ensure_installed(&request, &sink, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(resolved.version, 17);
        assert!(resolved.patched);
        assert_eq!(resolved.variant, "latest");
        let game_dir = h.paths.game_dir("release", "latest");
        assert_eq!(std::fs::read_to_string(marker_path(&game_dir)).unwrap(), "17");
        assert_eq!(h.applier.calls().len(), 1);
        assert_eq!(h.runtime.ensures(), 1);
        assert_eq!(h.tool.ensures(), 1);

        let stages = sink.stages();
        assert_eq!(stages.first(), Some(&Stage::Verify));
        assert!(stages.contains(&Stage::Version));
        assert!(stages.contains(&Stage::Patch));
        assert_eq!(stages.last(), Some(&Stage::Complete));
        assert!(!h.coordinator.is_installing());
    }

    #[tokio::test]
    async fn second_install_takes_fast_path() {
        let h = harness(17).await;
        let request = InstallRequest::new("release", VersionPolicy::Latest);
        let cancel = CancellationToken::new();

        h.coordinator
            .ensure_installed(&request, &NoopSink, &cancel)
            .await
            .unwrap();
        let again = h
            .coordinator
            .ensure_installed(&request, &NoopSink, &cancel)
            .await
            .unwrap();

        assert_eq!(again.version, 17);
        assert!(!again.patched);
        assert_eq!(h.applier.calls().len(), 1);
        assert_eq!(h.source.calls(), 1);
        assert_eq!(h.runtime.ensures(), 1);
    }

    #[tokio::test]
    async fn concurrent_installs_are_rejected_not_queued() {
        let h = harness(17).await;
        let request = InstallRequest::new("release", VersionPolicy::Latest);
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            h.coordinator.ensure_installed(&request, &NoopSink, &cancel),
            h.coordinator.ensure_installed(&request, &NoopSink, &cancel),
        );

        let outcomes = [first, second];
        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        assert_eq!(
            outcomes
                .iter()
                .filter(|r| matches!(r, Err(LauncherError::InstallInProgress)))
                .count(),
            1
        );
        assert_eq!(h.applier.calls().len(), 1);
        assert!(!h.coordinator.is_installing());
    }

    #[tokio::test]
    async fn incremental_update_patches_from_marker() {
        let h = harness_with(
            OracleProbe::new(17),
            |base| vec![step(0, 10, base), step(10, 17, base)],
            FakeApplier::new([]),
        )
        .await;
        install_existing(&h.paths, "latest", 10);

        let resolved = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Auto),
                &NoopSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resolved.version, 17);
        assert_eq!(*h.source.requested_from.lock().unwrap(), vec![10]);
        let calls = h.applier.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].patch_file.ends_with("10_to_17.pwr"));
    }

    #[tokio::test]
    async fn pinned_versions_get_their_own_tree() {
        let h = harness_with(
            OracleProbe::new(17),
            |base| vec![step(0, 12, base), step(12, 17, base)],
            FakeApplier::new([]).creating([client_rel()]),
        )
        .await;

        let resolved = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Pinned(12)),
                &NoopSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(resolved.variant, "12");
        assert_eq!(
            h.coordinator.verify_installed("release", "12").unwrap(),
            Some(12)
        );
        assert_eq!(h.coordinator.verify_installed("release", "latest").unwrap(), None);
    }

    #[tokio::test]
    async fn unknown_or_zero_pins_are_rejected() {
        let h = harness(17).await;
        let cancel = CancellationToken::new();

        let err = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Pinned(40)),
                &NoopSink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::VersionNotFound { version: 40, .. }));

        let err = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Pinned(0)),
                &NoopSink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(!h.coordinator.is_installing());
        assert!(h.applier.calls().is_empty());
    }

    #[tokio::test]
    async fn missing_client_binary_is_not_installed() {
        let h = harness_with(
            OracleProbe::new(17),
            |base| vec![step(0, 17, base)],
            FakeApplier::new([Outcome::Success]),
        )
        .await;

        let err = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Latest),
                &NoopSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().contains("installation incomplete"));
        assert!(!marker_path(&h.paths.game_dir("release", "latest")).exists());
    }

    #[tokio::test]
    async fn marker_without_binary_is_not_installed() {
        let h = harness(17).await;
        let game_dir = h.paths.game_dir("release", "latest");
        write_marker(&game_dir, 17).unwrap();
        assert_eq!(h.coordinator.verify_installed("release", "latest").unwrap(), None);
    }

    #[tokio::test]
    async fn auto_stays_on_installed_version_offline() {
        let h = harness_with(
            OracleProbe {
                unreachable: true,
                ..OracleProbe::new(17)
            },
            |base| vec![step(0, 17, base)],
            FakeApplier::new([]),
        )
        .await;
        install_existing(&h.paths, "latest", 15);
        h.runtime.ready.store(true, Ordering::SeqCst);
        h.tool.ready.store(true, Ordering::SeqCst);
        let cancel = CancellationToken::new();

        let resolved = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Auto),
                &NoopSink,
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(resolved.version, 15);
        assert!(!resolved.patched);

        let err = h
            .coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Latest),
                &NoopSink,
                &cancel,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LauncherError::ServerUnreachable { .. }));
        assert!(h.probe.calls() > 0);
    }

    #[tokio::test]
    async fn fixups_run_before_marker_is_written() {
        let spy = Arc::new(MarkerSpy {
            saw_marker: Mutex::new(None),
        });
        let mut h = harness(17).await;
        h.coordinator = h.coordinator.with_fixups(vec![spy.clone()]);

        h.coordinator
            .ensure_installed(
                &InstallRequest::new("release", VersionPolicy::Latest),
                &NoopSink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(*spy.saw_marker.lock().unwrap(), Some(false));
    }

    #[test]
    fn request_serializes_for_ipc() {
        let request = InstallRequest::new("pre-release", VersionPolicy::Pinned(3));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["policy"]["kind"], "pinned");
        assert_eq!(json["policy"]["version"], 3);
        assert_eq!(request.variant(), "3");
    }
}
