use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::core::config::EngineConfig;
use crate::core::downloader::Downloader;
use crate::core::error::LauncherResult;
use crate::core::http::{build_http_client, build_probe_client};
use crate::core::install::{
    default_fixups, InstallCoordinator, InstallRequest, OnlineFixFixup, ResolvedVersion,
};
use crate::core::java::RuntimeProvisioner;
use crate::core::patch::{ButlerApplier, HttpPatchSource, PatchPipeline, ToolProvisioner};
use crate::core::paths::{LauncherPaths, Platform};
use crate::core::progress::ProgressSink;
use crate::core::version::VersionResolver;

use super::background::BackgroundTasks;

/// Every long-lived engine component, wired from one [`EngineConfig`].
///
/// Components are shared through `Arc` so background tasks and UI
/// commands can hold them past the caller's borrow.
pub struct EngineState {
    pub config: EngineConfig,
    pub paths: LauncherPaths,
    pub platform: Platform,
    pub resolver: Arc<VersionResolver>,
    pub runtime: Arc<RuntimeProvisioner>,
    pub tool: Arc<ToolProvisioner>,
    pub coordinator: Arc<InstallCoordinator>,
}

impl EngineState {
    pub fn new(config: EngineConfig) -> LauncherResult<Self> {
        Self::with_platform(config, Platform::current())
    }

    pub fn with_platform(config: EngineConfig, platform: Platform) -> LauncherResult<Self> {
        let paths = LauncherPaths::from_config(&config);
        paths.ensure_layout()?;
        info!("Engine data root {:?} ({})", paths.root(), platform);

        let http_client = build_http_client(&config)?;
        let probe_client = build_probe_client(&config)?;
        let downloader = Downloader::new(http_client.clone(), &config);

        let resolver = Arc::new(VersionResolver::http(probe_client, platform.clone(), &config));
        let runtime = Arc::new(RuntimeProvisioner::new(
            downloader.clone(),
            paths.clone(),
            platform.clone(),
            &config,
        ));
        let tool = Arc::new(ToolProvisioner::new(
            downloader.clone(),
            paths.clone(),
            platform.clone(),
            &config,
        ));

        let source = HttpPatchSource::new(
            http_client,
            config.patch_steps_url.clone(),
            platform.clone(),
            Duration::from_secs(config.api_timeout_secs),
        );
        let applier = ButlerApplier::new(tool.binary_path());
        let pipeline = Arc::new(PatchPipeline::new(
            Arc::new(source),
            Arc::new(applier),
            downloader.clone(),
            paths.clone(),
        ));

        let mut fixups = default_fixups();
        if config.enable_online_fix {
            fixups.push(Arc::new(OnlineFixFixup::new(
                downloader,
                paths.clone(),
                platform.clone(),
                &config,
            )));
        }
        let coordinator = Arc::new(
            InstallCoordinator::new(
                paths.clone(),
                resolver.clone(),
                runtime.clone(),
                tool.clone(),
                pipeline,
            )
            .with_fixups(fixups),
        );
        debug!("Engine components wired");

        Ok(Self {
            config,
            paths,
            platform,
            resolver,
            runtime,
            tool,
            coordinator,
        })
    }

    pub async fn ensure_installed(
        &self,
        request: &InstallRequest,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<ResolvedVersion> {
        self.coordinator
            .ensure_installed(request, progress, cancel)
            .await
    }

    /// Start the fire-and-forget startup work for `branch`.
    pub fn spawn_background(&self, branch: &str) -> BackgroundTasks {
        BackgroundTasks::spawn(
            self.resolver.clone(),
            self.coordinator.clone(),
            self.paths.clone(),
            branch,
        )
    }
}
