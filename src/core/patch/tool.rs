use std::path::PathBuf;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::archive::extract_archive;
use crate::core::config::EngineConfig;
use crate::core::downloader::Downloader;
use crate::core::error::{LauncherError, LauncherResult};
use crate::core::fsutil::{create_dir, remove_file_if_exists, set_executable};
use crate::core::paths::{LauncherPaths, Platform};
use crate::core::process::{run_captured, tool_command};
use crate::core::progress::{ProgressSink, Scaler, Stage};

const TOOL_NAME: &str = "butler";
const VERSION_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

/// Keeps the diff-apply tool installed under `shared/tools/butler`.
pub struct ToolProvisioner {
    downloader: Downloader,
    paths: LauncherPaths,
    platform: Platform,
    base_url: String,
}

impl ToolProvisioner {
    pub fn new(
        downloader: Downloader,
        paths: LauncherPaths,
        platform: Platform,
        config: &EngineConfig,
    ) -> Self {
        Self {
            downloader,
            paths,
            platform,
            base_url: config.tool_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn binary_path(&self) -> PathBuf {
        let name = if self.platform.is_windows() {
            format!("{TOOL_NAME}.exe")
        } else {
            TOOL_NAME.to_string()
        };
        self.paths.tools_dir().join(name)
    }

    /// Only amd64 builds are published for macOS; they run under Rosetta.
    pub fn download_url(&self) -> String {
        let arch = if self.platform.os == "darwin" {
            "amd64"
        } else {
            self.platform.arch.as_str()
        };
        format!(
            "{}/{}-{}/LATEST/archive/default",
            self.base_url, self.platform.os, arch
        )
    }

    pub async fn is_functional(&self, cancel: &CancellationToken) -> bool {
        let binary = self.binary_path();
        if !binary.is_file() {
            return false;
        }
        match run_captured(
            tool_command(&binary, ["--version"]),
            VERSION_CHECK_TIMEOUT,
            cancel,
        )
        .await
        {
            Ok(output) if output.success => {
                debug!("{} {}", TOOL_NAME, output.combined().trim());
                true
            }
            Ok(output) => {
                debug!("{} --version exited with {:?}", TOOL_NAME, output.exit_code);
                false
            }
            Err(err) => {
                debug!("{} --version failed: {}", TOOL_NAME, err);
                false
            }
        }
    }

    #[instrument(skip(self, progress, cancel))]
    pub async fn ensure_tool(
        &self,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<PathBuf> {
        progress.report(Stage::Tool, 0.0, "Checking patch tool...");
        if self.is_functional(cancel).await {
            progress.report(Stage::Tool, 100.0, "Patch tool ready");
            return Ok(self.binary_path());
        }

        let tools_dir = self.paths.tools_dir();
        create_dir(&tools_dir).await?;
        let archive = tools_dir.join(format!("{TOOL_NAME}.zip"));
        let url = self.download_url();
        info!("Downloading {} from {}", TOOL_NAME, url);
        {
            let scaled = Scaler::new(progress, 0.0, 80.0);
            self.downloader
                .download(&url, &archive, Stage::Tool, &scaled, cancel)
                .await?;
        }

        progress.report(Stage::Tool, 85.0, "Extracting patch tool...");
        {
            let archive = archive.clone();
            let tools_dir = tools_dir.clone();
            tokio::task::spawn_blocking(move || extract_archive(&archive, &tools_dir))
                .await
                .map_err(|e| LauncherError::Other(format!("Task join error: {e}")))??;
        }
        remove_file_if_exists(&archive).await?;

        let binary = self.binary_path();
        if !binary.is_file() {
            return Err(LauncherError::ToolUnavailable {
                tool: TOOL_NAME.into(),
                detail: format!("archive from {url} has no {}", binary.display()),
            });
        }
        set_executable(&binary)?;

        if !self.is_functional(cancel).await {
            if cancel.is_cancelled() {
                return Err(LauncherError::Cancelled);
            }
            return Err(LauncherError::ToolUnavailable {
                tool: TOOL_NAME.into(),
                detail: "installed binary does not run".into(),
            });
        }
        progress.report(Stage::Tool, 100.0, "Patch tool ready");
        Ok(binary)
    }
}
