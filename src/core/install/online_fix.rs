// ─── Online Fix (Windows) ───
// Replaces the client executable and the bundled server with the build
// published as `online-fix.zip` on the launcher's latest release. Opt-in,
// and only ever applied to Windows installs.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use crate::core::archive::extract_archive;
use crate::core::config::EngineConfig;
use crate::core::downloader::Downloader;
use crate::core::error::{LauncherError, LauncherResult};
use crate::core::fsutil::{
    copy_dir_recursive, create_dir, remove_dir_if_exists, remove_file_if_exists,
};
use crate::core::paths::{LauncherPaths, Platform};
use crate::core::progress::{NoopSink, Stage};

use super::fixups::{FixupContext, PostInstallFixup};

const ASSET_NAME: &str = "online-fix.zip";
const EXTRACT_DIR: &str = "staging-online-fix";
const SERVER_DIR: &str = "Server";
const RELEASE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

pub struct OnlineFixFixup {
    downloader: Downloader,
    paths: LauncherPaths,
    platform: Platform,
    release_url: String,
}

impl OnlineFixFixup {
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
            release_url: config.online_fix_release_url.clone(),
        }
    }

    async fn asset_url(&self) -> LauncherResult<String> {
        let release: Release = self
            .downloader
            .http_client()
            .get(&self.release_url)
            .header(ACCEPT, "application/vnd.github+json")
            .timeout(RELEASE_TIMEOUT)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        release
            .assets
            .into_iter()
            .find(|asset| asset.name == ASSET_NAME)
            .map(|asset| asset.browser_download_url)
            .ok_or_else(|| {
                LauncherError::Validation(format!(
                    "{ASSET_NAME} not found in release {}",
                    self.release_url
                ))
            })
    }
}

#[async_trait]
impl PostInstallFixup for OnlineFixFixup {
    fn name(&self) -> &str {
        "online-fix"
    }

    #[instrument(skip(self, ctx), fields(game_dir = %ctx.game_dir.display()))]
    async fn apply(&self, ctx: &FixupContext<'_>) -> LauncherResult<()> {
        if !self.platform.is_windows() {
            debug!("Online fix only applies to Windows, skipping on {}", self.platform);
            return Ok(());
        }

        let url = self.asset_url().await?;
        let cache = self.paths.cache_dir();
        let archive = cache.join(ASSET_NAME);
        let extract_dir = cache.join(EXTRACT_DIR);
        info!("Applying online fix from {}", url);

        self.downloader
            .download(&url, &archive, Stage::OnlineFix, &NoopSink, &CancellationToken::new())
            .await?;

        remove_dir_if_exists(&extract_dir).await?;
        create_dir(&extract_dir).await?;
        let installed = install_from_archive(
            archive.clone(),
            extract_dir.clone(),
            ctx.game_dir.to_path_buf(),
            ctx.client_binary.to_path_buf(),
        )
        .await;

        remove_dir_if_exists(&extract_dir).await?;
        remove_file_if_exists(&archive).await?;
        installed
    }
}

/// Extract, then swap in the fixed client and server.
async fn install_from_archive(
    archive: PathBuf,
    extract_dir: PathBuf,
    game_dir: PathBuf,
    client_binary: PathBuf,
) -> LauncherResult<()> {
    tokio::task::spawn_blocking(move || -> LauncherResult<()> {
        extract_archive(&archive, &extract_dir)?;

        let client_rel = client_binary
            .strip_prefix(&game_dir)
            .map(PathBuf::from)
            .map_err(|_| {
                LauncherError::Validation(format!(
                    "client binary {client_binary:?} is outside {game_dir:?}"
                ))
            })?;
        let fixed_client = extract_dir.join(&client_rel);
        if !fixed_client.is_file() {
            return Err(LauncherError::Archive {
                path: archive.clone(),
                detail: format!("missing {}", client_rel.display()),
            });
        }
        if let Some(parent) = client_binary.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LauncherError::io(parent, source))?;
        }
        std::fs::copy(&fixed_client, &client_binary)
            .map_err(|source| LauncherError::io(&client_binary, source))?;

        let fixed_server = extract_dir.join(SERVER_DIR);
        if fixed_server.is_dir() {
            let server = game_dir.join(SERVER_DIR);
            if server.exists() {
                std::fs::remove_dir_all(&server)
                    .map_err(|source| LauncherError::io(&server, source))?;
            }
            copy_dir_recursive(&fixed_server, &server)?;
        }
        Ok(())
    })
    .await
    .map_err(|e| LauncherError::Other(format!("Task join error: {e}")))?
}
