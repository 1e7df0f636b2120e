use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::archive::extract_archive;
use crate::core::config::EngineConfig;
use crate::core::downloader::Downloader;
use crate::core::error::{ErrorKind, LauncherError, LauncherResult};
use crate::core::fsutil::{
    ensure_min_disk_space, flatten_single_root, remove_dir_if_exists, rename_with_retry,
    set_executable,
};
use crate::core::paths::{LauncherPaths, Platform};
use crate::core::process::{run_captured, tool_command};
use crate::core::progress::{ProgressSink, Scaler, Stage};

const LIVE_DIR: &str = "latest";
const METADATA_FILE: &str = "runtime.json";
const SELF_CHECK_TIMEOUT: Duration = Duration::from_secs(15);

// ── Manifest ────────────────────────────────────────────

/// `{version, download_url: {<os>: {<arch>: {url, sha256}}}}`
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeManifest {
    pub version: String,
    pub download_url: HashMap<String, HashMap<String, RuntimeAsset>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RuntimeAsset {
    pub url: String,
    pub sha256: String,
}

impl RuntimeManifest {
    pub fn asset_for(&self, platform: &Platform) -> LauncherResult<&RuntimeAsset> {
        self.download_url
            .get(&platform.os)
            .and_then(|arches| arches.get(&platform.arch))
            .ok_or_else(|| {
                LauncherError::Validation(format!(
                    "no Java runtime published for {platform} (manifest version {})",
                    self.version
                ))
            })
    }
}

/// Written next to the runtime so later runs know what is installed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeMetadata {
    pub version: String,
    pub sha256: String,
    pub source_url: String,
    pub installed_at: String,
}

// ── Provisioner ─────────────────────────────────────────

/// Keeps `shared/jre/latest` in step with the runtime manifest.
pub struct RuntimeProvisioner {
    client: Client,
    downloader: Downloader,
    paths: LauncherPaths,
    platform: Platform,
    manifest_url: String,
    rename_attempts: u32,
    rename_delay: Duration,
    min_free_disk: u64,
}

impl RuntimeProvisioner {
    pub fn new(
        downloader: Downloader,
        paths: LauncherPaths,
        platform: Platform,
        config: &EngineConfig,
    ) -> Self {
        Self {
            client: downloader.http_client().clone(),
            downloader,
            paths,
            platform,
            manifest_url: config.runtime_manifest_url.clone(),
            rename_attempts: config.rename_attempts,
            rename_delay: config.rename_delay(),
            min_free_disk: config.min_free_disk_bytes,
        }
    }

    pub fn live_dir(&self) -> PathBuf {
        self.paths.jre_dir().join(LIVE_DIR)
    }

    /// `java` binary of the live runtime. Errors when it is not installed.
    pub fn java_executable(&self) -> LauncherResult<PathBuf> {
        let java = locate_java(&self.live_dir());
        if java.is_file() {
            Ok(java)
        } else {
            Err(LauncherError::io(
                &java,
                std::io::Error::new(std::io::ErrorKind::NotFound, "Java runtime not installed"),
            ))
        }
    }

    pub fn installed_metadata(&self) -> Option<RuntimeMetadata> {
        let path = self.live_dir().join(METADATA_FILE);
        let bytes = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&bytes) {
            Ok(metadata) => Some(metadata),
            Err(err) => {
                warn!("Unreadable runtime metadata {:?}: {}", path, err);
                None
            }
        }
    }

    pub async fn fetch_manifest(&self, cancel: &CancellationToken) -> LauncherResult<RuntimeManifest> {
        let request = async {
            let response = self.client.get(&self.manifest_url).send().await?;
            let status = response.status();
            if !status.is_success() {
                return Err(LauncherError::DownloadFailed {
                    url: self.manifest_url.clone(),
                    status: status.as_u16(),
                });
            }
            Ok(response.json::<RuntimeManifest>().await?)
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(LauncherError::Cancelled),
            manifest = request => manifest,
        }
    }

    /// `java -version` succeeds for the live runtime.
    pub async fn is_functional(&self, cancel: &CancellationToken) -> bool {
        match self.self_check(cancel).await {
            Ok(()) => true,
            Err(err) => {
                debug!("Runtime self-check failed: {}", err);
                false
            }
        }
    }

    async fn self_check(&self, cancel: &CancellationToken) -> LauncherResult<()> {
        let java = self.java_executable()?;
        let output = run_captured(
            tool_command(&java, ["-version"]),
            SELF_CHECK_TIMEOUT,
            cancel,
        )
        .await?;
        if output.success {
            Ok(())
        } else {
            Err(LauncherError::RuntimeBroken {
                path: java,
                detail: format!(
                    "-version exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            })
        }
    }

    /// Make sure a runtime matching the manifest is installed and runs.
    /// Returns the `java` path.
    #[instrument(skip(self, progress, cancel))]
    pub async fn ensure_runtime(
        &self,
        branch: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<PathBuf> {
        progress.report(Stage::Runtime, 0.0, "Checking Java runtime...");

        let manifest = match self.fetch_manifest(cancel).await {
            Ok(manifest) => manifest,
            Err(err) if err.kind() == ErrorKind::Network && self.is_functional(cancel).await => {
                warn!("Runtime manifest unavailable ({}), keeping installed runtime", err);
                progress.report(Stage::Runtime, 100.0, "Java runtime ready (offline)");
                return self.java_executable();
            }
            Err(err) => return Err(err),
        };
        let asset = manifest.asset_for(&self.platform)?;

        let installed_version = self.installed_metadata().map(|m| m.version);
        if installed_version.as_deref() == Some(manifest.version.as_str())
            && self.is_functional(cancel).await
        {
            debug!("Java runtime {} already installed", manifest.version);
            progress.report(Stage::Runtime, 100.0, "Java runtime ready");
            return self.java_executable();
        }

        info!(
            "Installing Java runtime {} (installed: {:?})",
            manifest.version, installed_version
        );
        self.install(&manifest.version, asset, progress, cancel).await?;
        progress.report(Stage::Runtime, 100.0, "Java runtime ready");
        self.java_executable()
    }

    async fn install(
        &self,
        version: &str,
        asset: &RuntimeAsset,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        let jre_dir = self.paths.jre_dir();
        let cache_dir = self.paths.cache_dir();
        tokio::fs::create_dir_all(&jre_dir)
            .await
            .map_err(|source| LauncherError::io(&jre_dir, source))?;
        ensure_min_disk_space(&jre_dir, self.min_free_disk)?;

        let archive = cache_dir.join(archive_file_name(&asset.url));
        {
            let scaled = Scaler::new(progress, 0.0, 80.0);
            self.downloader
                .download_verified(&asset.url, &archive, &asset.sha256, Stage::Runtime, &scaled, cancel)
                .await?;
        }
        if cancel.is_cancelled() {
            return Err(LauncherError::Cancelled);
        }

        progress.report(Stage::Runtime, 85.0, "Extracting Java runtime...");
        let staging = jre_dir.join(format!("tmp-{version}"));
        remove_dir_if_exists(&staging).await?;
        {
            let archive = archive.clone();
            let staging = staging.clone();
            tokio::task::spawn_blocking(move || -> LauncherResult<()> {
                extract_archive(&archive, &staging)?;
                flatten_single_root(&staging)
            })
            .await
            .map_err(|e| LauncherError::Other(format!("Task join error: {e}")))??;
        }

        let staged_java = locate_java(&staging);
        if !staged_java.is_file() {
            remove_dir_if_exists(&staging).await?;
            return Err(LauncherError::RuntimeBroken {
                path: staged_java,
                detail: "archive does not contain a Java binary".into(),
            });
        }
        set_executable(&staged_java)?;

        let metadata = RuntimeMetadata {
            version: version.to_string(),
            sha256: asset.sha256.clone(),
            source_url: asset.url.clone(),
            installed_at: Utc::now().to_rfc3339(),
        };
        let metadata_path = staging.join(METADATA_FILE);
        tokio::fs::write(&metadata_path, serde_json::to_vec_pretty(&metadata)?)
            .await
            .map_err(|source| LauncherError::io(&metadata_path, source))?;

        progress.report(Stage::Runtime, 95.0, "Activating Java runtime...");
        let live = self.live_dir();
        remove_dir_if_exists(&live).await?;
        rename_with_retry(&staging, &live, self.rename_attempts, self.rename_delay).await?;

        if let Err(err) = self.self_check(cancel).await {
            warn!("Freshly installed runtime failed its self-check: {}", err);
            return Err(err);
        }

        if let Err(err) = tokio::fs::remove_file(&archive).await {
            debug!("Could not remove runtime archive {:?}: {}", archive, err);
        }
        info!("Java runtime {} installed at {:?}", version, live);
        Ok(())
    }
}

/// Last path segment of the URL, without query string.
fn archive_file_name(url: &str) -> String {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| "jre-archive".to_string())
}

fn java_exe() -> &'static str {
    if cfg!(target_os = "windows") {
        "java.exe"
    } else {
        "java"
    }
}

/// `bin/java`, or the macOS bundle layout `Contents/Home/bin/java`.
fn locate_java(runtime_root: &Path) -> PathBuf {
    let direct = runtime_root.join("bin").join(java_exe());
    if direct.is_file() {
        return direct;
    }
    let bundle = runtime_root
        .join("Contents")
        .join("Home")
        .join("bin")
        .join(java_exe());
    if bundle.is_file() {
        return bundle;
    }
    direct
}
