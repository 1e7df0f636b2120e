// ─── Background Tasks ───
// Startup work that must never block or fail the launcher: a silent update
// check and a cache sweep. Each task is named, logs its own outcome and
// hands its result to a oneshot the caller may or may not await.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use serde::Serialize;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::core::error::{ErrorKind, LauncherError, LauncherResult};
use crate::core::fsutil::{remove_dir_if_exists, remove_file_if_exists};
use crate::core::install::InstallCoordinator;
use crate::core::paths::LauncherPaths;
use crate::core::version::{read_marker, VersionResolver};

pub const UPDATE_CHECK_TASK: &str = "silent-update-check";
pub const CACHE_CLEANUP_TASK: &str = "cache-cleanup";

const STAGING_PREFIX: &str = "staging-";
const TMP_SUFFIX: &str = ".tmp";
/// Leftovers touched more recently than this may belong to an install that
/// started after the in-progress check.
pub const STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// A spawned task plus the signal it fires when done.
pub struct BackgroundTask<T> {
    name: &'static str,
    completion: oneshot::Receiver<T>,
    handle: JoinHandle<()>,
}

impl<T: Send + 'static> BackgroundTask<T> {
    pub fn spawn<F>(name: &'static str, work: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        let (tx, completion) = oneshot::channel();
        let handle = tokio::spawn(
            async move {
                let outcome = work.await;
                // Nobody listening is fine.
                let _ = tx.send(outcome);
                debug!("finished");
            }
            .instrument(info_span!("background", task = name)),
        );
        Self {
            name,
            completion,
            handle,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Result of the task, or `None` if it was aborted or panicked.
    pub async fn wait(self) -> Option<T> {
        self.completion.await.ok()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }
}

// ── Update check ────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatus {
    pub branch: String,
    pub installed: Option<u32>,
    /// `None` when the origin could not be asked.
    pub latest: Option<u32>,
}

impl UpdateStatus {
    pub fn update_available(&self) -> bool {
        match (self.installed, self.latest) {
            (Some(installed), Some(latest)) => latest > installed,
            (None, Some(_)) => true,
            _ => false,
        }
    }
}

/// Compare the newest remote version with the `latest` tree's marker.
pub async fn check_for_update(
    resolver: &VersionResolver,
    paths: &LauncherPaths,
    branch: &str,
    cancel: &CancellationToken,
) -> LauncherResult<UpdateStatus> {
    let installed = read_marker(&paths.game_dir(branch, "latest"))?;
    let latest = resolver.find_latest(branch, cancel).await?;
    Ok(UpdateStatus {
        branch: branch.to_string(),
        installed,
        latest: Some(latest),
    })
}

async fn silent_update_check(
    resolver: Arc<VersionResolver>,
    paths: LauncherPaths,
    branch: String,
    cancel: CancellationToken,
) -> UpdateStatus {
    match check_for_update(&resolver, &paths, &branch, &cancel).await {
        Ok(status) => {
            if status.update_available() {
                info!(
                    "Update available for {}: {:?} -> {:?}",
                    branch, status.installed, status.latest
                );
            } else {
                debug!("{} is up to date", branch);
            }
            status
        }
        Err(err) => {
            if err.kind() == ErrorKind::Network {
                debug!("Update check skipped, origin unavailable: {}", err);
            } else {
                warn!("Update check for {} failed: {}", branch, err);
            }
            UpdateStatus {
                branch: branch.clone(),
                installed: read_marker(&paths.game_dir(&branch, "latest")).unwrap_or(None),
                latest: None,
            }
        }
    }
}

// ── Cache cleanup ───────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupReport {
    pub staging_dirs: Vec<PathBuf>,
    pub temp_files: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn removed(&self) -> usize {
        self.staging_dirs.len() + self.temp_files.len()
    }
}

/// Remove leftover `staging-*` directories and `*.tmp` files from an
/// interrupted install. Patch and runtime archives are kept for reuse, as
/// is anything modified within `min_age`.
pub async fn clean_cache(cache_dir: &Path, min_age: Duration) -> LauncherResult<CleanupReport> {
    let mut report = CleanupReport::default();
    let mut entries = match tokio::fs::read_dir(cache_dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(source) => return Err(LauncherError::io(cache_dir, source)),
    };

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|source| LauncherError::io(cache_dir, source))?
    {
        let path = entry.path();
        let name = entry.file_name().to_string_lossy().to_string();
        let file_type = entry
            .file_type()
            .await
            .map_err(|source| LauncherError::io(&path, source))?;
        let leftover = (file_type.is_dir() && name.starts_with(STAGING_PREFIX))
            || (file_type.is_file() && name.ends_with(TMP_SUFFIX));
        if !leftover {
            continue;
        }
        if !is_older_than(&entry, min_age).await {
            debug!("Keeping recently modified {:?}", path);
            continue;
        }

        if file_type.is_dir() {
            remove_dir_if_exists(&path).await?;
            report.staging_dirs.push(path);
        } else {
            remove_file_if_exists(&path).await?;
            report.temp_files.push(path);
        }
    }
    Ok(report)
}

/// Unreadable or future timestamps count as recent.
async fn is_older_than(entry: &tokio::fs::DirEntry, min_age: Duration) -> bool {
    if min_age.is_zero() {
        return true;
    }
    let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
        Ok(modified) => modified,
        Err(_) => return false,
    };
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age >= min_age)
        .unwrap_or(false)
}

async fn cache_cleanup(coordinator: Arc<InstallCoordinator>, cache_dir: PathBuf) -> CleanupReport {
    // Staging directories belong to a running install.
    if coordinator.is_installing() {
        debug!("Install in progress, skipping cache cleanup");
        return CleanupReport::default();
    }
    match clean_cache(&cache_dir, STALE_AFTER).await {
        Ok(report) => {
            if report.removed() > 0 {
                info!("Removed {} stale cache entries", report.removed());
            }
            report
        }
        Err(err) => {
            warn!("Cache cleanup failed: {}", err);
            CleanupReport::default()
        }
    }
}

// ── Task set ────────────────────────────────────────────

pub struct BackgroundTasks {
    pub update_check: BackgroundTask<UpdateStatus>,
    pub cache_cleanup: BackgroundTask<CleanupReport>,
    cancel: CancellationToken,
}

impl BackgroundTasks {
    pub fn spawn(
        resolver: Arc<VersionResolver>,
        coordinator: Arc<InstallCoordinator>,
        paths: LauncherPaths,
        branch: &str,
    ) -> Self {
        let cancel = CancellationToken::new();
        let update_check = BackgroundTask::spawn(
            UPDATE_CHECK_TASK,
            silent_update_check(resolver, paths.clone(), branch.to_string(), cancel.clone()),
        );
        let cache_cleanup =
            BackgroundTask::spawn(CACHE_CLEANUP_TASK, cache_cleanup(coordinator, paths.cache_dir()));
        Self {
            update_check,
            cache_cleanup,
            cancel,
        }
    }

    /// Stop probing; tasks finish with whatever they have.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub async fn join(self) -> (Option<UpdateStatus>, Option<CleanupReport>) {
        tokio::join!(self.update_check.wait(), self.cache_cleanup.wait())
    }
}
