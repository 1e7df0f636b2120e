// ─── Patch Pipeline ───
// Brings an install tree from one version to another by applying the
// published steps strictly in order. Each step: fetch patch + signature
// into the cache, apply through the diff tool with a staging directory
// outside the tree, recover once from a signature mismatch by wiping the
// tree, clean up.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::core::downloader::{verify_sha256, Downloader};
use crate::core::error::{LauncherError, LauncherResult};
use crate::core::fsutil::{create_dir, remove_dir_if_exists, remove_file_if_exists};
use crate::core::paths::LauncherPaths;
use crate::core::process::CapturedOutput;
use crate::core::progress::{ProgressSink, Scaler, Stage};

use super::applier::{is_signature_mismatch, ApplyRequest, PatchApplier};
use super::diagnostics::{summarize, write_failure_log};
use super::steps::{select_chain, PatchSource, PatchStep};

/// Cached files of one step.
#[derive(Debug, Clone)]
struct StepFiles {
    patch: PathBuf,
    signature: PathBuf,
}

pub struct PatchPipeline {
    source: Arc<dyn PatchSource>,
    applier: Arc<dyn PatchApplier>,
    downloader: Downloader,
    paths: LauncherPaths,
}

impl PatchPipeline {
    pub fn new(
        source: Arc<dyn PatchSource>,
        applier: Arc<dyn PatchApplier>,
        downloader: Downloader,
        paths: LauncherPaths,
    ) -> Self {
        Self {
            source,
            applier,
            downloader,
            paths,
        }
    }

    /// Apply every step between `from` and `to` to `target_dir`.
    ///
    /// Any failure stops the chain; nothing is resumed across calls, the
    /// next call starts again from whatever is on disk.
    #[instrument(skip(self, target_dir, progress, cancel), fields(target = %target_dir.display()))]
    pub async fn apply_chain(
        &self,
        branch: &str,
        from: u32,
        to: u32,
        target_dir: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        if from == to {
            debug!("{} already at {}, nothing to patch", branch, to);
            return Ok(());
        }
        if from > to {
            return Err(LauncherError::Validation(format!(
                "cannot patch {branch} backwards from {from} to {to}"
            )));
        }

        progress.report(Stage::Patch, 0.0, "Fetching patch list...");
        let steps = tokio::select! {
            _ = cancel.cancelled() => return Err(LauncherError::Cancelled),
            steps = self.source.steps(branch, from) => steps?,
        };
        let chain = select_chain(&steps, from, to)?;
        info!(
            "Patching {} {} -> {} in {} step(s)",
            branch,
            from,
            to,
            chain.len()
        );

        create_dir(target_dir).await?;
        create_dir(&self.paths.cache_dir()).await?;

        let total = chain.len();
        for (index, step) in chain.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LauncherError::Cancelled);
            }

            let files = self.fetch_step(step, progress, cancel).await?;

            progress.report(
                Stage::Patch,
                index as f64 / total as f64 * 100.0,
                &format!("Patching {} → {} ({}/{})", step.from, step.to, index + 1, total),
            );

            let staging = self.paths.cache_dir().join(format!("staging-{}", step.file_stem()));
            let applied = self
                .apply_step(branch, step, &files, target_dir, &staging, cancel)
                .await;
            if let Err(err) = remove_dir_if_exists(&staging).await {
                warn!("Failed to remove staging directory {:?}: {}", staging, err);
            }
            applied?;

            // Applied patches are never needed again.
            remove_file_if_exists(&files.patch).await?;
            remove_file_if_exists(&files.signature).await?;
        }

        progress.report(Stage::Patch, 100.0, &format!("Updated to version {to}"));
        Ok(())
    }

    /// Patch and signature for `step`, reusing cached copies.
    async fn fetch_step(
        &self,
        step: &PatchStep,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<StepFiles> {
        let cache = self.paths.cache_dir();
        let files = StepFiles {
            patch: cache.join(format!("{}.pwr", step.file_stem())),
            signature: cache.join(format!("{}.pwr.sig", step.file_stem())),
        };

        if files.patch.is_file() && files.signature.is_file() {
            let intact = match &step.sha256 {
                Some(expected) => verify_sha256(&files.patch, expected).await.is_ok(),
                None => true,
            };
            if intact {
                debug!("Using cached patch {:?}", files.patch);
                progress.report(Stage::Download, 100.0, "Using cached patch");
                return Ok(files);
            }
        }

        {
            let scaled = Scaler::new(progress, 0.0, 70.0);
            self.downloader
                .download(&step.pwr, &files.patch, Stage::Download, &scaled, cancel)
                .await?;
        }
        if let Some(expected) = &step.sha256 {
            verify_sha256(&files.patch, expected).await?;
        }
        {
            let scaled = Scaler::new(progress, 70.0, 100.0);
            self.downloader
                .download(&step.sig, &files.signature, Stage::Download, &scaled, cancel)
                .await?;
        }
        Ok(files)
    }

    async fn apply_step(
        &self,
        branch: &str,
        step: &PatchStep,
        files: &StepFiles,
        target_dir: &Path,
        staging: &Path,
        cancel: &CancellationToken,
    ) -> LauncherResult<()> {
        remove_dir_if_exists(staging).await?;
        create_dir(staging).await?;

        let request = ApplyRequest {
            patch_file: &files.patch,
            signature_file: Some(&files.signature),
            target_dir,
            staging_dir: staging,
        };

        let first = self.applier.apply(&request, cancel).await?;
        if first.success {
            return Ok(());
        }

        if !is_signature_mismatch(&first.combined()) {
            return Err(self.tool_failure(branch, step, summarize(&first), &[("attempt 1", &first)]));
        }

        warn!(
            "Signature mismatch applying {} -> {}; wiping {:?} and retrying once",
            step.from, step.to, target_dir
        );
        remove_dir_if_exists(target_dir).await?;
        create_dir(target_dir).await?;
        remove_dir_if_exists(staging).await?;
        create_dir(staging).await?;

        let retry = self.applier.apply(&request, cancel).await?;
        if retry.success {
            info!("Step {} -> {} applied after wiping the install", step.from, step.to);
            return Ok(());
        }

        let message = format!(
            "signature mismatch ({}); retry after wipe failed: {}",
            summarize(&first),
            summarize(&retry)
        );
        Err(self.tool_failure(
            branch,
            step,
            message,
            &[("attempt 1", &first), ("retry after wipe", &retry)],
        ))
    }

    fn tool_failure(
        &self,
        branch: &str,
        step: &PatchStep,
        message: String,
        attempts: &[(&str, &CapturedOutput)],
    ) -> LauncherError {
        let log_path = match write_failure_log(&self.paths.logs_dir(), branch, step, attempts) {
            Ok(path) => path,
            Err(err) => {
                warn!("Could not write patch diagnostics: {}", err);
                PathBuf::new()
            }
        };
        LauncherError::PatchApply {
            from: step.from,
            to: step.to,
            message,
            log_path,
        }
    }
}
