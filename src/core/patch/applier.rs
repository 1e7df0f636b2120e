use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::LauncherResult;
use crate::core::process::{run_captured, tool_command, CapturedOutput};

/// Output fragments the diff tool prints when the target tree fails
/// verification against the step's signature file. Only these justify
/// wiping the tree; a damaged patch file must not match.
const SIGNATURE_MISMATCH_MARKERS: &[&str] = &[
    "signature mismatch",
    "does not match signature",
    "doesn't match signature",
    "signature verification failed",
    "failed signature verification",
];

#[derive(Debug, Clone)]
pub struct ApplyRequest<'a> {
    pub patch_file: &'a Path,
    pub signature_file: Option<&'a Path>,
    pub target_dir: &'a Path,
    /// Always outside `target_dir`.
    pub staging_dir: &'a Path,
}

/// Runs one patch file against an install tree.
///
/// A tool that ran and failed is `Ok` with `success == false`; `Err` is
/// reserved for not being able to run it at all (or cancellation).
#[async_trait]
pub trait PatchApplier: Send + Sync {
    async fn apply(
        &self,
        request: &ApplyRequest<'_>,
        cancel: &CancellationToken,
    ) -> LauncherResult<CapturedOutput>;
}

/// itch.io `butler apply`.
pub struct ButlerApplier {
    butler: PathBuf,
    timeout: Duration,
}

impl ButlerApplier {
    pub fn new(butler: impl Into<PathBuf>) -> Self {
        Self {
            butler: butler.into(),
            timeout: Duration::from_secs(60 * 60),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn arguments(request: &ApplyRequest<'_>) -> Vec<std::ffi::OsString> {
        let mut args: Vec<std::ffi::OsString> = vec![
            "apply".into(),
            "--staging-dir".into(),
            request.staging_dir.into(),
        ];
        if let Some(signature) = request.signature_file {
            args.push("--signature".into());
            args.push(signature.into());
        }
        args.push(request.patch_file.into());
        args.push(request.target_dir.into());
        args
    }
}

#[async_trait]
impl PatchApplier for ButlerApplier {
    async fn apply(
        &self,
        request: &ApplyRequest<'_>,
        cancel: &CancellationToken,
    ) -> LauncherResult<CapturedOutput> {
        let cmd = tool_command(&self.butler, Self::arguments(request));
        run_captured(cmd, self.timeout, cancel).await
    }
}

pub fn is_signature_mismatch(output: &str) -> bool {
    let lower = output.to_ascii_lowercase();
    SIGNATURE_MISMATCH_MARKERS
        .iter()
        .any(|marker| lower.contains(marker))
}
