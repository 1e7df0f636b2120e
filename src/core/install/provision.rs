use std::path::PathBuf;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::core::error::LauncherResult;
use crate::core::java::RuntimeProvisioner;
use crate::core::patch::ToolProvisioner;
use crate::core::progress::ProgressSink;

/// A dependency the game needs before patching: the Java runtime, the
/// diff tool.
#[async_trait]
pub trait Provision: Send + Sync {
    fn name(&self) -> &'static str;

    /// Installed and runs. No network.
    async fn is_ready(&self, cancel: &CancellationToken) -> bool;

    /// Install or repair; returns the executable path.
    async fn ensure(
        &self,
        branch: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<PathBuf>;
}

#[async_trait]
impl Provision for RuntimeProvisioner {
    fn name(&self) -> &'static str {
        "java runtime"
    }

    async fn is_ready(&self, cancel: &CancellationToken) -> bool {
        self.is_functional(cancel).await
    }

    async fn ensure(
        &self,
        branch: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<PathBuf> {
        self.ensure_runtime(branch, progress, cancel).await
    }
}

#[async_trait]
impl Provision for ToolProvisioner {
    fn name(&self) -> &'static str {
        "patch tool"
    }

    async fn is_ready(&self, cancel: &CancellationToken) -> bool {
        self.is_functional(cancel).await
    }

    async fn ensure(
        &self,
        _branch: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> LauncherResult<PathBuf> {
        self.ensure_tool(progress, cancel).await
    }
}
