use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::core::error::LauncherResult;
use crate::core::fsutil::set_executable;

/// What a fixup gets to look at once the tree is patched.
#[derive(Debug, Clone)]
pub struct FixupContext<'a> {
    pub branch: &'a str,
    pub version: u32,
    pub game_dir: &'a Path,
    pub client_binary: &'a Path,
}

/// Platform-specific adjustment run after patching and before the version
/// marker is written. A failing fixup fails the install.
#[async_trait]
pub trait PostInstallFixup: Send + Sync {
    fn name(&self) -> &str;

    async fn apply(&self, ctx: &FixupContext<'_>) -> LauncherResult<()>;
}

/// Patches can drop the executable bit on POSIX systems.
pub struct ClientPermissionFixup;

#[async_trait]
impl PostInstallFixup for ClientPermissionFixup {
    fn name(&self) -> &str {
        "client-permissions"
    }

    async fn apply(&self, ctx: &FixupContext<'_>) -> LauncherResult<()> {
        debug!("Restoring executable bit on {:?}", ctx.client_binary);
        set_executable(ctx.client_binary)
    }
}

pub fn default_fixups() -> Vec<Arc<dyn PostInstallFixup>> {
    vec![Arc::new(ClientPermissionFixup)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn permission_fixup_sets_exec_bit() {
        let temp = tempfile::tempdir().unwrap();
        let binary = temp.path().join("HytaleClient");
        std::fs::write(&binary, b"elf").unwrap();

        ClientPermissionFixup
            .apply(&FixupContext {
                branch: "release",
                version: 17,
                game_dir: temp.path(),
                client_binary: &binary,
            })
            .await
            .unwrap();

        assert!(crate::core::fsutil::is_executable(&binary));
    }
}
