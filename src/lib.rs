pub mod core;

use tracing_subscriber::EnvFilter;

pub use crate::core::config::{EngineConfig, RetryPolicy};
pub use crate::core::error::{ErrorKind, LauncherError, LauncherResult};
pub use crate::core::install::{InstallCoordinator, InstallRequest, ResolvedVersion, VersionPolicy};
pub use crate::core::paths::{LauncherPaths, Platform};
pub use crate::core::progress::{ProgressEvent, ProgressSink, Stage};
pub use crate::core::state::{BackgroundTasks, EngineState};
pub use crate::core::version::VersionResolver;

/// Install the `fmt` subscriber, honouring `RUST_LOG`.
///
/// Safe to call more than once; only the first call takes effect.
pub fn init_tracing() {
    let result = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,patchline=debug")),
        )
        .try_init();

    if result.is_ok() {
        tracing::info!("Patchline engine starting...");
    }
}
