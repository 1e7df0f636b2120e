// ─── Installation ───
// Orchestrates one install: version policy, runtime and tool provisioning,
// the patch chain, post-install fixups and the version marker.

pub mod coordinator;
pub mod fixups;
pub mod online_fix;
pub mod provision;

pub use coordinator::{InstallCoordinator, InstallRequest, ResolvedVersion, VersionPolicy};
pub use fixups::{default_fixups, ClientPermissionFixup, FixupContext, PostInstallFixup};
pub use online_fix::OnlineFixFixup;
pub use provision::Provision;
