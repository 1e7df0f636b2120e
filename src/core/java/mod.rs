// ─── Java Runtime ───
// Managed JRE under shared/jre, driven by the launcher's runtime manifest.

pub mod runtime;

pub use runtime::{RuntimeAsset, RuntimeManifest, RuntimeMetadata, RuntimeProvisioner};
