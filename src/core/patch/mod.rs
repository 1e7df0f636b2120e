// ─── Patch Application ───
// Incremental binary-diff updates: step metadata, the external applier,
// the sequential pipeline and the provisioning of the applier itself.

pub mod applier;
pub mod diagnostics;
pub mod pipeline;
pub mod steps;
pub mod tool;

pub use applier::{is_signature_mismatch, ApplyRequest, ButlerApplier, PatchApplier};
pub use pipeline::PatchPipeline;
pub use steps::{select_chain, HttpPatchSource, PatchSource, PatchStep};
pub use tool::ToolProvisioner;
