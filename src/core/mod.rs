// ─── Patchline Core ───
// Install and update engine for a game distributed as incremental binary
// patches.
//
// Architecture:
//   core/
//     version/    — Version discovery by probing, TTL caches, marker file
//     downloader/ — Resumable downloads with retry and SHA-256 checks
//     patch/      — Patch steps, external applier, sequential pipeline
//     java/       — Bundled Java runtime provisioning
//     install/    — Install coordinator, provisioning seam, fixups
//     state/      — Engine wiring + background tasks
//     progress    — Typed progress events, sinks and scaling
//     config      — Engine tunables and on-disk layout (paths)

pub mod archive;
pub mod config;
pub mod downloader;
pub mod error;
pub mod fsutil;
pub mod http;
pub mod install;
pub mod java;
pub mod patch;
pub mod paths;
pub mod process;
pub mod progress;
pub mod state;
pub mod version;

#[cfg(test)]
pub(crate) mod test_support;
