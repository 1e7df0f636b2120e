// ─── Download Manager ───
// Resumable HTTP transfers with retry, progress and SHA-256 verification.
// Used by the runtime, tool and patch installers alike.

pub mod client;

pub use client::{part_path, sha256_file, verify_sha256, Downloader};
