use std::path::PathBuf;
use thiserror::Error;

/// Central error type for the entire engine.
/// Every module returns `Result<T, LauncherError>`.
#[derive(Debug, Error)]
pub enum LauncherError {
    // ── IO ──────────────────────────────────────────────
    #[error("IO error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Not enough disk space at {path:?}: available={available} required={required}")]
    DiskSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    // ── Network ─────────────────────────────────────────
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Download failed for {url}: HTTP {status}")]
    DownloadFailed { url: String, status: u16 },

    #[error("Download of {url} ended early: got {received} of {expected} bytes")]
    TruncatedBody {
        url: String,
        received: u64,
        expected: u64,
    },

    #[error(
        "Cannot reach patch server for {branch} ({platform}): {detail} (check firewall/network)"
    )]
    ServerUnreachable {
        branch: String,
        platform: String,
        detail: String,
    },

    #[error("No versions published for {branch} on {platform}")]
    NoVersionsPublished { branch: String, platform: String },

    // ── Integrity ───────────────────────────────────────
    #[error("SHA-256 mismatch for {path:?}: expected {expected}, got {actual}")]
    Sha256Mismatch {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    // ── External tools ──────────────────────────────────
    #[error("Patch {from} -> {to} failed: {message} (diagnostics: {log_path:?})")]
    PatchApply {
        from: u32,
        to: u32,
        message: String,
        log_path: PathBuf,
    },

    #[error("Tool {tool} is not usable: {detail}")]
    ToolUnavailable { tool: String, detail: String },

    #[error("Runtime check failed for {path:?}: {detail}")]
    RuntimeBroken { path: PathBuf, detail: String },

    // ── Validation ──────────────────────────────────────
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Version {version} is not available on {branch}")]
    VersionNotFound { branch: String, version: u32 },

    #[error("Patch chain {from} -> {to} is broken: {detail}")]
    BrokenChain { from: u32, to: u32, detail: String },

    // ── Concurrency ─────────────────────────────────────
    #[error("Installation already in progress")]
    InstallInProgress,

    #[error("Operation cancelled")]
    Cancelled,

    // ── Serialization ───────────────────────────────────
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ── Archive ─────────────────────────────────────────
    #[error("Zip extraction error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Archive error at {path:?}: {detail}")]
    Archive { path: PathBuf, detail: String },

    // ── Generic ─────────────────────────────────────────
    #[error("{0}")]
    Other(String),
}

/// Convenience alias used throughout the crate.
pub type LauncherResult<T> = Result<T, LauncherError>;

/// Coarse error classes surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Integrity,
    FileSystem,
    ExternalTool,
    Validation,
    Concurrency,
    Cancelled,
}

impl LauncherError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LauncherError::Io {
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            LauncherError::Io { .. }
            | LauncherError::DiskSpace { .. }
            | LauncherError::Zip(_)
            | LauncherError::Archive { .. }
            | LauncherError::Other(_) => ErrorKind::FileSystem,
            LauncherError::Http(_)
            | LauncherError::DownloadFailed { .. }
            | LauncherError::TruncatedBody { .. }
            | LauncherError::ServerUnreachable { .. }
            | LauncherError::NoVersionsPublished { .. }
            | LauncherError::Json(_) => ErrorKind::Network,
            LauncherError::Sha256Mismatch { .. } => ErrorKind::Integrity,
            LauncherError::PatchApply { .. }
            | LauncherError::ToolUnavailable { .. }
            | LauncherError::RuntimeBroken { .. } => ErrorKind::ExternalTool,
            LauncherError::Validation(_)
            | LauncherError::VersionNotFound { .. }
            | LauncherError::BrokenChain { .. } => ErrorKind::Validation,
            LauncherError::InstallInProgress => ErrorKind::Concurrency,
            LauncherError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Whether retrying the same request has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            LauncherError::Http(err) => {
                if err.is_timeout() || err.is_connect() || err.is_body() || err.is_request() {
                    return true;
                }
                if let Some(status) = err.status() {
                    return is_transient_status(status.as_u16());
                }
                message_looks_transient(&error_chain_text(err))
            }
            LauncherError::DownloadFailed { status, .. } => is_transient_status(*status),
            LauncherError::TruncatedBody { .. } => true,
            LauncherError::Io { source, .. } => matches!(
                source.kind(),
                std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

fn is_transient_status(status: u16) -> bool {
    status >= 500 || status == 408 || status == 429
}

fn message_looks_transient(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    ["connection reset", "broken pipe", "timed out", "timeout", "unexpected eof"]
        .iter()
        .any(|needle| lower.contains(needle))
}

fn error_chain_text(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(inner) = source {
        text.push_str(": ");
        text.push_str(&inner.to_string());
        source = inner.source();
    }
    text
}

impl From<std::io::Error> for LauncherError {
    fn from(source: std::io::Error) -> Self {
        LauncherError::Io {
            path: PathBuf::new(),
            source,
        }
    }
}

// ── Serialization for IPC ───────────────────────────────
// Progress consumers receive errors as plain strings.
impl serde::Serialize for LauncherError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
