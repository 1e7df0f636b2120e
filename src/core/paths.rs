use std::fmt;
use std::path::{Path, PathBuf};

use crate::core::config::EngineConfig;
use crate::core::error::{LauncherError, LauncherResult};

const APP_DIR_NAME: &str = "Patchline";
const CLIENT_BINARY: &str = "HytaleClient";

/// Operating system and architecture as the patch server names them.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

impl Platform {
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => "windows",
            "macos" => "darwin",
            "linux" => "linux",
            _ => "unknown",
        };
        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            _ => "unknown",
        };
        Self::new(os, arch)
    }

    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }

    pub fn is_windows(&self) -> bool {
        self.os == "windows"
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Every on-disk location the engine touches, derived from one data root.
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    root: PathBuf,
}

impl LauncherPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        match &config.data_dir {
            Some(dir) => Self::new(dir),
            None => Self::new(default_data_dir()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.root.join("cache")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.root.join("logs")
    }

    pub fn jre_dir(&self) -> PathBuf {
        self.root.join("shared").join("jre")
    }

    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("shared").join("tools").join("butler")
    }

    pub fn game_dir(&self, branch: &str, variant: &str) -> PathBuf {
        self.root
            .join("shared")
            .join("games")
            .join(branch)
            .join(variant)
    }

    /// Client executable inside an install tree.
    pub fn client_binary(game_dir: &Path) -> PathBuf {
        if cfg!(target_os = "macos") {
            game_dir
                .join("Client")
                .join("Hytale.app")
                .join("Contents")
                .join("MacOS")
                .join(CLIENT_BINARY)
        } else if cfg!(windows) {
            game_dir.join("Client").join(format!("{CLIENT_BINARY}.exe"))
        } else {
            game_dir.join("Client").join(CLIENT_BINARY)
        }
    }

    /// Create the directories every component expects to exist.
    pub fn ensure_layout(&self) -> LauncherResult<()> {
        for dir in [
            self.root.clone(),
            self.cache_dir(),
            self.logs_dir(),
            self.jre_dir(),
            self.tools_dir(),
        ] {
            std::fs::create_dir_all(&dir).map_err(|source| LauncherError::Io {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR_NAME)
}
