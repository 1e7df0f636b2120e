use std::path::{Path, PathBuf};

use tracing::warn;

use crate::core::error::{LauncherError, LauncherResult};

pub const MARKER_FILE: &str = ".version";

pub fn marker_path(game_dir: &Path) -> PathBuf {
    game_dir.join(MARKER_FILE)
}

/// Installed version recorded in `game_dir`, or `None` when the marker is
/// missing or unreadable.
pub fn read_marker(game_dir: &Path) -> LauncherResult<Option<u32>> {
    let path = marker_path(game_dir);
    let text = match std::fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(LauncherError::io(&path, source)),
    };
    match text.trim().parse::<u32>() {
        Ok(version) => Ok(Some(version)),
        Err(_) => {
            warn!("Ignoring malformed version marker {:?}: {:?}", path, text.trim());
            Ok(None)
        }
    }
}

/// Write the marker through a temp file so a crash never leaves half a number.
pub fn write_marker(game_dir: &Path, version: u32) -> LauncherResult<()> {
    std::fs::create_dir_all(game_dir).map_err(|source| LauncherError::io(game_dir, source))?;
    let path = marker_path(game_dir);
    let tmp = game_dir.join(format!("{MARKER_FILE}.tmp"));
    std::fs::write(&tmp, version.to_string()).map_err(|source| LauncherError::io(&tmp, source))?;
    std::fs::rename(&tmp, &path).map_err(|source| LauncherError::io(&path, source))
}

pub fn clear_marker(game_dir: &Path) -> LauncherResult<()> {
    let path = marker_path(game_dir);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LauncherError::io(&path, source)),
    }
}
