// ─── Filesystem helpers ───
// Small pieces shared by the runtime, tool and patch installers.

use std::path::Path;
use std::time::Duration;

use tracing::warn;

use crate::core::error::{LauncherError, LauncherResult};

/// Fail early when the volume holding `path` has less than `minimum_bytes`
/// free. Unknown volumes pass.
pub fn ensure_min_disk_space(path: &Path, minimum_bytes: u64) -> LauncherResult<()> {
    let disks = sysinfo::Disks::new_with_refreshed_list();
    let canonical = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
    let mut best_len = 0usize;
    let mut available = None;
    for disk in disks.list() {
        let mount = disk.mount_point();
        if canonical.starts_with(mount) {
            let len = mount.as_os_str().len();
            if len >= best_len {
                best_len = len;
                available = Some(disk.available_space());
            }
        }
    }
    match available {
        Some(bytes) if bytes < minimum_bytes => Err(LauncherError::DiskSpace {
            path: path.to_path_buf(),
            available: bytes,
            required: minimum_bytes,
        }),
        _ => Ok(()),
    }
}

pub async fn create_dir(path: &Path) -> LauncherResult<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| LauncherError::io(path, source))
}

/// Remove a directory tree; a missing directory is fine.
pub async fn remove_dir_if_exists(path: &Path) -> LauncherResult<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LauncherError::io(path, source)),
    }
}

pub async fn remove_file_if_exists(path: &Path) -> LauncherResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(LauncherError::io(path, source)),
    }
}

/// Rename, retrying while something (usually an antivirus scanner) holds a
/// handle inside the tree.
pub async fn rename_with_retry(
    from: &Path,
    to: &Path,
    attempts: u32,
    delay: Duration,
) -> LauncherResult<()> {
    let attempts = attempts.max(1);
    let mut last_error = None;
    for attempt in 1..=attempts {
        match tokio::fs::rename(from, to).await {
            Ok(()) => return Ok(()),
            Err(source) => {
                warn!(
                    "Rename {:?} -> {:?} failed (attempt {}/{}): {}",
                    from, to, attempt, attempts, source
                );
                last_error = Some(source);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    let source = last_error
        .unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::Other, "rename failed"));
    Err(LauncherError::io(to, source))
}

/// Restore the executable bit (POSIX only).
pub fn set_executable(path: &Path) -> LauncherResult<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(path)
            .map_err(|source| LauncherError::io(path, source))?
            .permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(path, perms).map_err(|source| LauncherError::io(path, source))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

/// Regular file that the current platform would run. Without a POSIX mode
/// every regular file counts.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}

/// Copy a tree, replacing files that already exist at the destination.
pub fn copy_dir_recursive(source: &Path, destination: &Path) -> LauncherResult<()> {
    std::fs::create_dir_all(destination)
        .map_err(|err| LauncherError::io(destination, err))?;
    let entries = std::fs::read_dir(source).map_err(|err| LauncherError::io(source, err))?;
    for entry in entries {
        let entry = entry.map_err(|err| LauncherError::io(source, err))?;
        let src_path = entry.path();
        let dst_path = destination.join(entry.file_name());
        let file_type = entry
            .file_type()
            .map_err(|err| LauncherError::io(&src_path, err))?;

        if file_type.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else if file_type.is_file() {
            if dst_path.exists() {
                std::fs::remove_file(&dst_path).map_err(|err| LauncherError::io(&dst_path, err))?;
            }
            std::fs::copy(&src_path, &dst_path).map_err(|err| LauncherError::io(&dst_path, err))?;
        }
    }
    Ok(())
}

/// Lift the contents of a lone top-level directory into `root`.
///
/// Archives often wrap everything in `jdk-21.0.3+9-jre/`; after flattening
/// `root/bin/java` is where callers expect it.
pub fn flatten_single_root(root: &Path) -> LauncherResult<()> {
    let entries: Vec<_> = std::fs::read_dir(root)
        .map_err(|source| LauncherError::io(root, source))?
        .filter_map(Result::ok)
        .collect();
    if entries.len() != 1 {
        return Ok(());
    }
    let wrapper = entries[0].path();
    if !wrapper.is_dir() {
        return Ok(());
    }

    // Move the wrapper aside first so a child with the same name cannot collide.
    let parked = root.join(format!(".flatten-{}", uuid::Uuid::new_v4()));
    std::fs::rename(&wrapper, &parked).map_err(|source| LauncherError::io(&wrapper, source))?;
    for entry in std::fs::read_dir(&parked).map_err(|source| LauncherError::io(&parked, source))? {
        let entry = entry.map_err(|source| LauncherError::io(&parked, source))?;
        let target = root.join(entry.file_name());
        std::fs::rename(entry.path(), &target)
            .map_err(|source| LauncherError::io(&target, source))?;
    }
    std::fs::remove_dir(&parked).map_err(|source| LauncherError::io(&parked, source))?;
    Ok(())
}
