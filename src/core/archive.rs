// ─── Archive Extraction ───
// Zip and tar.gz unpacking for runtime and tool downloads. The format is
// sniffed from the file header since tool archives carry no extension.
// Entries that would land outside the destination are rejected.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::core::error::{LauncherError, LauncherResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    TarGz,
}

pub fn detect_format(path: &Path) -> LauncherResult<ArchiveFormat> {
    let mut header = [0u8; 4];
    let mut file = File::open(path).map_err(|source| LauncherError::io(path, source))?;
    let read = file
        .read(&mut header)
        .map_err(|source| LauncherError::io(path, source))?;

    if read >= 4 && header == [0x50, 0x4B, 0x03, 0x04] {
        Ok(ArchiveFormat::Zip)
    } else if read >= 2 && header[..2] == [0x1F, 0x8B] {
        Ok(ArchiveFormat::TarGz)
    } else {
        Err(LauncherError::Archive {
            path: path.to_path_buf(),
            detail: "unrecognised archive format".into(),
        })
    }
}

/// Unpack `archive` into `dest` (created if missing). Blocking.
pub fn extract_archive(archive: &Path, dest: &Path) -> LauncherResult<()> {
    std::fs::create_dir_all(dest).map_err(|source| LauncherError::io(dest, source))?;
    let format = detect_format(archive)?;
    debug!("Extracting {:?} ({:?}) into {:?}", archive, format, dest);
    match format {
        ArchiveFormat::Zip => extract_zip(archive, dest),
        ArchiveFormat::TarGz => extract_tar_gz(archive, dest),
    }
}

fn extract_zip(zip_path: &Path, dest: &Path) -> LauncherResult<()> {
    let zip_file = File::open(zip_path).map_err(|source| LauncherError::io(zip_path, source))?;
    let mut archive = zip::ZipArchive::new(zip_file)?;

    for index in 0..archive.len() {
        let mut zipped = archive.by_index(index)?;
        let rel_path = zipped
            .enclosed_name()
            .ok_or_else(|| escaping_entry(zip_path, zipped.name()))?;
        let out_path = dest.join(&rel_path);

        if zipped.is_dir() {
            std::fs::create_dir_all(&out_path)
                .map_err(|source| LauncherError::io(&out_path, source))?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LauncherError::io(parent, source))?;
        }
        let mut out =
            File::create(&out_path).map_err(|source| LauncherError::io(&out_path, source))?;
        std::io::copy(&mut zipped, &mut out)
            .map_err(|source| LauncherError::io(&out_path, source))?;

        #[cfg(unix)]
        if let Some(mode) = zipped.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(mode & 0o7777))
                .map_err(|source| LauncherError::io(&out_path, source))?;
        }
    }
    Ok(())
}

fn extract_tar_gz(tar_path: &Path, dest: &Path) -> LauncherResult<()> {
    let file = File::open(tar_path).map_err(|source| LauncherError::io(tar_path, source))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    archive.set_preserve_permissions(true);

    let entries = archive
        .entries()
        .map_err(|source| LauncherError::io(tar_path, source))?;
    for entry in entries {
        let mut entry = entry.map_err(|source| LauncherError::io(tar_path, source))?;
        let rel_path: PathBuf = entry
            .path()
            .map_err(|source| LauncherError::io(tar_path, source))?
            .into_owned();
        if !is_contained(&rel_path) {
            return Err(escaping_entry(tar_path, &rel_path.to_string_lossy()));
        }
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|source| LauncherError::io(dest.join(&rel_path), source))?;
        if !unpacked {
            return Err(escaping_entry(tar_path, &rel_path.to_string_lossy()));
        }
    }
    Ok(())
}

fn is_contained(path: &Path) -> bool {
    path.components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn escaping_entry(archive: &Path, name: &str) -> LauncherError {
    LauncherError::Archive {
        path: archive.to_path_buf(),
        detail: format!("entry escapes extraction root: {name}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::test_support::zip_bytes;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn tar_gz_bytes(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let encoder = GzEncoder::new(Vec::new(), Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (name, contents) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o755);
            header.set_cksum();
            builder.append_data(&mut header, name, *contents).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap()
    }

    #[test]
    fn extracts_zip_with_nested_dirs() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("jre.zip");
        std::fs::write(
            &archive,
            zip_bytes(&[("jdk/", b""), ("jdk/bin/java", b"#!/bin/sh\n"), ("jdk/release", b"21")]),
        )
        .unwrap();

        let dest = temp.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert!(dest.join("jdk/bin/java").is_file());
        assert_eq!(std::fs::read(dest.join("jdk/release")).unwrap(), b"21");
    }

    #[test]
    fn extracts_tar_gz_without_extension() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("default");
        std::fs::write(&archive, tar_gz_bytes(&[("butler", b"bin"), ("lib/7z.so", b"so")]))
            .unwrap();

        let dest = temp.path().join("out");
        extract_archive(&archive, &dest).unwrap();

        assert!(dest.join("butler").is_file());
        assert!(dest.join("lib/7z.so").is_file());
    }

    #[test]
    fn rejects_zip_slip() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("evil.zip");
        std::fs::write(&archive, zip_bytes(&[("../evil.txt", b"x")])).unwrap();

        let err = extract_archive(&archive, &temp.path().join("out")).unwrap_err();
        assert!(matches!(err, LauncherError::Archive { .. }));
        assert!(!temp.path().join("evil.txt").exists());
    }

    #[test]
    fn unknown_format_is_reported() {
        let temp = tempfile::tempdir().unwrap();
        let archive = temp.path().join("plain.txt");
        std::fs::write(&archive, b"hello").unwrap();
        assert!(matches!(
            detect_format(&archive),
            Err(LauncherError::Archive { .. })
        ));
    }

    #[test]
    fn containment_check() {
        assert!(is_contained(Path::new("a/b/c")));
        assert!(!is_contained(Path::new("../a")));
        assert!(!is_contained(Path::new("/etc/passwd")));
    }
}
