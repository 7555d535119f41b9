//! Payload unpacking into the staging area.
//!
//! Supported shapes: zip archives, gzipped tarballs, plain tarballs, bare
//! directories (copied) and single files (placed at the staging root).
//! Archives wrapping everything in a single top-level directory are
//! flattened so the staged tree mirrors the final plugin layout.

use std::path::Path;

use thiserror::Error;

/// Errors raised while unpacking a payload.
#[derive(Error, Debug)]
pub enum ExtractError {
    /// Filesystem failure.
    #[error("extract io error: {0}")]
    Io(#[from] std::io::Error),

    /// Corrupt or unreadable zip archive.
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// The payload does not exist.
    #[error("payload not found: {0}")]
    Missing(std::path::PathBuf),
}

/// Unpack `source` into the directory `dest` (created if needed).
///
/// # Errors
///
/// Any [`ExtractError`]; `dest` may contain partial output on failure, but
/// it lives in the staging area and is discarded with it.
pub fn unpack_payload(source: &Path, dest: &Path) -> Result<(), ExtractError> {
    if !source.exists() {
        return Err(ExtractError::Missing(source.to_path_buf()));
    }
    std::fs::create_dir_all(dest)?;

    if source.is_dir() {
        copy_dir_all(source, dest)?;
        return Ok(());
    }

    let name = source
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    if name.ends_with(".zip") {
        let file = std::fs::File::open(source)?;
        let mut archive = zip::ZipArchive::new(file)?;
        archive.extract(dest)?;
        strip_single_root(dest)?;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        let file = std::fs::File::open(source)?;
        let decoder = flate2::read::GzDecoder::new(file);
        let mut archive = tar::Archive::new(decoder);
        archive.unpack(dest)?;
        strip_single_root(dest)?;
    } else if name.ends_with(".tar") {
        let file = std::fs::File::open(source)?;
        let mut archive = tar::Archive::new(file);
        archive.unpack(dest)?;
        strip_single_root(dest)?;
    } else {
        // A bare file payload: place it at the staging root as-is.
        let target = dest.join(source.file_name().unwrap_or_default());
        std::fs::copy(source, target)?;
    }
    Ok(())
}

/// Recursively copy a directory tree.
///
/// # Errors
///
/// Propagates the first filesystem failure.
pub fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Mods commonly zip a single wrapping folder; hoist its contents so the
/// staged tree starts at the payload root.
fn strip_single_root(dest: &Path) -> std::io::Result<()> {
    let entries: Vec<std::fs::DirEntry> =
        std::fs::read_dir(dest)?.collect::<Result<_, _>>()?;
    if entries.len() != 1 {
        return Ok(());
    }
    let only = &entries[0];
    if !only.file_type()?.is_dir() {
        return Ok(());
    }
    let wrapper = only.path();
    for child in std::fs::read_dir(&wrapper)? {
        let child = child?;
        std::fs::rename(child.path(), dest.join(child.file_name()))?;
    }
    std::fs::remove_dir(wrapper)?;
    Ok(())
}
