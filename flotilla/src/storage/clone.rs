//! Reflink clone with stream-copy fallback.

use super::ProvisionMethod;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Clone `src` to `dst`, sharing blocks when the filesystem allows it.
///
/// Falls back to a full copy on any clone failure (no FICLONE support,
/// cross-device destination). Either way `dst` ends up an independent file.
pub(super) fn reflink_or_copy(src: &Path, dst: &Path) -> FlotillaResult<ProvisionMethod> {
    remove_stale(dst)?;

    match reflink_copy::reflink(src, dst) {
        Ok(()) => {
            tracing::debug!(src = %src.display(), dst = %dst.display(), "Reflink clone succeeded");
            return Ok(ProvisionMethod::Reflink);
        }
        Err(e) => {
            tracing::debug!(
                src = %src.display(),
                error = %e,
                "Reflink unsupported, falling back to stream copy"
            );
        }
    }

    // A failed clone may leave an empty destination behind
    remove_stale(dst)?;
    let bytes = stream_copy(src, dst)?;
    tracing::debug!(src = %src.display(), dst = %dst.display(), bytes, "Stream copy complete");

    Ok(ProvisionMethod::Copy)
}

fn remove_stale(path: &Path) -> FlotillaResult<()> {
    if std::fs::symlink_metadata(path).is_ok() {
        std::fs::remove_file(path).map_err(|e| {
            FlotillaError::Storage(format!(
                "failed to remove stale rootfs {}: {}",
                path.display(),
                e
            ))
        })?;
    }
    Ok(())
}

fn stream_copy(src: &Path, dst: &Path) -> FlotillaResult<u64> {
    let source = File::open(src).map_err(|e| {
        FlotillaError::Storage(format!("failed to open golden image {}: {}", src.display(), e))
    })?;

    let dest = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(dst)
        .map_err(|e| {
            FlotillaError::Storage(format!("failed to create rootfs {}: {}", dst.display(), e))
        })?;

    let mut reader = BufReader::new(source);
    let mut writer = BufWriter::new(dest);

    let bytes = std::io::copy(&mut reader, &mut writer).map_err(|e| {
        FlotillaError::Storage(format!(
            "copy {} -> {} failed: {}",
            src.display(),
            dst.display(),
            e
        ))
    })?;

    writer.flush().map_err(|e| {
        FlotillaError::Storage(format!("failed to flush {}: {}", dst.display(), e))
    })?;
    let dest = writer.into_inner().map_err(|e| {
        FlotillaError::Storage(format!("failed to flush {}: {}", dst.display(), e.error()))
    })?;
    dest.sync_all().map_err(|e| {
        FlotillaError::Storage(format!("failed to sync {}: {}", dst.display(), e))
    })?;

    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_clone_is_independent_of_source() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("golden.img");
        let dst = temp.path().join("vm.img");
        std::fs::write(&src, b"pristine golden contents").unwrap();

        reflink_or_copy(&src, &dst).unwrap();
        std::fs::write(&dst, b"guest wrote here").unwrap();

        assert_eq!(std::fs::read(&src).unwrap(), b"pristine golden contents");
    }

    #[test]
    fn test_stream_copy_preserves_bytes() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("golden.img");
        let dst = temp.path().join("vm.img");
        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&src, &payload).unwrap();

        let bytes = stream_copy(&src, &dst).unwrap();

        assert_eq!(bytes, payload.len() as u64);
        assert_eq!(std::fs::read(&dst).unwrap(), payload);
    }

    #[test]
    fn test_existing_destination_replaced() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("golden.img");
        let dst = temp.path().join("vm.img");
        std::fs::write(&src, b"new").unwrap();
        std::fs::write(&dst, b"leftover from a previous run").unwrap();

        reflink_or_copy(&src, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"new");
    }

    #[test]
    fn test_unreadable_source_is_storage_error() {
        let temp = TempDir::new().unwrap();
        let err = reflink_or_copy(&temp.path().join("nope"), &temp.path().join("vm.img"))
            .unwrap_err();
        assert!(matches!(err, FlotillaError::Storage(_)));
    }
}
