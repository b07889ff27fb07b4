//! Per-VM writable rootfs provisioning.
//!
//! Two strategies derive a private rootfs from the shared golden image:
//!
//! | Strategy  | Artifact                         | Isolation                         |
//! |-----------|----------------------------------|-----------------------------------|
//! | `Reflink` | `{vm_dir}/rootfs.ext4`           | block-level CoW clone, or full copy |
//! | `Overlay` | `{vm_dir}/overlay/merged[/file]` | writes copied up into `upper/`    |
//!
//! One strategy is active per deployment. Both leave the golden image
//! untouched no matter what the VM writes.

mod clone;
mod overlay;

pub use overlay::OverlayMount;

use crate::runtime::layout::FilesystemLayout;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Rootfs provisioning strategy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageStrategy {
    /// Reflink clone of the golden block image, stream copy when unsupported.
    #[default]
    Reflink,
    /// Overlay mount with the golden image as read-only lower layer.
    Overlay,
}

impl StorageStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageStrategy::Reflink => "reflink",
            StorageStrategy::Overlay => "overlay",
        }
    }
}

impl FromStr for StorageStrategy {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "reflink" | "clone" => Ok(StorageStrategy::Reflink),
            "overlay" | "overlayfs" => Ok(StorageStrategy::Overlay),
            _ => Err(FlotillaError::Config(format!(
                "Unknown storage strategy: '{}'. Supported: reflink, overlay",
                s
            ))),
        }
    }
}

impl std::fmt::Display for StorageStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rootfs artifact was produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProvisionMethod {
    /// Blocks shared with the golden image until written.
    Reflink,
    /// Byte-for-byte copy (filesystem lacks reflink support).
    Copy,
    Overlay(OverlayMount),
}

/// Writable rootfs owned by exactly one VM.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProvisionedStorage {
    pub vm_id: String,
    /// Path handed to the VM runtime as the root drive.
    pub path: PathBuf,
    pub method: ProvisionMethod,
}

impl ProvisionedStorage {
    /// Directory rootfs (overlay of a golden tree) rather than a block image.
    pub fn is_directory(&self) -> bool {
        self.path.is_dir()
    }
}

/// Produces per-VM rootfs artifacts under the VM's working directory.
#[derive(Clone, Debug)]
pub struct StorageProvisioner {
    strategy: StorageStrategy,
    layout: FilesystemLayout,
}

impl StorageProvisioner {
    pub fn new(strategy: StorageStrategy, layout: FilesystemLayout) -> Self {
        Self { strategy, layout }
    }

    pub fn strategy(&self) -> StorageStrategy {
        self.strategy
    }

    /// Provision a fresh rootfs for `vm_id` derived from `golden_image`.
    ///
    /// The VM's working directory is truncated first so nothing from a
    /// previous run survives. Blocking: callers on an async runtime should
    /// run this on a blocking thread.
    ///
    /// # Errors
    ///
    /// `FlotillaError::Storage` when the golden image is missing, the
    /// destination cannot be created, both clone and copy fail, or the
    /// overlay mount is rejected.
    pub fn provision(&self, vm_id: &str, golden_image: &Path) -> FlotillaResult<ProvisionedStorage> {
        let golden = golden_image.canonicalize().map_err(|e| {
            FlotillaError::Storage(format!(
                "golden image {} is not accessible: {}",
                golden_image.display(),
                e
            ))
        })?;

        // An overlay from a previous run pins the directory; release it before truncating
        overlay::detach_stale_mount(&self.layout.vm(vm_id).merged_dir());
        let vm_dir = self.layout.reset_vm_dir(vm_id)?;

        let storage = match self.strategy {
            StorageStrategy::Reflink => {
                if !golden.is_file() {
                    return Err(FlotillaError::Storage(format!(
                        "golden image {} must be a regular file for the reflink strategy",
                        golden.display()
                    )));
                }

                let dest = vm_dir.rootfs_image_path();
                let method = clone::reflink_or_copy(&golden, &dest)?;
                ProvisionedStorage {
                    vm_id: vm_id.to_string(),
                    path: dest,
                    method,
                }
            }
            StorageStrategy::Overlay => {
                let mount = OverlayMount::for_golden(&golden, &vm_dir)?;
                vm_dir.prepare_overlay().map_err(|e| {
                    FlotillaError::Storage(format!(
                        "failed to create overlay directories under {}: {}",
                        vm_dir.overlay_dir().display(),
                        e
                    ))
                })?;
                mount.mount()?;
                ProvisionedStorage {
                    vm_id: vm_id.to_string(),
                    path: mount.rootfs_path(),
                    method: ProvisionMethod::Overlay(mount),
                }
            }
        };

        tracing::info!(
            vm_id,
            strategy = %self.strategy,
            method = ?storage.method,
            path = %storage.path.display(),
            "Provisioned rootfs"
        );

        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, FilesystemLayout, PathBuf) {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().join("home"));
        layout.prepare().unwrap();
        let golden = temp.path().join("golden.ext4");
        std::fs::write(&golden, vec![0x5a; 64 * 1024]).unwrap();
        (temp, layout, golden)
    }

    #[test]
    fn test_strategy_from_str() {
        assert_eq!("reflink".parse::<StorageStrategy>().unwrap(), StorageStrategy::Reflink);
        assert_eq!("Overlay".parse::<StorageStrategy>().unwrap(), StorageStrategy::Overlay);
        assert!("zfs".parse::<StorageStrategy>().is_err());
    }

    #[test]
    fn test_reflink_strategy_produces_vm_artifact() {
        let (_temp, layout, golden) = setup();
        let provisioner = StorageProvisioner::new(StorageStrategy::Reflink, layout.clone());

        let storage = provisioner.provision("vm0", &golden).unwrap();

        assert_eq!(storage.path, layout.vm("vm0").rootfs_image_path());
        assert!(matches!(
            storage.method,
            ProvisionMethod::Reflink | ProvisionMethod::Copy
        ));
        assert_eq!(
            std::fs::read(&storage.path).unwrap(),
            std::fs::read(&golden).unwrap()
        );
        assert!(!storage.is_directory());
    }

    #[test]
    fn test_missing_golden_image_is_storage_error() {
        let (temp, layout, _golden) = setup();
        let provisioner = StorageProvisioner::new(StorageStrategy::Reflink, layout.clone());

        let err = provisioner
            .provision("vm0", &temp.path().join("missing.ext4"))
            .unwrap_err();

        assert!(matches!(err, FlotillaError::Storage(_)));
        // Nothing was created for the VM
        assert!(!layout.vm("vm0").root().exists());
    }

    #[test]
    fn test_reflink_rejects_directory_golden() {
        let (temp, layout, _golden) = setup();
        let tree = temp.path().join("tree");
        std::fs::create_dir(&tree).unwrap();

        let provisioner = StorageProvisioner::new(StorageStrategy::Reflink, layout);
        let err = provisioner.provision("vm0", &tree).unwrap_err();
        assert!(err.to_string().contains("regular file"));
    }

    #[test]
    fn test_rerun_truncates_previous_artifacts() {
        let (_temp, layout, golden) = setup();
        let provisioner = StorageProvisioner::new(StorageStrategy::Reflink, layout.clone());

        let first = provisioner.provision("vm0", &golden).unwrap();
        std::fs::write(layout.vm("vm0").log_path(), b"stale log").unwrap();
        std::fs::write(&first.path, b"dirty").unwrap();

        let second = provisioner.provision("vm0", &golden).unwrap();
        assert!(!layout.vm("vm0").log_path().exists());
        assert_eq!(
            std::fs::read(&second.path).unwrap(),
            std::fs::read(&golden).unwrap()
        );
    }
}
