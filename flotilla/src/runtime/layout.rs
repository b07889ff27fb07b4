use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use flotilla_shared::layout::VmDirLayout;
use std::path::{Path, PathBuf};

/// Directory structure constants
pub mod dirs {
    /// Base directory name for flotilla data
    pub const FLOTILLA_DIR: &str = ".flotilla";

    /// Per-VM working directories
    pub const VMS_DIR: &str = "vms";

    /// Orchestrator logs
    pub const LOGS_DIR: &str = "logs";
}

// ============================================================================
// FILESYSTEM LAYOUT (home directory)
// ============================================================================

/// Home directory layout:
///
/// ```text
/// {home}/
/// ├── .lock
/// ├── logs/flotilla.log
/// └── vms/
///     ├── vm0/        # VmDirLayout
///     └── vm1/
/// ```
#[derive(Clone, Debug)]
pub struct FilesystemLayout {
    home_dir: PathBuf,
}

impl FilesystemLayout {
    pub fn new(home_dir: PathBuf) -> Self {
        Self { home_dir }
    }

    pub fn home_dir(&self) -> &Path {
        &self.home_dir
    }

    /// Root of all VM working directories: ~/.flotilla/vms
    pub fn vms_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::VMS_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join(dirs::LOGS_DIR)
    }

    /// Layout for one VM. Does not touch the filesystem.
    pub fn vm(&self, vm_id: &str) -> VmDirLayout {
        VmDirLayout::new(self.vms_dir().join(vm_id))
    }

    /// Initialize the filesystem structure.
    pub fn prepare(&self) -> FlotillaResult<()> {
        std::fs::create_dir_all(&self.home_dir)
            .map_err(|e| FlotillaError::Storage(format!("failed to create home: {e}")))?;

        std::fs::create_dir_all(self.vms_dir())
            .map_err(|e| FlotillaError::Storage(format!("failed to create vms dir: {e}")))?;

        std::fs::create_dir_all(self.logs_dir())
            .map_err(|e| FlotillaError::Storage(format!("failed to create logs dir: {e}")))?;

        Ok(())
    }

    /// Recreate a VM's working directory empty.
    ///
    /// Artifacts from a previous run of the same VM id are discarded so a
    /// rerun never inherits a stale socket, log or rootfs.
    pub fn reset_vm_dir(&self, vm_id: &str) -> FlotillaResult<VmDirLayout> {
        let vm = self.vm(vm_id);

        if vm.root().exists() {
            tracing::debug!(vm_id, dir = %vm.root().display(), "Truncating VM directory from previous run");
            std::fs::remove_dir_all(vm.root()).map_err(|e| {
                FlotillaError::Storage(format!(
                    "failed to clear VM directory {}: {}",
                    vm.root().display(),
                    e
                ))
            })?;
        }

        std::fs::create_dir_all(vm.root()).map_err(|e| {
            FlotillaError::Storage(format!(
                "failed to create VM directory {}: {}",
                vm.root().display(),
                e
            ))
        })?;

        Ok(vm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_paths() {
        let layout = FilesystemLayout::new(PathBuf::from("/var/lib/flotilla"));

        assert_eq!(layout.vms_dir(), PathBuf::from("/var/lib/flotilla/vms"));
        assert_eq!(layout.logs_dir(), PathBuf::from("/var/lib/flotilla/logs"));
        assert_eq!(
            layout.vm("vm2").root(),
            Path::new("/var/lib/flotilla/vms/vm2")
        );
    }

    #[test]
    fn test_vm_dirs_are_distinct() {
        let layout = FilesystemLayout::new(PathBuf::from("/h"));
        assert_ne!(layout.vm("vm0").root(), layout.vm("vm1").root());
    }

    #[test]
    fn test_prepare_creates_dirs() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().join("home"));

        layout.prepare().unwrap();
        assert!(layout.vms_dir().is_dir());
        assert!(layout.logs_dir().is_dir());
    }

    #[test]
    fn test_reset_vm_dir_truncates_previous_run() {
        let temp = TempDir::new().unwrap();
        let layout = FilesystemLayout::new(temp.path().to_path_buf());
        layout.prepare().unwrap();

        let vm = layout.reset_vm_dir("vm0").unwrap();
        std::fs::write(vm.log_path(), b"old run").unwrap();

        let vm = layout.reset_vm_dir("vm0").unwrap();
        assert!(vm.root().is_dir());
        assert!(!vm.log_path().exists());
    }
}
