//! Per-VM working directory layout.
//!
//! Every fleet member owns one directory holding its control socket,
//! log and metrics sinks, runtime config and provisioned rootfs. Lives in
//! flotilla-shared so the CLI can point operators at the same paths the
//! library writes.

use std::path::{Path, PathBuf};

// ============================================================================
// CONSTANTS
// ============================================================================

/// File names inside a VM directory.
pub mod files {
    /// Runtime control socket
    pub const CONTROL_SOCKET: &str = "fc.sock";

    /// Runtime log sink
    pub const LOG: &str = "fc.log";

    /// Runtime metrics sink
    pub const METRICS: &str = "fc.metrics";

    /// Serialized runtime configuration
    pub const RUNTIME_CONFIG: &str = "firecracker.json";

    /// Captured stdout/stderr of the runtime process
    pub const RUNTIME_OUTPUT: &str = "firecracker.out";

    /// Cloned block image (reflink strategy)
    pub const ROOTFS_IMAGE: &str = "rootfs.ext4";
}

/// Directory names inside a VM directory.
pub mod dirs {
    /// Overlay strategy root (contains upper/, work/, merged/)
    pub const OVERLAY: &str = "overlay";

    /// Overlay upper (writable) layer
    pub const UPPER: &str = "upper";

    /// Overlay work directory
    pub const WORK: &str = "work";

    /// Overlay mount point
    pub const MERGED: &str = "merged";
}

// ============================================================================
// VM DIRECTORY LAYOUT
// ============================================================================

/// Layout of a single VM's working directory.
///
/// ```text
/// {root}/                    # {home}/vms/{vm_id}
/// ├── fc.sock
/// ├── fc.log
/// ├── fc.metrics
/// ├── firecracker.json
/// ├── firecracker.out
/// ├── rootfs.ext4            # reflink strategy
/// └── overlay/               # overlay strategy
///     ├── upper/
///     ├── work/
///     └── merged/
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VmDirLayout {
    root: PathBuf,
}

impl VmDirLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn socket_path(&self) -> PathBuf {
        self.root.join(files::CONTROL_SOCKET)
    }

    pub fn log_path(&self) -> PathBuf {
        self.root.join(files::LOG)
    }

    pub fn metrics_path(&self) -> PathBuf {
        self.root.join(files::METRICS)
    }

    pub fn runtime_config_path(&self) -> PathBuf {
        self.root.join(files::RUNTIME_CONFIG)
    }

    pub fn runtime_output_path(&self) -> PathBuf {
        self.root.join(files::RUNTIME_OUTPUT)
    }

    /// Block image produced by the reflink strategy: {root}/rootfs.ext4
    pub fn rootfs_image_path(&self) -> PathBuf {
        self.root.join(files::ROOTFS_IMAGE)
    }

    /// Overlay directory: {root}/overlay
    pub fn overlay_dir(&self) -> PathBuf {
        self.root.join(dirs::OVERLAY)
    }

    /// Upper directory: {root}/overlay/upper
    pub fn upper_dir(&self) -> PathBuf {
        self.overlay_dir().join(dirs::UPPER)
    }

    /// Work directory: {root}/overlay/work
    ///
    /// Must sit on the same filesystem as the upper directory.
    pub fn work_dir(&self) -> PathBuf {
        self.overlay_dir().join(dirs::WORK)
    }

    /// Mount point: {root}/overlay/merged
    pub fn merged_dir(&self) -> PathBuf {
        self.overlay_dir().join(dirs::MERGED)
    }

    /// Create the overlay directories.
    pub fn prepare_overlay(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.upper_dir())?;
        std::fs::create_dir_all(self.work_dir())?;
        std::fs::create_dir_all(self.merged_dir())?;
        Ok(())
    }
}
