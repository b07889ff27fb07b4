//! Overlay mount over the golden image.

use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use flotilla_shared::layout::VmDirLayout;
use std::path::{Path, PathBuf};

/// One VM's overlay: read-only golden lower layer, private upper layer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlayMount {
    pub lower: PathBuf,
    pub upper: PathBuf,
    pub work: PathBuf,
    pub merged: PathBuf,
    /// Set when the golden image is a single file; the VM gets
    /// `merged/<file>` instead of the merged tree.
    pub image_name: Option<String>,
}

impl OverlayMount {
    /// Plan the overlay for `golden` inside `vm_dir`. Does not mount.
    ///
    /// A directory golden image becomes the lower layer itself. A file golden
    /// image is exposed through its parent directory, so every sibling file
    /// in that directory is visible (read-only) in the merged view.
    pub fn for_golden(golden: &Path, vm_dir: &VmDirLayout) -> FlotillaResult<Self> {
        let (lower, image_name) = if golden.is_dir() {
            (golden.to_path_buf(), None)
        } else {
            let parent = golden.parent().ok_or_else(|| {
                FlotillaError::Storage(format!(
                    "golden image {} has no parent directory",
                    golden.display()
                ))
            })?;
            let name = golden
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| {
                    FlotillaError::Storage(format!(
                        "golden image {} has a non UTF-8 name",
                        golden.display()
                    ))
                })?;
            (parent.to_path_buf(), Some(name.to_string()))
        };

        let mount = Self {
            lower,
            upper: vm_dir.upper_dir(),
            work: vm_dir.work_dir(),
            merged: vm_dir.merged_dir(),
            image_name,
        };

        for path in [&mount.lower, &mount.upper, &mount.work] {
            validate_option_path(path)?;
        }

        Ok(mount)
    }

    /// Mount options string passed to the kernel.
    pub fn options(&self) -> String {
        format!(
            "lowerdir={},upperdir={},workdir={}",
            self.lower.display(),
            self.upper.display(),
            self.work.display()
        )
    }

    /// Path the VM runtime boots from.
    pub fn rootfs_path(&self) -> PathBuf {
        match &self.image_name {
            Some(name) => self.merged.join(name),
            None => self.merged.clone(),
        }
    }

    #[cfg(target_os = "linux")]
    pub fn mount(&self) -> FlotillaResult<()> {
        use nix::errno::Errno;
        use nix::mount::{MsFlags, mount};

        let options = self.options();
        tracing::debug!(
            merged = %self.merged.display(),
            options = %options,
            "Mounting overlay"
        );

        mount(
            Some("overlay"),
            &self.merged,
            Some("overlay"),
            MsFlags::empty(),
            Some(options.as_str()),
        )
        .map_err(|errno| {
            let hint = match errno {
                Errno::ENODEV => " (overlay filesystem not available, try: modprobe overlay)",
                Errno::EPERM => " (mounting requires root)",
                _ => "",
            };
            FlotillaError::Storage(format!(
                "overlay mount at {} failed: {}{}",
                self.merged.display(),
                errno,
                hint
            ))
        })
    }

    #[cfg(not(target_os = "linux"))]
    pub fn mount(&self) -> FlotillaResult<()> {
        Err(FlotillaError::Unsupported(
            "overlay storage requires Linux".into(),
        ))
    }
}

/// Lazily detach an overlay left mounted at `merged` by a previous run.
///
/// Nothing mounted there is the common case; every failure is ignored.
#[cfg(target_os = "linux")]
pub(super) fn detach_stale_mount(merged: &Path) {
    use nix::mount::{MntFlags, umount2};

    if !merged.exists() {
        return;
    }
    if umount2(merged, MntFlags::MNT_DETACH).is_ok() {
        tracing::info!(merged = %merged.display(), "Detached stale overlay mount");
    }
}

#[cfg(not(target_os = "linux"))]
pub(super) fn detach_stale_mount(_merged: &Path) {}

/// The kernel splits overlay options on `,` and lower layers on `:`.
fn validate_option_path(path: &Path) -> FlotillaResult<()> {
    let s = path.to_string_lossy();
    if s.contains(',') || s.contains(':') {
        return Err(FlotillaError::Storage(format!(
            "path {} cannot be used in overlay options (contains ',' or ':')",
            path.display()
        )));
    }
    Ok(())
}
