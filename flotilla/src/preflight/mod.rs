//! Resource preflight and host capability checks.
//!
//! Resource checks are a best-effort guard against obvious over-commit, not
//! admission control: when the host cannot be probed the check passes.

pub mod host_check;

pub use host_check::{VirtualizationSupport, check_privileges, check_virtualization_support};

use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const MIB: u64 = 1024 * 1024;

/// Source of live host resource readings.
pub trait HostProbe: Send + Sync {
    /// Memory available for new allocations, in MiB.
    fn available_memory_mib(&self) -> FlotillaResult<u64>;

    /// Free space on the filesystem holding `path`, in MiB.
    fn free_disk_mib(&self, path: &Path) -> FlotillaResult<u64>;
}

/// Reads `/proc/meminfo` through `sysinfo` and filesystem stats through `statvfs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl HostProbe for SystemProbe {
    fn available_memory_mib(&self) -> FlotillaResult<u64> {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();

        // sysinfo reports zeros instead of failing when it cannot read the host
        if sys.total_memory() == 0 {
            return Err(FlotillaError::Preflight(
                "host memory statistics unavailable".into(),
            ));
        }

        Ok(sys.available_memory() / MIB)
    }

    fn free_disk_mib(&self, path: &Path) -> FlotillaResult<u64> {
        let probe_path = nearest_existing_ancestor(path);
        let stat = nix::sys::statvfs::statvfs(probe_path.as_path()).map_err(|e| {
            FlotillaError::Preflight(format!(
                "statvfs {} failed: {}",
                probe_path.display(),
                e
            ))
        })?;

        let free_bytes = stat.blocks_available() as u64 * stat.fragment_size() as u64;
        Ok(free_bytes / MIB)
    }
}

/// The directory that will hold provisioned storage may not exist yet.
fn nearest_existing_ancestor(path: &Path) -> PathBuf {
    path.ancestors()
        .find(|p| !p.as_os_str().is_empty() && p.exists())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Host headroom checks run before a VM commits any resources.
#[derive(Clone)]
pub struct ResourcePreflight {
    probe: Arc<dyn HostProbe>,
}

impl Default for ResourcePreflight {
    fn default() -> Self {
        Self::new(Arc::new(SystemProbe))
    }
}

impl ResourcePreflight {
    pub fn new(probe: Arc<dyn HostProbe>) -> Self {
        Self { probe }
    }

    /// True when at least `required_mib` of memory is available.
    ///
    /// Fails open when the probe itself fails.
    pub fn check_memory(&self, required_mib: u64) -> bool {
        match self.probe.available_memory_mib() {
            Ok(available) if available >= required_mib => true,
            Ok(available) => {
                tracing::warn!(
                    required_mib,
                    available_mib = available,
                    "Insufficient host memory"
                );
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Memory probe failed, skipping memory check");
                true
            }
        }
    }

    /// True when the filesystem holding `path` has `required_mib` free.
    ///
    /// Fails open when the probe itself fails.
    pub fn check_disk(&self, path: &Path, required_mib: u64) -> bool {
        match self.probe.free_disk_mib(path) {
            Ok(free) if free >= required_mib => true,
            Ok(free) => {
                tracing::warn!(
                    path = %path.display(),
                    required_mib,
                    free_mib = free,
                    "Insufficient free disk space"
                );
                false
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Disk probe failed, skipping disk check");
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedProbe {
        memory: FlotillaResult<u64>,
        disk: FlotillaResult<u64>,
    }

    impl HostProbe for FixedProbe {
        fn available_memory_mib(&self) -> FlotillaResult<u64> {
            self.memory.clone()
        }

        fn free_disk_mib(&self, _path: &Path) -> FlotillaResult<u64> {
            self.disk.clone()
        }
    }

    fn preflight(memory: FlotillaResult<u64>, disk: FlotillaResult<u64>) -> ResourcePreflight {
        ResourcePreflight::new(Arc::new(FixedProbe { memory, disk }))
    }

    #[test]
    fn test_memory_check_thresholds() {
        let pf = preflight(Ok(256), Ok(0));
        assert!(pf.check_memory(96));
        assert!(pf.check_memory(256));
        assert!(!pf.check_memory(257));
    }

    #[test]
    fn test_disk_check_thresholds() {
        let pf = preflight(Ok(0), Ok(1024));
        assert!(pf.check_disk(Path::new("/var/lib"), 1000));
        assert!(!pf.check_disk(Path::new("/var/lib"), 2048));
    }

    #[test]
    fn test_probe_failure_fails_open() {
        let pf = preflight(
            Err(FlotillaError::Preflight("no meminfo".into())),
            Err(FlotillaError::Preflight("no statvfs".into())),
        );
        assert!(pf.check_memory(u64::MAX));
        assert!(pf.check_disk(Path::new("/nowhere"), u64::MAX));
    }

    #[test]
    fn test_system_probe_reads_current_dir() {
        assert!(SystemProbe.free_disk_mib(Path::new(".")).is_ok());
    }

    #[test]
    fn test_nearest_existing_ancestor() {
        let temp = tempfile::TempDir::new().unwrap();
        let missing = temp.path().join("a/b/c");
        assert_eq!(nearest_existing_ancestor(&missing), temp.path());
        assert_eq!(nearest_existing_ancestor(temp.path()), temp.path());
    }
}
