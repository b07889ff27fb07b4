use flotilla::FlotillaResult;
use flotilla::FlotillaError;
use flotilla::preflight::HostProbe;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Host probe reporting fixed, adjustable readings.
pub struct FakeHostProbe {
    memory_mib: AtomicU64,
    disk_mib: AtomicU64,
    broken: AtomicBool,
}

impl FakeHostProbe {
    pub fn new(memory_mib: u64, disk_mib: u64) -> Self {
        Self {
            memory_mib: AtomicU64::new(memory_mib),
            disk_mib: AtomicU64::new(disk_mib),
            broken: AtomicBool::new(false),
        }
    }

    /// Plenty of everything.
    pub fn roomy() -> Self {
        Self::new(64 * 1024, 1024 * 1024)
    }

    pub fn set_memory_mib(&self, mib: u64) {
        self.memory_mib.store(mib, Ordering::SeqCst);
    }

    pub fn set_disk_mib(&self, mib: u64) {
        self.disk_mib.store(mib, Ordering::SeqCst);
    }

    /// Make every reading fail.
    pub fn break_probe(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> FlotillaResult<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(FlotillaError::Preflight("probe unavailable".into()));
        }
        Ok(())
    }
}

impl HostProbe for FakeHostProbe {
    fn available_memory_mib(&self) -> FlotillaResult<u64> {
        self.check()?;
        Ok(self.memory_mib.load(Ordering::SeqCst))
    }

    fn free_disk_mib(&self, _path: &Path) -> FlotillaResult<u64> {
        self.check()?;
        Ok(self.disk_mib.load(Ordering::SeqCst))
    }
}
