use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Storage for fleet-wide metrics.
#[derive(Clone, Debug, Default)]
pub struct FleetMetricsStorage {
    /// VMs the controller started working on
    pub(crate) vms_attempted: Arc<AtomicU64>,
    /// VMs that reached Running
    pub(crate) vms_started: Arc<AtomicU64>,
    /// VMs that ended Failed, any stage
    pub(crate) vms_failed: Arc<AtomicU64>,
    /// Busy-device start retries performed
    pub(crate) start_retries: Arc<AtomicU64>,
    /// Detached exit waits that observed the VM exit
    pub(crate) vms_exited: Arc<AtomicU64>,
}

impl FleetMetricsStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Handle for querying fleet metrics.
///
/// Cloneable, lightweight handle (only Arc pointers).
#[derive(Clone, Debug)]
pub struct FleetMetrics {
    storage: FleetMetricsStorage,
}

impl FleetMetrics {
    pub(crate) fn new(storage: FleetMetricsStorage) -> Self {
        Self { storage }
    }

    pub fn vms_attempted_total(&self) -> u64 {
        self.storage.vms_attempted.load(Ordering::Relaxed)
    }

    pub fn vms_started_total(&self) -> u64 {
        self.storage.vms_started.load(Ordering::Relaxed)
    }

    pub fn vms_failed_total(&self) -> u64 {
        self.storage.vms_failed.load(Ordering::Relaxed)
    }

    /// Never exceeds the number of VMs attempted: each VM retries at most once.
    pub fn start_retries_total(&self) -> u64 {
        self.storage.start_retries.load(Ordering::Relaxed)
    }

    pub fn vms_exited_total(&self) -> u64 {
        self.storage.vms_exited.load(Ordering::Relaxed)
    }

    /// Started VMs whose exit has not been observed yet.
    pub fn vms_running(&self) -> u64 {
        self.vms_started_total()
            .saturating_sub(self.vms_exited_total())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_sees_storage_updates() {
        let storage = FleetMetricsStorage::new();
        let metrics = FleetMetrics::new(storage.clone());

        FleetMetricsStorage::inc(&storage.vms_attempted);
        FleetMetricsStorage::inc(&storage.vms_attempted);
        FleetMetricsStorage::inc(&storage.vms_started);
        FleetMetricsStorage::inc(&storage.vms_failed);

        assert_eq!(metrics.vms_attempted_total(), 2);
        assert_eq!(metrics.vms_started_total(), 1);
        assert_eq!(metrics.vms_failed_total(), 1);
        assert_eq!(metrics.vms_running(), 1);

        FleetMetricsStorage::inc(&storage.vms_exited);
        assert_eq!(metrics.vms_running(), 0);
    }
}
