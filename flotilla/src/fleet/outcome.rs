//! Per-VM results of a launch pass.

use crate::supervisor::RunningVm;
use flotilla_shared::errors::FlotillaError;
use std::fmt;

/// Pipeline stage a VM failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Preflight,
    Storage,
    Network,
    Start,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Preflight => "preflight",
            Stage::Storage => "storage",
            Stage::Network => "network",
            Stage::Start => "start",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct VmFailure {
    pub vm_id: String,
    pub stage: Stage,
    pub error: FlotillaError,
}

#[derive(Debug, Clone)]
pub enum VmOutcome {
    Running(RunningVm),
    Failed(VmFailure),
}

impl VmOutcome {
    pub fn vm_id(&self) -> &str {
        match self {
            VmOutcome::Running(vm) => &vm.vm_id,
            VmOutcome::Failed(failure) => &failure.vm_id,
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self, VmOutcome::Running(_))
    }

    pub fn as_running(&self) -> Option<&RunningVm> {
        match self {
            VmOutcome::Running(vm) => Some(vm),
            VmOutcome::Failed(_) => None,
        }
    }

    pub fn as_failure(&self) -> Option<&VmFailure> {
        match self {
            VmOutcome::Running(_) => None,
            VmOutcome::Failed(failure) => Some(failure),
        }
    }
}

/// Results of one launch pass, in fleet order.
#[derive(Debug, Clone, Default)]
pub struct FleetOutcome {
    vms: Vec<VmOutcome>,
}

impl FleetOutcome {
    pub(crate) fn push(&mut self, outcome: VmOutcome) {
        self.vms.push(outcome);
    }

    pub fn vms(&self) -> &[VmOutcome] {
        &self.vms
    }

    pub fn get(&self, vm_id: &str) -> Option<&VmOutcome> {
        self.vms.iter().find(|o| o.vm_id() == vm_id)
    }

    pub fn running(&self) -> impl Iterator<Item = &RunningVm> {
        self.vms.iter().filter_map(VmOutcome::as_running)
    }

    pub fn failed(&self) -> impl Iterator<Item = &VmFailure> {
        self.vms.iter().filter_map(VmOutcome::as_failure)
    }

    pub fn running_count(&self) -> usize {
        self.running().count()
    }

    /// True when there was at least one VM and none started.
    pub fn all_failed(&self) -> bool {
        !self.vms.is_empty() && self.running_count() == 0
    }

    pub fn summary(&self) -> FleetSummary {
        let lines = self
            .vms
            .iter()
            .map(|outcome| match outcome {
                VmOutcome::Running(vm) => SummaryLine {
                    vm_id: vm.vm_id.clone(),
                    status: "running",
                    detail: vm.endpoint(),
                },
                VmOutcome::Failed(failure) => SummaryLine {
                    vm_id: failure.vm_id.clone(),
                    status: "failed",
                    detail: format!("[{}] {}", failure.stage, failure.error),
                },
            })
            .collect();

        FleetSummary {
            running: self.running_count(),
            total: self.vms.len(),
            lines,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SummaryLine {
    vm_id: String,
    status: &'static str,
    detail: String,
}

/// Human-readable fleet report.
///
/// ```text
/// 2/3 VMs running
///   vm0  running  ssh root@172.16.0.10
///   vm1  failed   [preflight] preflight check failed: ...
///   vm2  running  ssh root@172.16.0.12
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FleetSummary {
    pub running: usize,
    pub total: usize,
    lines: Vec<SummaryLine>,
}

impl fmt::Display for FleetSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}/{} VMs running", self.running, self.total)?;

        let width = self.lines.iter().map(|l| l.vm_id.len()).max().unwrap_or(0);
        for line in &self.lines {
            writeln!(
                f,
                "  {:<width$}  {:<7}  {}",
                line.vm_id,
                line.status,
                line.detail,
                width = width
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(vm_id: &str, stage: Stage, error: FlotillaError) -> VmOutcome {
        VmOutcome::Failed(VmFailure {
            vm_id: vm_id.into(),
            stage,
            error,
        })
    }

    #[test]
    fn test_summary_lists_failures_with_stage() {
        let mut outcome = FleetOutcome::default();
        outcome.push(failure(
            "vm0",
            Stage::Preflight,
            FlotillaError::Preflight("need 96 MiB memory".into()),
        ));
        outcome.push(failure(
            "vm1",
            Stage::Storage,
            FlotillaError::Storage("golden image missing".into()),
        ));

        let text = outcome.summary().to_string();

        assert!(text.starts_with("0/2 VMs running"));
        assert!(text.contains("vm0  failed   [preflight]"));
        assert!(text.contains("need 96 MiB memory"));
        assert!(text.contains("[storage]"));
        assert!(outcome.all_failed());
    }

    #[test]
    fn test_lookup_by_id() {
        let mut outcome = FleetOutcome::default();
        outcome.push(failure("vm7", Stage::Network, FlotillaError::Network("x".into())));

        assert!(outcome.get("vm7").is_some());
        assert!(outcome.get("vm8").is_none());
        assert_eq!(outcome.failed().count(), 1);
        assert_eq!(outcome.running().count(), 0);
    }

    #[test]
    fn test_empty_outcome_is_not_all_failed() {
        assert!(!FleetOutcome::default().all_failed());
    }
}
