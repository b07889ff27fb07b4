//! Fleet controller: drives each VM through preflight, storage, network and
//! start, in fleet order.

use super::outcome::{FleetOutcome, Stage, VmFailure, VmOutcome};
use crate::metrics::{FleetMetrics, FleetMetricsStorage};
use crate::net::{
    HostNetwork, HostNetworkState, NetworkProvisioner, NetworkTools, SystemNetworkTools,
};
use crate::preflight::{HostProbe, ResourcePreflight, SystemProbe};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::options::{FleetConfig, FlotillaOptions};
use crate::runtime::types::VmSpec;
use crate::storage::{ProvisionedStorage, StorageProvisioner, StorageStrategy};
use crate::supervisor::{RunningVm, VmState, VmStatus, VmSupervisor};
use crate::vmm::{FirecrackerRuntime, VmRuntime};
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use std::path::Path;
use std::sync::Arc;
use tracing::Instrument;

const MIB: u64 = 1024 * 1024;

/// Assembles a [`FleetController`], defaulting every host collaborator to
/// the real implementation.
pub struct FleetControllerBuilder {
    config: FleetConfig,
    options: FlotillaOptions,
    network_tools: Option<Arc<dyn NetworkTools>>,
    runtime: Option<Arc<dyn VmRuntime>>,
    probe: Option<Arc<dyn HostProbe>>,
}

impl FleetControllerBuilder {
    pub fn new(config: FleetConfig) -> Self {
        Self {
            config,
            options: FlotillaOptions::default(),
            network_tools: None,
            runtime: None,
            probe: None,
        }
    }

    pub fn options(mut self, options: FlotillaOptions) -> Self {
        self.options = options;
        self
    }

    pub fn network_tools(mut self, tools: Arc<dyn NetworkTools>) -> Self {
        self.network_tools = Some(tools);
        self
    }

    pub fn runtime(mut self, runtime: Arc<dyn VmRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HostProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Validate the configuration and prepare the home directory.
    pub fn build(self) -> FlotillaResult<FleetController> {
        self.config.validate()?;

        let layout = FilesystemLayout::new(self.options.home_dir.clone());
        layout.prepare()?;

        let metrics = FleetMetricsStorage::new();
        let tools = self
            .network_tools
            .unwrap_or_else(|| Arc::new(SystemNetworkTools::new()));
        let runtime = self.runtime.unwrap_or_else(|| {
            Arc::new(FirecrackerRuntime::new(
                self.config.runtime.firecracker_bin.clone(),
                self.config.runtime.boot_grace(),
            ))
        });
        let probe = self.probe.unwrap_or_else(|| Arc::new(SystemProbe));

        let network = Arc::new(NetworkProvisioner::new(tools));
        let supervisor = VmSupervisor::new(
            runtime,
            Arc::clone(&network),
            layout.clone(),
            self.config.runtime.setup_timeout(),
            metrics.clone(),
        );

        Ok(FleetController {
            preflight: ResourcePreflight::new(probe),
            storage: StorageProvisioner::new(self.config.storage, layout.clone()),
            host_state: HostNetworkState::new(),
            config: self.config,
            layout,
            network,
            supervisor,
            metrics,
        })
    }
}

/// Launches a fleet and keeps the shared host state for it.
pub struct FleetController {
    config: FleetConfig,
    layout: FilesystemLayout,
    preflight: ResourcePreflight,
    storage: StorageProvisioner,
    network: Arc<NetworkProvisioner>,
    host_state: HostNetworkState,
    supervisor: VmSupervisor,
    metrics: FleetMetricsStorage,
}

impl FleetController {
    pub fn builder(config: FleetConfig) -> FleetControllerBuilder {
        FleetControllerBuilder::new(config)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn layout(&self) -> &FilesystemLayout {
        &self.layout
    }

    pub fn network(&self) -> &Arc<NetworkProvisioner> {
        &self.network
    }

    pub fn host_state(&self) -> &HostNetworkState {
        &self.host_state
    }

    pub fn metrics(&self) -> FleetMetrics {
        FleetMetrics::new(self.metrics.clone())
    }

    /// Specs for every VM in the configuration.
    pub fn specs(&self) -> FlotillaResult<Vec<VmSpec>> {
        self.config.vm_specs()
    }

    /// Set up the bridge and NAT rule shared by every VM.
    ///
    /// Failure here is fatal to the whole run: no VM can get network.
    pub async fn bootstrap(&self) -> FlotillaResult<HostNetwork> {
        let net = &self.config.network;
        self.network
            .ensure_host_network(
                &self.host_state,
                &net.bridge_name,
                net.bridge_cidr,
                net.nat_subnet(),
            )
            .await
    }

    /// Launch every VM of the configuration.
    pub async fn launch(&self) -> FlotillaResult<FleetOutcome> {
        let specs = self.specs()?;
        self.launch_fleet(&specs).await
    }

    /// Run each spec through the pipeline in order.
    ///
    /// Host network setup failing is the only error returned; it happens
    /// before any VM is attempted. Every later error, including a privilege
    /// error from one VM's tap, is recorded as that VM's failure and the next
    /// VM is attempted.
    pub async fn launch_fleet(&self, specs: &[VmSpec]) -> FlotillaResult<FleetOutcome> {
        let host = self.bootstrap().await?;
        let mut outcome = FleetOutcome::default();

        tracing::info!(vms = specs.len(), strategy = %self.storage.strategy(), "Launching fleet");

        for spec in specs {
            FleetMetricsStorage::inc(&self.metrics.vms_attempted);
            let mut state = VmState::new();

            let result = self
                .launch_vm(spec, &host, &mut state)
                .instrument(tracing::info_span!("vm", vm_id = %spec.vm_id))
                .await;

            match result {
                Ok(running) => {
                    FleetMetricsStorage::inc(&self.metrics.vms_started);
                    outcome.push(VmOutcome::Running(running));
                }
                Err(failure) => {
                    state.mark_failed();
                    FleetMetricsStorage::inc(&self.metrics.vms_failed);

                    if failure.error.is_fatal_to_process() {
                        tracing::error!(
                            vm_id = %failure.vm_id,
                            stage = %failure.stage,
                            error = %failure.error,
                            "VM failed on a host error, continuing with the rest of the fleet"
                        );
                    } else {
                        tracing::error!(
                            vm_id = %failure.vm_id,
                            stage = %failure.stage,
                            error = %failure.error,
                            "VM failed"
                        );
                    }
                    outcome.push(VmOutcome::Failed(failure));
                }
            }
        }

        tracing::info!(
            running = outcome.running_count(),
            total = specs.len(),
            "Fleet launch pass complete"
        );

        Ok(outcome)
    }

    async fn launch_vm(
        &self,
        spec: &VmSpec,
        host: &HostNetwork,
        state: &mut VmState,
    ) -> Result<RunningVm, VmFailure> {
        let fail = |stage: Stage| {
            let vm_id = spec.vm_id.clone();
            move |error: FlotillaError| VmFailure {
                vm_id,
                stage,
                error,
            }
        };

        self.preflight(spec).map_err(fail(Stage::Preflight))?;
        state
            .transition_to(VmStatus::Provisioning)
            .map_err(fail(Stage::Preflight))?;

        let storage = self.provision_storage(spec).await.map_err(fail(Stage::Storage))?;

        let attachment = self
            .network
            .provision(spec, host)
            .await
            .map_err(fail(Stage::Network))?;

        self.supervisor
            .spawn(spec, &storage, attachment, state)
            .await
            .map_err(fail(Stage::Start))
    }

    fn preflight(&self, spec: &VmSpec) -> FlotillaResult<()> {
        let memory_mib = u64::from(spec.memory_mib);
        if !self.preflight.check_memory(memory_mib) {
            return Err(FlotillaError::Preflight(format!(
                "insufficient host memory for {} MiB",
                memory_mib
            )));
        }

        let disk_mib = self.required_disk_mib(&spec.rootfs);
        let vms_dir = self.layout.vms_dir();
        if !self.preflight.check_disk(&vms_dir, disk_mib) {
            return Err(FlotillaError::Preflight(format!(
                "insufficient free disk for {} MiB under {}",
                disk_mib,
                vms_dir.display()
            )));
        }

        Ok(())
    }

    /// Golden image size (when it has to be copied) plus configured headroom.
    fn required_disk_mib(&self, golden: &Path) -> u64 {
        let image_mib = match self.storage.strategy() {
            StorageStrategy::Reflink => std::fs::metadata(golden)
                .map(|m| m.len().div_ceil(MIB))
                .unwrap_or(0),
            // Upper layer starts empty
            StorageStrategy::Overlay => 0,
        };
        image_mib + self.config.disk_headroom_mib
    }

    async fn provision_storage(
        &self,
        spec: &VmSpec,
    ) -> FlotillaResult<ProvisionedStorage> {
        let storage = self.storage.clone();
        let vm_id = spec.vm_id.clone();
        let golden = spec.rootfs.clone();

        tokio::task::spawn_blocking(move || storage.provision(&vm_id, &golden))
            .await
            .map_err(|e| FlotillaError::Internal(format!("storage task failed: {}", e)))?
    }
}
