//! Start one VM and hand its exit wait to a detached task.

use super::state::{VmState, VmStatus};
use crate::metrics::FleetMetricsStorage;
use crate::net::{NetworkAttachment, NetworkProvisioner};
use crate::runtime::layout::FilesystemLayout;
use crate::runtime::types::VmSpec;
use crate::storage::ProvisionedStorage;
use crate::vmm::{ExitInfo, VmConfig, VmHandle, VmRuntime};
use chrono::{DateTime, Utc};
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// A VM that passed start.
#[derive(Clone, Debug)]
pub struct RunningVm {
    pub vm_id: String,
    pub handle: VmHandle,
    pub guest_ip: Ipv4Addr,
    pub tap_name: String,
    /// 0, or 1 when the first start hit a busy device.
    pub start_retries: u32,
    pub started_at: DateTime<Utc>,
    exit_rx: watch::Receiver<Option<ExitInfo>>,
}

impl RunningVm {
    pub fn endpoint(&self) -> String {
        format!("ssh root@{}", self.guest_ip)
    }

    /// Exit status, once the detached waiter has seen the VM exit.
    pub fn exit_info(&self) -> Option<ExitInfo> {
        *self.exit_rx.borrow()
    }

    /// Wait for the VM to exit. `None` when the exit could not be observed.
    pub async fn wait_for_exit(&mut self) -> Option<ExitInfo> {
        self.exit_rx
            .wait_for(Option::is_some)
            .await
            .ok()
            .and_then(|exit| *exit)
    }
}

/// A failed create/start attempt and the handle it may have left behind.
struct StartFailure {
    error: FlotillaError,
    stale: Option<VmHandle>,
}

impl From<FlotillaError> for StartFailure {
    fn from(error: FlotillaError) -> Self {
        Self { error, stale: None }
    }
}

/// Drives one VM from provisioned resources to a running process.
#[derive(Clone)]
pub struct VmSupervisor {
    runtime: Arc<dyn VmRuntime>,
    network: Arc<NetworkProvisioner>,
    layout: FilesystemLayout,
    setup_timeout: Duration,
    metrics: FleetMetricsStorage,
}

impl VmSupervisor {
    pub fn new(
        runtime: Arc<dyn VmRuntime>,
        network: Arc<NetworkProvisioner>,
        layout: FilesystemLayout,
        setup_timeout: Duration,
        metrics: FleetMetricsStorage,
    ) -> Self {
        Self {
            runtime,
            network,
            layout,
            setup_timeout,
            metrics,
        }
    }

    /// Create and start the VM described by `spec`.
    ///
    /// Each create and start call is bounded by the setup timeout. A start
    /// failing with `DeviceBusy` is retried exactly once on a fresh tap; any
    /// other error, or a second failure, is returned as-is. On failure the
    /// tap lease is released; on success a detached task waits for the VM
    /// and releases the lease when it exits.
    pub async fn spawn(
        &self,
        spec: &VmSpec,
        storage: &ProvisionedStorage,
        attachment: NetworkAttachment,
        state: &mut VmState,
    ) -> FlotillaResult<RunningVm> {
        state.transition_to(VmStatus::Starting)?;

        let vm_dir = self.layout.vm(&spec.vm_id);
        let mut config = VmConfig::assemble(spec, &vm_dir, storage.path.clone(), Some(&attachment));
        let mut attachment = attachment;

        let handle = match self.create_and_start(&config).await {
            Ok(handle) => handle,
            Err(failure) if failure.error.is_retryable() && state.can_retry_start() => {
                tracing::warn!(
                    vm_id = %spec.vm_id,
                    tap = %attachment.tap_name,
                    error = %failure.error,
                    "Start hit a busy device, retrying on a new tap"
                );
                self.discard(failure.stale.as_ref()).await;
                state.transition_to(VmStatus::Starting)?;
                FleetMetricsStorage::inc(&self.metrics.start_retries);

                attachment = match self.network.replace_tap(&attachment).await {
                    Ok(replacement) => replacement,
                    Err(e) => {
                        self.network.release_tap(&attachment.tap_name);
                        return Err(e);
                    }
                };
                config.rebind_network(&attachment);

                match self.create_and_start(&config).await {
                    Ok(handle) => handle,
                    Err(failure) => return Err(self.abandon(failure, &attachment).await),
                }
            }
            Err(failure) => return Err(self.abandon(failure, &attachment).await),
        };

        state.transition_to(VmStatus::Running)?;

        let exit_rx = self.watch_exit(&spec.vm_id, handle.clone(), attachment.tap_name.clone());
        let running = RunningVm {
            vm_id: spec.vm_id.clone(),
            handle,
            guest_ip: spec.guest_ip,
            tap_name: attachment.tap_name,
            start_retries: state.start_retries,
            started_at: Utc::now(),
            exit_rx,
        };

        tracing::info!(
            vm_id = %running.vm_id,
            tap = %running.tap_name,
            endpoint = %running.endpoint(),
            retries = running.start_retries,
            "VM running"
        );

        Ok(running)
    }

    async fn create_and_start(&self, config: &VmConfig) -> Result<VmHandle, StartFailure> {
        let handle = tokio::time::timeout(self.setup_timeout, self.runtime.create(config))
            .await
            .map_err(|_| self.timeout_error("create", &config.vm_id))??;

        match tokio::time::timeout(self.setup_timeout, self.runtime.start(&handle)).await {
            Ok(Ok(())) => Ok(handle),
            Ok(Err(error)) => Err(StartFailure {
                error,
                stale: Some(handle),
            }),
            Err(_) => Err(StartFailure {
                error: self.timeout_error("start", &config.vm_id),
                stale: Some(handle),
            }),
        }
    }

    fn timeout_error(&self, operation: &str, vm_id: &str) -> FlotillaError {
        FlotillaError::Timeout(format!(
            "{} of {} did not finish within {}ms",
            operation,
            vm_id,
            self.setup_timeout.as_millis()
        ))
    }

    /// Stop whatever a failed attempt left behind.
    async fn discard(&self, stale: Option<&VmHandle>) {
        if let Some(handle) = stale {
            if let Err(e) = self.runtime.stop(handle).await {
                tracing::warn!(vm_id = %handle.vm_id, error = %e, "Failed to stop stale VM handle");
            }
        }
    }

    async fn abandon(&self, failure: StartFailure, attachment: &NetworkAttachment) -> FlotillaError {
        self.discard(failure.stale.as_ref()).await;
        self.network.release_tap(&attachment.tap_name);
        failure.error
    }

    fn watch_exit(
        &self,
        vm_id: &str,
        handle: VmHandle,
        tap_name: String,
    ) -> watch::Receiver<Option<ExitInfo>> {
        let (exit_tx, exit_rx) = watch::channel(None);
        let runtime = Arc::clone(&self.runtime);
        let network = Arc::clone(&self.network);
        let metrics = self.metrics.clone();
        let vm_id = vm_id.to_string();

        tokio::spawn(async move {
            match runtime.wait(handle).await {
                Ok(exit) => {
                    if exit.success() {
                        tracing::info!(vm_id = %vm_id, %exit, "VM exited");
                    } else {
                        tracing::warn!(vm_id = %vm_id, %exit, "VM exited abnormally");
                    }
                    let _ = exit_tx.send(Some(exit));
                }
                Err(e) => {
                    tracing::warn!(vm_id = %vm_id, error = %e, "Lost track of VM");
                }
            }

            FleetMetricsStorage::inc(&metrics.vms_exited);
            network.release_tap(&tap_name);
        });

        exit_rx
    }
}
