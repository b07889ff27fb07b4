//! Firecracker process runtime.
//!
//! `create` writes `{vm_dir}/firecracker.json`; `start` spawns
//! `firecracker --api-sock {vm_dir}/fc.sock --config-file {vm_dir}/firecracker.json`
//! with stdout and stderr captured in `{vm_dir}/firecracker.out`.
//! A process that dies inside the boot grace window is a failed start.

use super::{ExitInfo, VmConfig, VmHandle, VmRuntime};
use async_trait::async_trait;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use flotilla_shared::layout::VmDirLayout;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::process::{Child, Command};

/// Lines of runtime output quoted in start errors.
const OUTPUT_TAIL_LINES: usize = 5;

struct Instance {
    config: VmConfig,
    child: Option<Child>,
    pid: Option<u32>,
}

/// A spawned child that has not passed the boot grace window yet.
///
/// Killed on drop, so a `start` future cancelled by a timeout never leaves
/// a hypervisor running behind a VM reported as failed.
struct BootingChild(Option<Child>);

impl BootingChild {
    /// Exit status if the child exits within `grace`, `None` while it runs.
    async fn exited_within(&mut self, grace: Duration) -> Option<std::io::Result<ExitStatus>> {
        let child = self.0.as_mut()?;
        let result = tokio::time::timeout(grace, child.wait()).await.ok();
        if matches!(result, Some(Ok(_))) {
            self.0 = None;
        }
        result
    }

    /// Hand the child over once boot is done.
    fn release(mut self) -> Option<Child> {
        self.0.take()
    }
}

impl Drop for BootingChild {
    fn drop(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.start_kill();
        }
    }
}

pub struct FirecrackerRuntime {
    binary: PathBuf,
    boot_grace: Duration,
    next_instance: AtomicU64,
    instances: Mutex<HashMap<u64, Instance>>,
}

impl FirecrackerRuntime {
    pub fn new(binary: impl Into<PathBuf>, boot_grace: Duration) -> Self {
        Self {
            binary: binary.into(),
            boot_grace,
            next_instance: AtomicU64::new(1),
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    fn config_of(&self, handle: &VmHandle) -> FlotillaResult<VmConfig> {
        self.instances
            .lock()
            .get(&handle.instance)
            .map(|i| i.config.clone())
            .ok_or_else(|| {
                FlotillaError::InvalidState(format!("unknown VM handle for {}", handle.vm_id))
            })
    }
}

/// Firecracker `--config-file` document.
fn config_document(config: &VmConfig) -> serde_json::Value {
    let network_interfaces: Vec<_> = config
        .network
        .iter()
        .map(|n| {
            json!({
                "iface_id": n.iface_id,
                "guest_mac": n.guest_mac,
                "host_dev_name": n.host_dev_name,
            })
        })
        .collect();

    json!({
        "boot-source": {
            "kernel_image_path": config.kernel,
            "boot_args": config.boot_args,
        },
        "drives": [{
            "drive_id": "rootfs",
            "path_on_host": config.root_drive.path,
            "is_root_device": true,
            "is_read_only": config.root_drive.read_only,
        }],
        "machine-config": {
            "vcpu_count": config.machine.vcpus,
            "mem_size_mib": config.machine.memory_mib,
            "smt": false,
        },
        "network-interfaces": network_interfaces,
        "logger": {
            "log_path": config.log_path,
            "level": "Info",
        },
        "metrics": {
            "metrics_path": config.metrics_path,
        },
    })
}

fn exit_info(status: ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;

    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

fn output_tail(output: &str) -> String {
    let lines: Vec<&str> = output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect();
    let start = lines.len().saturating_sub(OUTPUT_TAIL_LINES);
    lines[start..].join(" | ")
}

/// Turn an exit inside the boot grace window into a start error.
fn classify_early_exit(config: &VmConfig, exit: ExitInfo, output: &str) -> FlotillaError {
    let lower = output.to_lowercase();
    let tail = output_tail(output);

    if lower.contains("resource busy") || lower.contains("ebusy") {
        FlotillaError::DeviceBusy(format!(
            "tap {} is busy: {}",
            config.tap_name().unwrap_or("<none>"),
            tail
        ))
    } else {
        FlotillaError::Start(format!(
            "firecracker exited during boot ({}): {}",
            exit, tail
        ))
    }
}

async fn touch(path: &Path) -> FlotillaResult<()> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map(|_| ())
        .map_err(|e| FlotillaError::Engine(format!("failed to create {}: {}", path.display(), e)))
}

#[async_trait]
impl VmRuntime for FirecrackerRuntime {
    async fn create(&self, config: &VmConfig) -> FlotillaResult<VmHandle> {
        let vm_dir = VmDirLayout::new(&config.work_dir);

        tokio::fs::create_dir_all(vm_dir.root()).await.map_err(|e| {
            FlotillaError::Engine(format!(
                "failed to create {}: {}",
                vm_dir.root().display(),
                e
            ))
        })?;

        // Firecracker opens these for writing but does not create them
        touch(&config.log_path).await?;
        touch(&config.metrics_path).await?;

        let document = serde_json::to_vec_pretty(&config_document(config))
            .map_err(|e| FlotillaError::Internal(format!("failed to encode VM config: {}", e)))?;
        let config_path = vm_dir.runtime_config_path();
        tokio::fs::write(&config_path, document).await.map_err(|e| {
            FlotillaError::Engine(format!(
                "failed to write {}: {}",
                config_path.display(),
                e
            ))
        })?;

        let instance = self.next_instance.fetch_add(1, Ordering::Relaxed);
        self.instances.lock().insert(
            instance,
            Instance {
                config: config.clone(),
                child: None,
                pid: None,
            },
        );

        tracing::debug!(vm_id = %config.vm_id, instance, config = %config_path.display(), "VM created");

        Ok(VmHandle {
            vm_id: config.vm_id.clone(),
            instance,
        })
    }

    async fn start(&self, handle: &VmHandle) -> FlotillaResult<()> {
        let config = self.config_of(handle)?;
        let vm_dir = VmDirLayout::new(&config.work_dir);

        // The API server refuses to bind over a leftover socket
        match tokio::fs::remove_file(&config.socket_path).await {
            Ok(()) => tracing::debug!(vm_id = %handle.vm_id, "Removed stale control socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(FlotillaError::Start(format!(
                    "failed to remove stale socket {}: {}",
                    config.socket_path.display(),
                    e
                )));
            }
        }

        let output_path = vm_dir.runtime_output_path();
        let stdout = std::fs::File::create(&output_path).map_err(|e| {
            FlotillaError::Start(format!("failed to create {}: {}", output_path.display(), e))
        })?;
        let stderr = stdout.try_clone().map_err(|e| {
            FlotillaError::Start(format!("failed to clone output handle: {}", e))
        })?;

        let mut child = Command::new(&self.binary)
            .arg("--api-sock")
            .arg(&config.socket_path)
            .arg("--config-file")
            .arg(vm_dir.runtime_config_path())
            .current_dir(vm_dir.root())
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(|e| {
                let err_msg = format!(
                    "Failed to spawn {} for {}: {}",
                    self.binary.display(),
                    handle.vm_id,
                    e
                );
                tracing::error!("{}", err_msg);
                FlotillaError::Start(err_msg)
            })?;
        let pid = child.id();

        // Recorded before the grace wait so `stop` can reach a process whose
        // `start` was cancelled mid-boot
        match self.instances.lock().get_mut(&handle.instance) {
            Some(instance) => instance.pid = pid,
            None => {
                let _ = child.start_kill();
                return Err(FlotillaError::Start(format!(
                    "{} was stopped during boot",
                    handle.vm_id
                )));
            }
        }

        let mut booting = BootingChild(Some(child));

        match booting.exited_within(self.boot_grace).await {
            Some(Ok(status)) => {
                let output = tokio::fs::read_to_string(&output_path)
                    .await
                    .unwrap_or_default();
                return Err(classify_early_exit(&config, exit_info(status), &output));
            }
            Some(Err(e)) => {
                return Err(FlotillaError::Start(format!(
                    "failed to poll firecracker for {}: {}",
                    handle.vm_id, e
                )));
            }
            None => {}
        }

        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(&handle.instance) else {
            // Stopped while booting; dropping `booting` kills the process
            return Err(FlotillaError::Start(format!(
                "{} was stopped during boot",
                handle.vm_id
            )));
        };
        instance.child = booting.release();
        drop(instances);

        tracing::info!(vm_id = %handle.vm_id, pid, "Firecracker started");
        Ok(())
    }

    async fn wait(&self, handle: VmHandle) -> FlotillaResult<ExitInfo> {
        let mut child = {
            let mut instances = self.instances.lock();
            let instance = instances.get_mut(&handle.instance).ok_or_else(|| {
                FlotillaError::InvalidState(format!("unknown VM handle for {}", handle.vm_id))
            })?;
            instance.child.take().ok_or_else(|| {
                FlotillaError::InvalidState(format!("{} is not running", handle.vm_id))
            })?
        };

        let status = child.wait().await.map_err(|e| {
            FlotillaError::Engine(format!("failed to wait for {}: {}", handle.vm_id, e))
        })?;
        self.instances.lock().remove(&handle.instance);

        Ok(exit_info(status))
    }

    async fn stop(&self, handle: &VmHandle) -> FlotillaResult<()> {
        let Some(mut instance) = self.instances.lock().remove(&handle.instance) else {
            return Ok(());
        };

        if let Some(child) = instance.child.as_mut() {
            child.start_kill().map_err(|e| {
                FlotillaError::Engine(format!("failed to kill {}: {}", handle.vm_id, e))
            })?;
        } else if let Some(pid) = instance.pid {
            // A detached waiter owns the child; signal it directly
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;

            match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    return Err(FlotillaError::Engine(format!(
                        "failed to kill {} (pid {}): {}",
                        handle.vm_id, pid, e
                    )));
                }
            }
        }

        tracing::debug!(vm_id = %handle.vm_id, instance = handle.instance, "VM stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::{Drive, MachineConfig, NetworkInterface};
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn config(dir: &Path) -> VmConfig {
        let vm_dir = VmDirLayout::new(dir.join("vm0"));
        VmConfig {
            vm_id: "vm0".into(),
            work_dir: vm_dir.root().to_path_buf(),
            socket_path: vm_dir.socket_path(),
            log_path: vm_dir.log_path(),
            metrics_path: vm_dir.metrics_path(),
            kernel: PathBuf::from("/golden/vmlinux"),
            boot_args: "console=ttyS0".into(),
            root_drive: Drive {
                path: vm_dir.rootfs_image_path(),
                read_only: false,
            },
            network: Some(NetworkInterface {
                iface_id: "eth0".into(),
                host_dev_name: "fctap0".into(),
                guest_mac: "AA:FC:00:00:00:00".into(),
            }),
            machine: MachineConfig {
                vcpus: 1,
                memory_mib: 96,
            },
        }
    }

    fn fake_binary(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-firecracker");
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_config_document_shape() {
        let temp = TempDir::new().unwrap();
        let doc = config_document(&config(temp.path()));

        assert_eq!(doc["machine-config"]["mem_size_mib"], 96);
        assert_eq!(doc["machine-config"]["vcpu_count"], 1);
        assert_eq!(doc["drives"][0]["is_root_device"], true);
        assert_eq!(doc["network-interfaces"][0]["host_dev_name"], "fctap0");
        assert_eq!(doc["boot-source"]["boot_args"], "console=ttyS0");
    }

    #[test]
    fn test_classify_busy_output() {
        let temp = TempDir::new().unwrap();
        let output = "Running Firecracker v1.7\nError: Open tap device failed: Resource busy (os error 16)\n";

        let err = classify_early_exit(&config(temp.path()), ExitInfo::default(), output);

        assert!(matches!(err, FlotillaError::DeviceBusy(_)));
        assert!(err.to_string().contains("fctap0"));
    }

    #[test]
    fn test_classify_other_output() {
        let temp = TempDir::new().unwrap();
        let exit = ExitInfo {
            code: Some(1),
            signal: None,
        };

        let err = classify_early_exit(&config(temp.path()), exit, "Invalid kernel image\n");

        assert!(matches!(err, FlotillaError::Start(_)));
        assert!(err.to_string().contains("Invalid kernel image"));
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let output = (1..=8).map(|i| format!("line{}", i)).collect::<Vec<_>>().join("\n");
        assert_eq!(output_tail(&output), "line4 | line5 | line6 | line7 | line8");
    }

    #[tokio::test]
    async fn test_create_writes_config_file() {
        let temp = TempDir::new().unwrap();
        let cfg = config(temp.path());
        let runtime = FirecrackerRuntime::new("/nonexistent/firecracker", Duration::from_millis(50));

        let handle = runtime.create(&cfg).await.unwrap();

        let vm_dir = VmDirLayout::new(&cfg.work_dir);
        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(vm_dir.runtime_config_path()).unwrap()).unwrap();
        assert_eq!(written["logger"]["log_path"], cfg.log_path.to_str().unwrap());
        assert!(cfg.log_path.exists());
        assert_eq!(handle.vm_id, "vm0");
    }

    #[tokio::test]
    async fn test_missing_binary_is_start_error() {
        let temp = TempDir::new().unwrap();
        let runtime = FirecrackerRuntime::new(temp.path().join("missing"), Duration::from_millis(50));
        let handle = runtime.create(&config(temp.path())).await.unwrap();

        let err = runtime.start(&handle).await.unwrap_err();
        assert!(matches!(err, FlotillaError::Start(_)));
    }

    #[tokio::test]
    async fn test_busy_exit_is_device_busy() {
        let temp = TempDir::new().unwrap();
        let binary = fake_binary(
            temp.path(),
            "echo 'Open tap device failed: Resource busy (os error 16)' >&2\nexit 1",
        );
        let runtime = FirecrackerRuntime::new(binary, Duration::from_secs(2));
        let handle = runtime.create(&config(temp.path())).await.unwrap();

        let err = runtime.start(&handle).await.unwrap_err();
        assert!(matches!(err, FlotillaError::DeviceBusy(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_wait_reports_exit_code() {
        let temp = TempDir::new().unwrap();
        let binary = fake_binary(temp.path(), "sleep 1\nexit 3");
        let runtime = FirecrackerRuntime::new(binary, Duration::from_millis(100));
        let handle = runtime.create(&config(temp.path())).await.unwrap();

        runtime.start(&handle).await.unwrap();
        let exit = runtime.wait(handle).await.unwrap();

        assert_eq!(exit.code, Some(3));
    }

    #[tokio::test]
    async fn test_start_cancelled_during_boot_leaves_no_process() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("alive");
        let binary = fake_binary(
            temp.path(),
            &format!("sleep 1\ntouch '{}'\nsleep 30", marker.display()),
        );
        let runtime = FirecrackerRuntime::new(binary, Duration::from_secs(5));
        let handle = runtime.create(&config(temp.path())).await.unwrap();

        let started = tokio::time::timeout(Duration::from_millis(200), runtime.start(&handle)).await;
        assert!(started.is_err(), "start should still be inside the grace window");
        runtime.stop(&handle).await.unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists(), "firecracker kept running after a cancelled start");
    }

    #[tokio::test]
    async fn test_stop_during_boot_kills_by_pid() {
        let temp = TempDir::new().unwrap();
        let marker = temp.path().join("alive");
        let binary = fake_binary(
            temp.path(),
            &format!("sleep 1\ntouch '{}'\nsleep 30", marker.display()),
        );
        let runtime = FirecrackerRuntime::new(binary, Duration::from_secs(5));
        let handle = runtime.create(&config(temp.path())).await.unwrap();

        let (started, stopped) = tokio::join!(runtime.start(&handle), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            runtime.stop(&handle).await
        });

        stopped.unwrap();
        assert!(started.is_err());
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_stop_unknown_handle_is_noop() {
        let runtime = FirecrackerRuntime::new("firecracker", Duration::from_millis(10));
        let handle = VmHandle {
            vm_id: "ghost".into(),
            instance: 99,
        };
        assert!(runtime.stop(&handle).await.is_ok());
    }
}
