use async_trait::async_trait;
use flotilla::vmm::{ExitInfo, VmConfig, VmHandle, VmRuntime};
use flotilla::{FlotillaError, FlotillaResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;

/// What one `start` call does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartBehavior {
    Succeed,
    /// Fail with `DeviceBusy`.
    Busy,
    /// Fail with `Start` and this reason.
    Fail(String),
    /// Never return; exercises the setup timeout.
    Hang,
}

struct Instance {
    config: VmConfig,
    exit_tx: watch::Sender<Option<ExitInfo>>,
    stopped: bool,
}

/// Scriptable VM runtime.
///
/// `start` pops the next behavior scripted for the VM id (default
/// `Succeed`). `wait` blocks until the test calls [`FakeVmRuntime::exit`]
/// or the VM is stopped.
#[derive(Default)]
pub struct FakeVmRuntime {
    scripts: Mutex<HashMap<String, VecDeque<StartBehavior>>>,
    create_delay: Mutex<Option<Duration>>,
    next_instance: AtomicU64,
    instances: Mutex<HashMap<u64, Instance>>,
    /// (vm id, tap) per start call, in order.
    starts: Mutex<Vec<(String, String)>>,
    creates: Mutex<Vec<String>>,
    stops: Mutex<Vec<String>>,
}

impl FakeVmRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue start behaviors for `vm_id`, consumed one per call.
    pub fn script(&self, vm_id: &str, behaviors: impl IntoIterator<Item = StartBehavior>) {
        self.scripts
            .lock()
            .entry(vm_id.to_string())
            .or_default()
            .extend(behaviors);
    }

    /// Delay every `create` call.
    pub fn set_create_delay(&self, delay: Duration) {
        *self.create_delay.lock() = Some(delay);
    }

    /// Number of `start` calls for `vm_id`.
    pub fn start_calls(&self, vm_id: &str) -> usize {
        self.starts.lock().iter().filter(|(id, _)| id == vm_id).count()
    }

    pub fn create_calls(&self, vm_id: &str) -> usize {
        self.creates.lock().iter().filter(|id| *id == vm_id).count()
    }

    pub fn stop_calls(&self, vm_id: &str) -> usize {
        self.stops.lock().iter().filter(|id| *id == vm_id).count()
    }

    /// Taps used by each `start` of `vm_id`, in order.
    pub fn started_taps(&self, vm_id: &str) -> Vec<String> {
        self.starts
            .lock()
            .iter()
            .filter(|(id, _)| id == vm_id)
            .map(|(_, tap)| tap.clone())
            .collect()
    }

    /// Last config passed to `create` for `vm_id`.
    pub fn last_config(&self, vm_id: &str) -> Option<VmConfig> {
        self.instances
            .lock()
            .iter()
            .filter(|(_, i)| i.config.vm_id == vm_id)
            .max_by_key(|(id, _)| **id)
            .map(|(_, i)| i.config.clone())
    }

    /// Make every live instance of `vm_id` exit with `exit`.
    pub fn exit(&self, vm_id: &str, exit: ExitInfo) {
        for instance in self.instances.lock().values() {
            if instance.config.vm_id == vm_id && !instance.stopped {
                instance.exit_tx.send_replace(Some(exit));
            }
        }
    }

    fn next_behavior(&self, vm_id: &str) -> StartBehavior {
        self.scripts
            .lock()
            .get_mut(vm_id)
            .and_then(VecDeque::pop_front)
            .unwrap_or(StartBehavior::Succeed)
    }
}

#[async_trait]
impl VmRuntime for FakeVmRuntime {
    async fn create(&self, config: &VmConfig) -> FlotillaResult<VmHandle> {
        let delay = *self.create_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.creates.lock().push(config.vm_id.clone());
        let instance = self.next_instance.fetch_add(1, Ordering::SeqCst);
        let (exit_tx, _) = watch::channel(None);
        self.instances.lock().insert(
            instance,
            Instance {
                config: config.clone(),
                exit_tx,
                stopped: false,
            },
        );

        Ok(VmHandle {
            vm_id: config.vm_id.clone(),
            instance,
        })
    }

    async fn start(&self, handle: &VmHandle) -> FlotillaResult<()> {
        let tap = self
            .instances
            .lock()
            .get(&handle.instance)
            .and_then(|i| i.config.tap_name().map(str::to_string))
            .unwrap_or_default();
        self.starts.lock().push((handle.vm_id.clone(), tap.clone()));

        match self.next_behavior(&handle.vm_id) {
            StartBehavior::Succeed => Ok(()),
            StartBehavior::Busy => Err(FlotillaError::DeviceBusy(format!(
                "Open tap device failed: Resource busy ({})",
                tap
            ))),
            StartBehavior::Fail(reason) => Err(FlotillaError::Start(reason)),
            StartBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(())
            }
        }
    }

    async fn wait(&self, handle: VmHandle) -> FlotillaResult<ExitInfo> {
        let mut exit_rx = self
            .instances
            .lock()
            .get(&handle.instance)
            .map(|i| i.exit_tx.subscribe())
            .ok_or_else(|| FlotillaError::InvalidState(format!("unknown VM {}", handle.vm_id)))?;

        let exit = exit_rx
            .wait_for(Option::is_some)
            .await
            .map(|exit| (*exit).unwrap_or_default())
            .map_err(|_| FlotillaError::Engine(format!("{} vanished", handle.vm_id)))?;

        Ok(exit)
    }

    async fn stop(&self, handle: &VmHandle) -> FlotillaResult<()> {
        self.stops.lock().push(handle.vm_id.clone());
        if let Some(instance) = self.instances.lock().get_mut(&handle.instance) {
            instance.stopped = true;
            instance.exit_tx.send_replace(Some(ExitInfo {
                code: None,
                signal: Some(9),
            }));
        }
        Ok(())
    }
}
