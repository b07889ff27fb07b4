use flotilla::{FleetConfig, FlotillaOptions};
use std::path::PathBuf;
use tempfile::TempDir;

/// Size of the fake golden image.
pub const GOLDEN_IMAGE_BYTES: usize = 256 * 1024;

/// Temporary home directory plus a golden image and kernel to launch from.
pub struct TestEnv {
    pub temp: TempDir,
    pub golden: PathBuf,
    pub kernel: PathBuf,
}

impl TestEnv {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("create temp dir");
        let golden = temp.path().join("golden.ext4");
        let kernel = temp.path().join("vmlinux.bin");

        std::fs::write(&golden, vec![0xab; GOLDEN_IMAGE_BYTES]).expect("write golden image");
        std::fs::write(&kernel, b"not really a kernel").expect("write kernel");

        Self {
            temp,
            golden,
            kernel,
        }
    }

    pub fn home(&self) -> PathBuf {
        self.temp.path().join("home")
    }

    pub fn options(&self) -> FlotillaOptions {
        FlotillaOptions {
            home_dir: self.home(),
        }
    }

    /// `count` default-sized VMs at 172.16.0.10 upward, booting the fixtures.
    pub fn config(&self, count: usize) -> FleetConfig {
        let mut config = FleetConfig::default()
            .with_vm_count(count)
            .expect("vm count fits the default subnet");
        config.kernel = self.kernel.clone();
        config.rootfs = self.golden.clone();
        config
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
