#![allow(dead_code)]

use assert_cmd::Command;
use std::path::Path;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestContext {
    pub cmd: Command,
    pub home: TempDir,
}

impl TestContext {
    /// Another invocation against the same home directory.
    pub fn new_cmd(&self) -> Command {
        command_for(self.home.path())
    }

    /// Write a fleet file into the home directory and return its path.
    pub fn fleet_file(&self, name: &str, contents: &str) -> std::path::PathBuf {
        let path = self.home.path().join(name);
        std::fs::write(&path, contents).expect("write fleet file");
        path
    }
}

fn command_for(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_flotilla"));
    cmd.timeout(Duration::from_secs(30));
    cmd.env_remove("FLOTILLA_HOME");
    cmd.env_remove("RUST_LOG");
    cmd.arg("--home").arg(home);
    cmd
}

pub fn flotilla() -> TestContext {
    let home = tempfile::tempdir().expect("create test home");
    TestContext {
        cmd: command_for(home.path()),
        home,
    }
}
