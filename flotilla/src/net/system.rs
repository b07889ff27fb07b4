//! `NetworkTools` backed by `ip`, `iptables`, sysfs and procfs.

use super::{NatRule, NetworkTools};
use async_trait::async_trait;
use flotilla_shared::errors::{FlotillaError, FlotillaResult};
use ipnet::Ipv4Net;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;

const IP_FORWARD: &str = "/proc/sys/net/ipv4/ip_forward";

pub struct SystemNetworkTools {
    ip_bin: PathBuf,
    iptables_bin: PathBuf,
    sysfs_net: PathBuf,
    proc_root: PathBuf,
}

impl Default for SystemNetworkTools {
    fn default() -> Self {
        Self {
            ip_bin: PathBuf::from("ip"),
            iptables_bin: PathBuf::from("iptables"),
            sysfs_net: PathBuf::from("/sys/class/net"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl SystemNetworkTools {
    pub fn new() -> Self {
        Self::default()
    }

    async fn exec(&self, program: &Path, args: &[&str]) -> FlotillaResult<Output> {
        tracing::trace!(program = %program.display(), ?args, "Running host network command");

        Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                FlotillaError::Network(format!("failed to execute {}: {}", program.display(), e))
            })
    }

    /// Run `ip` and fail unless it succeeds or its stderr contains one of `tolerated`.
    async fn ip(&self, args: &[&str], tolerated: &[&str]) -> FlotillaResult<()> {
        let output = self.exec(&self.ip_bin, args).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if tolerated.iter().any(|t| stderr.contains(t)) {
            tracing::debug!(?args, stderr = %stderr.trim(), "Tolerated ip failure");
            return Ok(());
        }

        Err(classify_failure(&format!("ip {}", args.join(" ")), &stderr))
    }

    fn iptables_args<'a>(action: &'a str, rule: &'a [String]) -> Vec<&'a str> {
        let mut args = vec!["-t", "nat", action, "POSTROUTING"];
        args.extend(rule.iter().map(String::as_str));
        args
    }
}

/// Map a failed command to an error, singling out missing privileges.
fn classify_failure(command: &str, stderr: &str) -> FlotillaError {
    let stderr = stderr.trim();
    let lower = stderr.to_lowercase();

    if lower.contains("operation not permitted")
        || lower.contains("permission denied")
        || lower.contains("you must be root")
    {
        FlotillaError::Privilege(format!("{}: {}", command, stderr))
    } else {
        FlotillaError::Network(format!("{} failed: {}", command, stderr))
    }
}

/// True when a `/proc/<pid>/fdinfo/<fd>` entry is a tun fd bound to `name`.
fn fdinfo_binds_device(fdinfo: &str, name: &str) -> bool {
    fdinfo.lines().any(|line| {
        line.strip_prefix("iff:")
            .map(|value| value.trim() == name)
            .unwrap_or(false)
    })
}

/// Walk `proc_root` for processes with a tun fd bound to `name`.
///
/// Processes that exit mid-scan or deny access are skipped.
fn scan_holders(proc_root: &Path, name: &str) -> Vec<u32> {
    let Ok(entries) = std::fs::read_dir(proc_root) else {
        return Vec::new();
    };

    let mut holders = Vec::new();
    for entry in entries.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };

        let Ok(fds) = std::fs::read_dir(entry.path().join("fdinfo")) else {
            continue;
        };

        let holds = fds.flatten().any(|fd| {
            std::fs::read_to_string(fd.path())
                .map(|info| fdinfo_binds_device(&info, name))
                .unwrap_or(false)
        });

        if holds {
            holders.push(pid);
        }
    }

    holders.sort_unstable();
    holders
}

#[async_trait]
impl NetworkTools for SystemNetworkTools {
    async fn link_exists(&self, name: &str) -> FlotillaResult<bool> {
        tokio::fs::try_exists(self.sysfs_net.join(name))
            .await
            .map_err(|e| FlotillaError::Network(format!("failed to query link {}: {}", name, e)))
    }

    async fn create_bridge(&self, name: &str) -> FlotillaResult<()> {
        self.ip(&["link", "add", "name", name, "type", "bridge"], &["File exists"])
            .await
    }

    async fn add_address(&self, dev: &str, addr: &Ipv4Net) -> FlotillaResult<()> {
        let cidr = addr.to_string();
        self.ip(
            &["addr", "add", &cidr, "dev", dev],
            &["File exists", "Address already assigned"],
        )
        .await
    }

    async fn set_link_up(&self, dev: &str) -> FlotillaResult<()> {
        self.ip(&["link", "set", "dev", dev, "up"], &[]).await
    }

    async fn create_tap(&self, name: &str) -> FlotillaResult<()> {
        self.ip(&["tuntap", "add", "dev", name, "mode", "tap"], &[])
            .await
    }

    async fn delete_link(&self, name: &str) -> FlotillaResult<()> {
        self.ip(&["link", "del", "dev", name], &["Cannot find device"])
            .await
    }

    async fn set_master(&self, dev: &str, bridge: &str) -> FlotillaResult<()> {
        self.ip(&["link", "set", "dev", dev, "master", bridge], &[])
            .await
    }

    async fn nat_rule_exists(&self, rule: &NatRule) -> FlotillaResult<bool> {
        let body = rule.rule_args();
        let args = Self::iptables_args("-C", &body);
        let output = self.exec(&self.iptables_bin, &args).await?;

        match output.status.code() {
            Some(0) => Ok(true),
            // -C exits 1 when the rule is absent
            Some(1) => Ok(false),
            _ => Err(classify_failure(
                &format!("iptables {}", args.join(" ")),
                &String::from_utf8_lossy(&output.stderr),
            )),
        }
    }

    async fn insert_nat_rule(&self, rule: &NatRule) -> FlotillaResult<()> {
        let body = rule.rule_args();
        let args = Self::iptables_args("-A", &body);
        let output = self.exec(&self.iptables_bin, &args).await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_failure(
                &format!("iptables {}", args.join(" ")),
                &String::from_utf8_lossy(&output.stderr),
            ))
        }
    }

    async fn device_holders(&self, name: &str) -> FlotillaResult<Vec<u32>> {
        let proc_root = self.proc_root.clone();
        let name = name.to_string();

        tokio::task::spawn_blocking(move || scan_holders(&proc_root, &name))
            .await
            .map_err(|e| FlotillaError::Internal(format!("holder scan task failed: {}", e)))
    }

    async fn enable_forwarding(&self) -> FlotillaResult<()> {
        match tokio::fs::read_to_string(IP_FORWARD).await {
            Ok(current) if current.trim() == "1" => return Ok(()),
            _ => {}
        }

        tokio::fs::write(IP_FORWARD, b"1").await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                FlotillaError::Privilege(format!("cannot enable IPv4 forwarding: {}", e))
            } else {
                FlotillaError::Network(format!("cannot enable IPv4 forwarding: {}", e))
            }
        })?;

        tracing::info!("Enabled IPv4 forwarding");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_classify_privilege() {
        let err = classify_failure("ip link add", "RTNETLINK answers: Operation not permitted\n");
        assert!(matches!(err, FlotillaError::Privilege(_)));

        let err = classify_failure(
            "iptables -C",
            "iptables v1.8.7 (nf_tables): Permission denied (you must be root)",
        );
        assert!(matches!(err, FlotillaError::Privilege(_)));
    }

    #[test]
    fn test_classify_other() {
        let err = classify_failure("ip link set", "Cannot find device \"fcbr0\"");
        assert!(matches!(err, FlotillaError::Network(_)));
        assert!(err.to_string().contains("Cannot find device"));
    }

    #[test]
    fn test_fdinfo_match() {
        let info = "pos:\t0\nflags:\t02004002\nmnt_id:\t15\nino:\t1046\niff:\tfctap0\n";
        assert!(fdinfo_binds_device(info, "fctap0"));
        assert!(!fdinfo_binds_device(info, "fctap01"));
        assert!(!fdinfo_binds_device("pos:\t0\n", "fctap0"));
    }

    #[test]
    fn test_scan_holders_fake_proc() {
        let temp = TempDir::new().unwrap();
        let root = temp.path();

        let write_fd = |pid: &str, fd: &str, content: &str| {
            let dir = root.join(pid).join("fdinfo");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join(fd), content).unwrap();
        };

        write_fd("42", "3", "pos:\t0\niff:\tfctap1\n");
        write_fd("42", "4", "pos:\t0\n");
        write_fd("77", "9", "pos:\t0\niff:\tfctap2\n");
        write_fd("self", "3", "pos:\t0\niff:\tfctap1\n");
        std::fs::create_dir_all(root.join("1000")).unwrap();

        assert_eq!(scan_holders(root, "fctap1"), vec![42]);
        assert_eq!(scan_holders(root, "fctap2"), vec![77]);
        assert!(scan_holders(root, "fctap3").is_empty());
    }

    #[test]
    fn test_scan_holders_missing_root() {
        assert!(scan_holders(Path::new("/nonexistent/proc"), "fctap0").is_empty());
    }

    #[tokio::test]
    async fn test_link_exists_uses_sysfs() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir(temp.path().join("fcbr0")).unwrap();
        let tools = SystemNetworkTools {
            sysfs_net: temp.path().to_path_buf(),
            ..SystemNetworkTools::default()
        };

        assert!(tools.link_exists("fcbr0").await.unwrap());
        assert!(!tools.link_exists("fctap9").await.unwrap());
    }
}
