use clap::Args;
use flotilla::preflight::{
    HostProbe, SystemProbe, check_privileges, check_virtualization_support,
};
use std::path::{Path, PathBuf};

#[derive(Args, Debug)]
pub struct CheckArgs {
    /// Firecracker binary to look for
    #[arg(long, default_value = "firecracker")]
    pub firecracker_bin: PathBuf,
}

pub fn execute(args: CheckArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let options = global.options();
    let probe = SystemProbe;
    let mut problems = Vec::new();

    match check_privileges() {
        Ok(()) => println!("ok    running as root"),
        Err(e) => {
            println!("FAIL  privileges: {}", first_line(&e.to_string()));
            problems.push("privileges");
        }
    }

    match check_virtualization_support() {
        Ok(support) => println!("ok    {}", support.reason),
        Err(e) => {
            println!("FAIL  virtualization: {}", first_line(&e.to_string()));
            problems.push("kvm");
        }
    }

    match find_binary(&args.firecracker_bin) {
        Some(path) => println!("ok    firecracker at {}", path.display()),
        None => {
            println!("FAIL  {} not found", args.firecracker_bin.display());
            problems.push("firecracker");
        }
    }

    match probe.available_memory_mib() {
        Ok(mib) => println!("info  {} MiB memory available", mib),
        Err(e) => println!("warn  {}", e),
    }

    match probe.free_disk_mib(&options.home_dir) {
        Ok(mib) => println!("info  {} MiB free under {}", mib, options.home_dir.display()),
        Err(e) => println!("warn  {}", e),
    }

    if !problems.is_empty() {
        anyhow::bail!("host is not ready: {}", problems.join(", "));
    }
    Ok(())
}

fn first_line(s: &str) -> &str {
    s.lines().next().unwrap_or(s)
}

/// Resolve `bin` the way a shell would: as a path if it has a separator,
/// else through `PATH`.
fn find_binary(bin: &Path) -> Option<PathBuf> {
    if bin.components().count() > 1 {
        return bin.is_file().then(|| bin.to_path_buf());
    }

    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(bin))
        .find(|candidate| candidate.is_file())
}
