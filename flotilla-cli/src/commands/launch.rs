use crate::cli::FleetArgs;
use anyhow::Context;
use clap::Args;
use flotilla::preflight::{check_privileges, check_virtualization_support};
use flotilla::{FilesystemLayout, FleetController, RuntimeLock, init_logging_for};

#[derive(Args, Debug)]
pub struct LaunchArgs {
    #[command(flatten)]
    pub fleet: FleetArgs,

    /// Exit after the launch pass instead of staying resident
    #[arg(long)]
    pub no_wait: bool,
}

pub async fn execute(args: LaunchArgs, global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let config = args.fleet.resolve()?;

    check_privileges()?;
    let kvm = check_virtualization_support()?;

    let options = global.options();
    let _lock = RuntimeLock::acquire(&options.home_dir)?;

    let layout = FilesystemLayout::new(options.home_dir.clone());
    init_logging_for(&layout, global.verbose)?;
    tracing::info!(home = %options.home_dir.display(), kvm = %kvm.reason, "Starting flotilla");

    let controller = FleetController::builder(config)
        .options(options)
        .build()
        .context("failed to initialize fleet controller")?;

    let outcome = controller.launch().await?;
    print!("{}", outcome.summary());

    match after_pass(outcome.running_count(), args.no_wait) {
        AfterPass::Abort => anyhow::bail!("no VM started"),
        AfterPass::Exit => return Ok(()),
        AfterPass::StayResident => {}
    }

    println!("Fleet is up. Press Ctrl-C to exit.");
    stay_resident(shutdown_signal()).await?;

    let metrics = controller.metrics();
    tracing::info!(
        started = metrics.vms_started_total(),
        exited = metrics.vms_exited_total(),
        "Shutting down"
    );
    Ok(())
}

/// What `launch` does once the fleet pass is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AfterPass {
    /// Nothing is running; exit non-zero.
    Abort,
    /// `--no-wait`: leave the VMs to themselves.
    Exit,
    /// Keep supervising until shutdown is requested.
    StayResident,
}

fn after_pass(running: usize, no_wait: bool) -> AfterPass {
    if running == 0 {
        AfterPass::Abort
    } else if no_wait {
        AfterPass::Exit
    } else {
        AfterPass::StayResident
    }
}

/// Park the process until `shutdown` resolves. Exit waiters keep running
/// on the runtime meanwhile.
async fn stay_resident<F>(shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = anyhow::Result<()>>,
{
    tracing::info!("Fleet launched, waiting for shutdown signal");
    shutdown.await?;
    tracing::info!("Shutdown requested");
    Ok(())
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for Ctrl-C")?,
        _ = terminate.recv() => {}
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_partial_fleet_stays_resident() {
        assert_eq!(after_pass(2, false), AfterPass::StayResident);
        assert_eq!(after_pass(1, false), AfterPass::StayResident);
    }

    #[test]
    fn test_no_running_vm_aborts() {
        assert_eq!(after_pass(0, false), AfterPass::Abort);
        assert_eq!(after_pass(0, true), AfterPass::Abort);
    }

    #[test]
    fn test_no_wait_exits_after_pass() {
        assert_eq!(after_pass(3, true), AfterPass::Exit);
    }

    #[tokio::test]
    async fn test_resident_until_shutdown() {
        let (tx, rx) = oneshot::channel::<()>();
        let resident = tokio::spawn(stay_resident(async move {
            rx.await.context("shutdown sender dropped")
        }));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!resident.is_finished(), "returned before shutdown was requested");

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), resident)
            .await
            .expect("returns after shutdown")
            .unwrap();
        assert!(result.is_ok());
    }
}
