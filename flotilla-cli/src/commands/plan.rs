use crate::cli::FleetArgs;
use clap::Args;
use comfy_table::{Table, presets};

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[command(flatten)]
    pub fleet: FleetArgs,

    /// Print the resolved VM specs as JSON
    #[arg(long)]
    pub json: bool,
}

pub fn execute(args: PlanArgs, _global: &crate::cli::GlobalFlags) -> anyhow::Result<()> {
    let config = args.fleet.resolve()?;
    let specs = config.vm_specs()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&specs)?);
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(presets::NOTHING);
    table.set_header(vec!["VM", "IP", "MAC", "TAP", "MEMORY", "VCPUS"]);

    for spec in &specs {
        table.add_row(vec![
            spec.vm_id.clone(),
            format!("{}/{}", spec.guest_ip, spec.prefix_len),
            spec.mac_address.clone(),
            spec.preferred_tap.clone(),
            format!("{} MiB", spec.memory_mib),
            spec.vcpus.to_string(),
        ]);
    }

    println!(
        "bridge {} ({}), storage {}, rootfs {}",
        config.network.bridge_name,
        config.network.bridge_cidr,
        config.storage,
        config.rootfs.display()
    );
    println!("{table}");
    Ok(())
}
