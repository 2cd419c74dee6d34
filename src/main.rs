use clap::Parser;
use console::style;
use tracing_subscriber::EnvFilter;

use vmforge::backend::libvirt::LibvirtHost;
use vmforge::cli::{Cli, Command};
use vmforge::orchestrator;
use vmforge::spec::ClusterSpec;

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.debug {
        EnvFilter::new("vmforge=debug")
    } else {
        EnvFilter::from_default_env().add_directive("vmforge=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    match cli.command {
        Command::CreateVm(args) => {
            let spec = ClusterSpec::from_args(args, cli.debug)?;
            if spec.dry_run {
                eprintln!(
                    "{}",
                    style("Dry run: no VM, disk or backend object will be touched.").yellow()
                );
            }
            orchestrator::run_create(&spec).await?;
        }
        Command::ListDiskPools { host } => {
            let conn = LibvirtHost::connect(&uri_for(&host.vm_host), None)?;
            println!("{}", style(format!("Disk pools on {}:", host.vm_host)).bold());
            for pool in conn.list_disk_pools()? {
                println!("  {pool}");
            }
        }
        Command::ListNetworkInterfaces { host } => {
            let conn = LibvirtHost::connect(&uri_for(&host.vm_host), None)?;
            println!(
                "{}",
                style(format!("Network interfaces on {}:", host.vm_host)).bold()
            );
            for iface in conn.list_interfaces()? {
                println!("  {iface}");
            }
        }
        Command::ListPoolVolumes { host, disk_pool } => {
            let conn = LibvirtHost::connect(&uri_for(&host.vm_host), Some(disk_pool.clone()))?;
            println!(
                "{}",
                style(format!("Volumes in pool {disk_pool} on {}:", host.vm_host)).bold()
            );
            for volume in conn.list_pool_volumes(&disk_pool)? {
                println!("  {volume}");
            }
        }
    }

    Ok(())
}

fn uri_for(vm_host: &str) -> String {
    if vm_host == "localhost" {
        "qemu:///system".to_string()
    } else {
        format!("qemu+ssh://{vm_host}/system")
    }
}
