//! VM-type variants and the shared virt-install plumbing.
//!
//! Each variant supplies a disk-preparation step and a `compose` that
//! yields either a virt-install plan or, for Proxmox, a clone plan —
//! the two are different shapes on purpose and stay different types.

pub mod coreos;
pub mod debian;
pub mod proxmox_clone;
pub mod ubuntu_cloud;

use std::path::{Path, PathBuf};

use crate::backend::BackendHandle;
use crate::cli::VmType;
use crate::error::ForgeError;
use crate::flags::{InstallFlagSet, PostInstall, VirtInstallPlan};
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::tools;

/// Dependency-injected handles shared by every iteration of the cluster
/// loop.
pub struct ProvisionCtx<'a> {
    pub spec: &'a ClusterSpec,
    pub backend: &'a BackendHandle,
    /// Filesystem path of the disk pool, resolved once per run for the
    /// libvirt variants.
    pub pool_path: Option<PathBuf>,
}

impl ProvisionCtx<'_> {
    pub fn pool_path(&self) -> Result<&Path, ForgeError> {
        self.pool_path.as_deref().ok_or_else(|| ForgeError::Config {
            message: "no disk pool path resolved for this run".into(),
        })
    }
}

/// What `compose` hands the installer step. The Proxmox variant does not
/// produce installer flags at all.
pub enum ComposedInstall {
    VirtInstall(VirtInstallPlan),
    ProxmoxClone(proxmox_clone::ClonePlan),
}

/// Per-variant disk image and config preparation.
pub async fn prepare(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> Result<(), ForgeError> {
    match ctx.spec.vm_type {
        VmType::Debian | VmType::Ubuntu => debian::prepare(ctx, identity).await,
        VmType::UbuntuCloud => ubuntu_cloud::prepare(ctx, identity, plan).await,
        VmType::Coreos => coreos::prepare(ctx, identity, plan).await,
        // The clone brings its own disk.
        VmType::ProxmoxClone => Ok(()),
    }
}

pub async fn compose(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> Result<ComposedInstall, ForgeError> {
    match ctx.spec.vm_type {
        VmType::Debian | VmType::Ubuntu => Ok(ComposedInstall::VirtInstall(debian::compose(
            ctx.spec, identity, plan,
        ))),
        VmType::UbuntuCloud => Ok(ComposedInstall::VirtInstall(ubuntu_cloud::compose(
            ctx.spec,
            identity,
            ctx.pool_path()?,
        ))),
        VmType::Coreos => Ok(ComposedInstall::VirtInstall(coreos::compose(
            ctx.spec,
            identity,
            ctx.pool_path()?,
        ))),
        VmType::ProxmoxClone => Ok(ComposedInstall::ProxmoxClone(
            proxmox_clone::compose(ctx, identity, plan).await?,
        )),
    }
}

/// Execute a composed install against the backend.
pub async fn install(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    composed: ComposedInstall,
) -> Result<(), ForgeError> {
    match composed {
        ComposedInstall::VirtInstall(plan) => run_virt_install(ctx, identity, plan).await,
        ComposedInstall::ProxmoxClone(plan) => proxmox_clone::install(ctx, identity, plan).await,
    }
}

async fn run_virt_install(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: VirtInstallPlan,
) -> Result<(), ForgeError> {
    let mut args = plan.base_args.clone();
    args.extend(plan.flags.to_args());
    tracing::debug!(command_line = %args.join(" "), "virt-install");

    if ctx.spec.dry_run {
        tracing::info!(vm = %identity.fqdn, "DRY RUN: VM not actually created, skipping virt-install");
        return Ok(());
    }

    match plan.capture_xml_to {
        Some(ref xml_path) => {
            let xml = tools::run_checked("virt-install", &args).await?;
            tokio::fs::write(xml_path, &xml)
                .await
                .map_err(|e| ForgeError::Io {
                    context: format!("writing domain XML to {}", xml_path.display()),
                    source: e,
                })?;
            tracing::info!(path = %xml_path.display(), "captured domain XML");
        }
        None => {
            tools::run_checked("virt-install", &args).await?;
        }
    }

    if let Some(post) = plan.post {
        match post {
            PostInstall::DefineWithIgnition {
                xml_path,
                ignition_path,
                vm_name,
            } => {
                coreos::define_with_ignition(ctx, &xml_path, &ignition_path, &vm_name).await?;
            }
        }
    }

    Ok(())
}

/// Flags every virt-install variant shares, in their canonical order:
/// connect, disk, name, network, os-type, ram, vcpus.
pub(crate) fn common_flags(spec: &ClusterSpec, identity: &InstanceIdentity) -> InstallFlagSet {
    let mut flags = InstallFlagSet::new();
    flags.set("connect", spec.libvirt_uri());
    flags.push(
        "disk",
        format!(
            "vol={}/{},cache=none",
            spec.pool_name(),
            identity.disk_image_name
        ),
    );
    flags.set("name", identity.fqdn.as_str());

    let mut network = format!(
        "bridge={},model=virtio",
        spec.bridge_interface.as_deref().unwrap_or_default()
    );
    if let Some(ref mac) = spec.mac_address {
        network.push_str(&format!(",mac={mac}"));
    }
    flags.set("network", network);

    flags.set("os-type", "linux");
    flags.set("ram", spec.memory_mb.to_string());
    flags.set("vcpus", spec.cpus.to_string());
    if spec.use_uefi {
        flags.set("boot", "uefi");
    }
    flags
}

/// Positional switches ahead of the flag set.
pub(crate) fn base_args(spec: &ClusterSpec) -> Vec<String> {
    let mut args: Vec<String> = ["--autostart", "--nographics", "--console", "pty,target_type=serial"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if spec.debug {
        args.push("--debug".to_string());
    }
    if spec.cluster_size > 1 {
        tracing::info!("creating more than one instance, not connecting to a console");
        args.push("--noautoconsole".to_string());
    }
    args
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::spec::ClusterSpec;
    use clap::Parser;

    /// Build a validated spec from CLI-shaped arguments.
    pub fn spec_from(extra: &[&str]) -> ClusterSpec {
        let mut argv = vec![
            "vmforge",
            "create-vm",
            "--host-name",
            "db",
            "--domain-name",
            "example.net",
            "--bridge-interface",
            "br0",
        ];
        argv.extend_from_slice(extra);
        let cli = crate::cli::Cli::try_parse_from(argv).unwrap();
        let args = match cli.command {
            crate::cli::Command::CreateVm(args) => args,
            _ => unreachable!(),
        };
        ClusterSpec::from_args(args, false).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::spec_from;
    use super::*;

    #[test]
    fn common_flags_in_canonical_order() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let args = common_flags(&spec, &identity).to_args();
        let flag_positions: Vec<&str> = args
            .iter()
            .filter(|a| a.starts_with("--"))
            .map(String::as_str)
            .collect();
        assert_eq!(
            flag_positions,
            vec!["--connect", "--disk", "--name", "--network", "--os-type", "--ram", "--vcpus"]
        );
    }

    #[test]
    fn mac_address_is_appended_to_network() {
        let spec = spec_from(&[
            "--vm-type",
            "debian",
            "--disk-pool",
            "vms",
            "--mac-address",
            "52:54:00:ab:cd:ef",
        ]);
        let identity = InstanceIdentity::new(&spec, 0);
        let flags = common_flags(&spec, &identity);
        assert_eq!(
            flags.get("network").unwrap(),
            &["bridge=br0,model=virtio,mac=52:54:00:ab:cd:ef".to_string()]
        );
    }

    #[test]
    fn uefi_adds_boot_flag() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms", "--use-uefi"]);
        let identity = InstanceIdentity::new(&spec, 0);
        assert_eq!(
            common_flags(&spec, &identity).get("boot").unwrap(),
            &["uefi".to_string()]
        );
    }

    #[test]
    fn clusters_skip_the_console() {
        let single = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        assert!(!base_args(&single).contains(&"--noautoconsole".to_string()));

        let cluster = spec_from(&[
            "--vm-type",
            "debian",
            "--disk-pool",
            "vms",
            "--cluster-size",
            "3",
        ]);
        assert!(base_args(&cluster).contains(&"--noautoconsole".to_string()));
    }

    #[test]
    fn remote_host_uses_ssh_uri() {
        let spec = spec_from(&[
            "--vm-type",
            "debian",
            "--disk-pool",
            "vms",
            "--vm-host",
            "kvm1.example.net",
        ]);
        let identity = InstanceIdentity::new(&spec, 0);
        let flags = common_flags(&spec, &identity);
        assert_eq!(
            flags.get("connect").unwrap(),
            &["qemu+ssh://kvm1.example.net/system".to_string()]
        );
    }
}
