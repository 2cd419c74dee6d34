//! Clone-from-template installs on Proxmox. This variant never composes
//! installer flags: its output is the clone, resize and config payloads
//! sent to the cluster API.

use std::net::IpAddr;

use crate::backend::proxmox::{CloneOptions, ResizeOptions, VmConfigOptions};
use crate::error::ForgeError;
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::sshkeys;

use super::ProvisionCtx;

/// Everything a Proxmox install needs, resolved before the first mutating
/// RPC. `clone.newid` is filled in at install time.
#[derive(Debug, Clone)]
pub struct ClonePlan {
    pub node: String,
    pub template_vmid: u32,
    pub clone: CloneOptions,
    pub resize: ResizeOptions,
    pub config: VmConfigOptions,
}

pub async fn compose(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> Result<ClonePlan, ForgeError> {
    let spec = ctx.spec;
    let client = ctx.backend.proxmox();

    let template = spec
        .proxmox
        .template
        .as_deref()
        .expect("validated at startup");
    // Resolved from the cached guest index; a missing template fails here,
    // before any clone RPC.
    let template_vmid = client.template_vmid(template)?;

    let sshkeys = match spec.proxmox.sshkeys {
        Some(ref source) => {
            let keys = sshkeys::load_keys(source).await?;
            tracing::debug!(source = %source, "loaded SSH keys for cloned guest");
            Some(urlencoding::encode(&keys).into_owned())
        }
        None => None,
    };

    Ok(build_plan(
        spec,
        identity,
        plan,
        client.node(),
        template_vmid,
        sshkeys,
    ))
}

fn build_plan(
    spec: &ClusterSpec,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
    node: &str,
    template_vmid: u32,
    sshkeys: Option<String>,
) -> ClonePlan {
    ClonePlan {
        node: node.to_string(),
        template_vmid,
        clone: CloneOptions {
            name: identity.fqdn.clone(),
            newid: 0,
            full: 1,
            format: "raw".to_string(),
            storage: spec.proxmox.storage.clone().unwrap_or_default(),
        },
        resize: ResizeOptions {
            disk: "scsi0".to_string(),
            size: format!("{}G", spec.disk_size_gb),
        },
        config: VmConfigOptions {
            agent: "enabled=true,fstrim_cloned_disks=true".to_string(),
            ciuser: "ubuntu".to_string(),
            ipconfig0: ipconfig(plan),
            memory: spec.memory_mb,
            net0: net0(spec),
            onboot: 1,
            ostype: "l26".to_string(),
            sockets: spec.cpus,
            tags: "clone".to_string(),
            nameserver: (!plan.nameservers.is_empty()).then(|| plan.nameservers.join(" ")),
            sshkeys,
        },
    }
}

/// The cloud-init `ipconfig0` string for the instance.
fn ipconfig(plan: &NetworkPlan) -> String {
    let Some(address) = plan.address else {
        return "ip=dhcp,ip6=auto".to_string();
    };
    let prefix = plan.prefix_len.expect("static plan has a prefix length");
    let gateway = plan.gateway.as_deref().unwrap_or_default();
    match address {
        IpAddr::V4(ip) => format!("ip={ip}/{prefix},gw={gateway}"),
        IpAddr::V6(ip) => format!("ip6={ip}/{prefix},gw6={gateway}"),
    }
}

fn net0(spec: &ClusterSpec) -> String {
    let bridge = spec.bridge_interface.as_deref().unwrap_or_default();
    match spec.mac_address {
        Some(ref mac) => format!("virtio={mac},bridge={bridge}"),
        None => format!("virtio,bridge={bridge}"),
    }
}

/// clone → wait → resize → reconfigure → start, each step dry-run aware.
pub async fn install(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    mut plan: ClonePlan,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let client = ctx.backend.proxmox();

    if spec.dry_run {
        tracing::info!("DRY RUN: would have retrieved the next free vmid");
        tracing::info!(
            template_vmid = plan.template_vmid,
            options = ?plan.clone,
            "DRY RUN: would have cloned the template"
        );
        tracing::info!(options = ?plan.resize, "DRY RUN: would have resized the disk");
        tracing::info!(options = ?plan.config, "DRY RUN: would have set the VM options");
        tracing::info!(vm = %identity.fqdn, "DRY RUN: would have started the VM");
        return Ok(());
    }

    let newid = client.next_id().await?;
    plan.clone.newid = newid;
    tracing::info!(
        vm = %identity.fqdn,
        vmid = newid,
        node = %plan.node,
        "beginning VM installation"
    );

    let upid = client.clone_vm(plan.template_vmid, &plan.clone).await?;
    client.wait_for_task(&plan.node, &upid).await?;

    client.resize_disk(newid, &plan.resize).await?;
    client.update_config(newid, &plan.config).await?;
    client.start_vm(newid).await?;

    tracing::info!(vm = %identity.fqdn, vmid = newid, "completed install");
    Ok(())
}
