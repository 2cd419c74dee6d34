//! The cluster loop: strictly sequential, one index fully provisioned
//! before the next starts. A failure at index k aborts the run without
//! touching indices 0..k — partial cluster creation is an accepted
//! outcome, never rolled back.

use crate::backend::{BackendHandle, libvirt::LibvirtHost, proxmox};
use crate::error::ForgeError;
use crate::normalize::{self, NormalizeOutcome};
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::variant::{self, ProvisionCtx};

pub async fn run_create(spec: &ClusterSpec) -> Result<(), ForgeError> {
    let backend = connect_backend(spec).await?;

    // The pool path is discovered once and reused for every index.
    let pool_path = match backend {
        BackendHandle::Libvirt(ref host) => Some(host.pool_path()?.to_path_buf()),
        BackendHandle::Proxmox(_) => None,
    };
    let ctx = ProvisionCtx {
        spec,
        backend: &backend,
        pool_path,
    };

    for index in 0..spec.cluster_size {
        let identity = InstanceIdentity::new(spec, index);
        let plan = NetworkPlan::for_index(spec, index)?;
        tracing::info!(
            vm = %identity.fqdn,
            index,
            cluster_size = spec.cluster_size,
            "starting VM build"
        );

        let outcome =
            normalize::normalize(&backend, &identity, spec.delete_if_exists, spec.dry_run).await?;
        if outcome == NormalizeOutcome::Aborted {
            return Err(ForgeError::ResourceConflict {
                name: identity.fqdn.clone(),
                host: spec.vm_host.clone(),
            });
        }

        variant::prepare(&ctx, &identity, &plan).await?;
        let composed = variant::compose(&ctx, &identity, &plan).await?;
        variant::install(&ctx, &identity, composed).await?;

        tracing::info!(vm = %identity.fqdn, "VM creation complete");
    }

    Ok(())
}

async fn connect_backend(spec: &ClusterSpec) -> Result<BackendHandle, ForgeError> {
    if spec.vm_type.uses_libvirt() {
        let host = LibvirtHost::connect(&spec.libvirt_uri(), spec.disk_pool.clone())?;
        Ok(BackendHandle::Libvirt(host))
    } else {
        let cluster = spec.proxmox.cluster.as_deref().expect("validated at startup");
        let auth = proxmox::load_auth(spec.proxmox.auth_config.as_deref(), cluster)?;
        let client = proxmox::ProxmoxClient::connect(
            &spec.vm_host,
            &auth,
            spec.proxmox.insecure_tls,
            spec.timeout_secs,
        )
        .await?;
        Ok(BackendHandle::Proxmox(client))
    }
}
