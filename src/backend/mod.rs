//! Backend handles: a libvirt connection or a Proxmox API client, behind
//! the narrow interface the state normalizer drives.

pub mod libvirt;
pub mod proxmox;

use crate::error::ForgeError;
use crate::spec::InstanceIdentity;

/// Opaque reference to whatever backend object a presence probe matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmRef {
    Libvirt { name: String },
    Proxmox { vmid: u32, node: String },
}

/// Result of a presence probe for one instance name.
#[derive(Debug, Clone, Default)]
pub struct PresenceResult {
    pub disk_volume_exists: bool,
    pub vm_defined: bool,
    pub vm_active: bool,
    pub vm_ref: Option<VmRef>,
}

impl PresenceResult {
    /// Anything at all standing in the way of a fresh create.
    pub fn any(&self) -> bool {
        self.disk_volume_exists || self.vm_defined
    }
}

#[allow(async_fn_in_trait)] // trait is internal-only
pub trait ProvisionBackend {
    /// Read-only presence probe; queried fresh per normalization pass.
    async fn probe(&self, identity: &InstanceIdentity) -> Result<PresenceResult, ForgeError>;

    async fn stop_vm(&self, vm: &VmRef) -> Result<(), ForgeError>;

    async fn delete_vm(&self, vm: &VmRef) -> Result<(), ForgeError>;

    /// Delete the instance's disk volume and per-VM data directory.
    /// Idempotent: missing storage is not an error.
    async fn delete_storage(&self, identity: &InstanceIdentity) -> Result<(), ForgeError>;
}

/// Either backend, selected by VM type at startup and held for the whole
/// run.
pub enum BackendHandle {
    Libvirt(libvirt::LibvirtHost),
    Proxmox(proxmox::ProxmoxClient),
}

impl BackendHandle {
    pub fn libvirt(&self) -> &libvirt::LibvirtHost {
        match self {
            BackendHandle::Libvirt(host) => host,
            BackendHandle::Proxmox(_) => unreachable!("libvirt variant on proxmox backend"),
        }
    }

    pub fn proxmox(&self) -> &proxmox::ProxmoxClient {
        match self {
            BackendHandle::Proxmox(client) => client,
            BackendHandle::Libvirt(_) => unreachable!("proxmox variant on libvirt backend"),
        }
    }
}

impl ProvisionBackend for BackendHandle {
    async fn probe(&self, identity: &InstanceIdentity) -> Result<PresenceResult, ForgeError> {
        match self {
            BackendHandle::Libvirt(host) => host.probe(identity).await,
            BackendHandle::Proxmox(client) => client.probe(identity).await,
        }
    }

    async fn stop_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        match self {
            BackendHandle::Libvirt(host) => host.stop_vm(vm).await,
            BackendHandle::Proxmox(client) => client.stop_vm(vm).await,
        }
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        match self {
            BackendHandle::Libvirt(host) => host.delete_vm(vm).await,
            BackendHandle::Proxmox(client) => client.delete_vm(vm).await,
        }
    }

    async fn delete_storage(&self, identity: &InstanceIdentity) -> Result<(), ForgeError> {
        match self {
            BackendHandle::Libvirt(host) => host.delete_storage(identity).await,
            BackendHandle::Proxmox(client) => client.delete_storage(identity).await,
        }
    }
}
