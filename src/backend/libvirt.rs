//! Libvirt-backed queries and teardown for VMs and pool volumes.

use std::cell::OnceCell;
use std::path::{Path, PathBuf};

use virt::connect::Connect;
use virt::domain::Domain;
use virt::storage_pool::StoragePool;
use virt::storage_vol::StorageVol;

use crate::error::ForgeError;
use crate::spec::InstanceIdentity;

use super::{PresenceResult, ProvisionBackend, VmRef};

struct ConnGuard(Connect);

impl std::ops::Deref for ConnGuard {
    type Target = Connect;
    fn deref(&self) -> &Connect {
        &self.0
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        self.0.close().ok();
    }
}

pub struct LibvirtHost {
    conn: ConnGuard,
    pool_name: Option<String>,
    // Discovered once per run from the pool XML, then reused.
    pool_path: OnceCell<PathBuf>,
}

impl LibvirtHost {
    /// Open a connection to the VM host. Failure here aborts the run.
    pub fn connect(uri: &str, pool_name: Option<String>) -> Result<Self, ForgeError> {
        virt::error::clear_error_callback();
        let conn = Connect::open(Some(uri)).map_err(|e| ForgeError::Backend {
            message: format!("cannot open libvirt connection to {uri}: {e}"),
        })?;
        tracing::debug!(uri, "opened libvirt connection");
        Ok(LibvirtHost {
            conn: ConnGuard(conn),
            pool_name,
            pool_path: OnceCell::new(),
        })
    }

    /// All storage pools on the host, defined and active alike.
    pub fn list_disk_pools(&self) -> Result<Vec<String>, ForgeError> {
        let mut pools = self
            .conn
            .list_storage_pools()
            .map_err(|e| ForgeError::Libvirt {
                message: format!("listing storage pools: {e}"),
                hint: "check libvirt permissions".into(),
            })?;
        let defined =
            self.conn
                .list_defined_storage_pools()
                .map_err(|e| ForgeError::Libvirt {
                    message: format!("listing defined storage pools: {e}"),
                    hint: "check libvirt permissions".into(),
                })?;
        pools.extend(defined);
        pools.sort();
        Ok(pools)
    }

    /// Host network interfaces viable for bridging.
    pub fn list_interfaces(&self) -> Result<Vec<String>, ForgeError> {
        self.conn.list_interfaces().map_err(|e| ForgeError::Libvirt {
            message: format!("listing network interfaces: {e}"),
            hint: "check libvirt permissions".into(),
        })
    }

    /// Volume names in a pool.
    pub fn list_pool_volumes(&self, pool_name: &str) -> Result<Vec<String>, ForgeError> {
        let pool = self.lookup_pool(pool_name)?;
        let vols = pool.list_all_volumes(0).map_err(|e| ForgeError::Libvirt {
            message: format!("listing volumes in pool {pool_name}: {e}"),
            hint: "check that the pool is active".into(),
        })?;
        let mut names = Vec::with_capacity(vols.len());
        for vol in vols {
            names.push(vol.get_name().map_err(|e| ForgeError::Libvirt {
                message: format!("reading volume name: {e}"),
                hint: "check that the pool is active".into(),
            })?);
        }
        Ok(names)
    }

    /// The pool's filesystem path, discovered lazily from the pool XML and
    /// cached for the rest of the run.
    pub fn pool_path(&self) -> Result<&Path, ForgeError> {
        if let Some(path) = self.pool_path.get() {
            tracing::debug!(path = %path.display(), "returning cached pool path");
            return Ok(path);
        }
        let pool_name = self.require_pool_name()?;
        let pool = self.lookup_pool(pool_name)?;
        let xml = pool.get_xml_desc(0).map_err(|e| ForgeError::Libvirt {
            message: format!("reading XML for pool {pool_name}: {e}"),
            hint: "check that the pool is defined".into(),
        })?;
        let path = extract_tag(&xml, "path").ok_or_else(|| ForgeError::Libvirt {
            message: format!("pool {pool_name} has no <path> in its XML"),
            hint: "only directory-backed pools are supported".into(),
        })?;
        Ok(self.pool_path.get_or_init(|| PathBuf::from(path)))
    }

    fn require_pool_name(&self) -> Result<&str, ForgeError> {
        self.pool_name.as_deref().ok_or_else(|| ForgeError::Config {
            message: "no disk pool configured".into(),
        })
    }

    fn lookup_pool(&self, pool_name: &str) -> Result<StoragePool, ForgeError> {
        StoragePool::lookup_by_name(&self.conn, pool_name).map_err(|e| ForgeError::Libvirt {
            message: format!("storage pool '{pool_name}' not found: {e}"),
            hint: "see list-disk-pools for available pools".into(),
        })
    }
}

impl ProvisionBackend for LibvirtHost {
    async fn probe(&self, identity: &InstanceIdentity) -> Result<PresenceResult, ForgeError> {
        let pool_name = self.require_pool_name()?;
        let volumes = self.list_pool_volumes(pool_name)?;
        let disk_volume_exists = volumes.contains(&identity.disk_image_name);

        let domain = Domain::lookup_by_name(&self.conn, &identity.fqdn).ok();
        let vm_defined = domain.is_some();
        let vm_active = domain
            .as_ref()
            .is_some_and(|d| d.is_active().unwrap_or(false));

        Ok(PresenceResult {
            disk_volume_exists,
            vm_defined,
            vm_active,
            vm_ref: vm_defined.then(|| VmRef::Libvirt {
                name: identity.fqdn.clone(),
            }),
        })
    }

    async fn stop_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        let VmRef::Libvirt { name } = vm else {
            unreachable!("proxmox ref on libvirt backend");
        };
        let dom = Domain::lookup_by_name(&self.conn, name).map_err(|e| ForgeError::Libvirt {
            message: format!("domain {name} disappeared: {e}"),
            hint: "re-run against a clean environment".into(),
        })?;
        dom.destroy().map_err(|e| ForgeError::Libvirt {
            message: format!("failed to stop {name}: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        tracing::info!(name = %name, "stopped VM");
        Ok(())
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        let VmRef::Libvirt { name } = vm else {
            unreachable!("proxmox ref on libvirt backend");
        };
        let dom = Domain::lookup_by_name(&self.conn, name).map_err(|e| ForgeError::Libvirt {
            message: format!("domain {name} disappeared: {e}"),
            hint: "re-run against a clean environment".into(),
        })?;
        dom.undefine().map_err(|e| ForgeError::Libvirt {
            message: format!("failed to undefine {name}: {e}"),
            hint: "check libvirt permissions".into(),
        })?;
        tracing::info!(name = %name, "undefined VM");
        Ok(())
    }

    async fn delete_storage(&self, identity: &InstanceIdentity) -> Result<(), ForgeError> {
        let pool_name = self.require_pool_name()?;
        let pool = self.lookup_pool(pool_name)?;

        if let Ok(vol) = StorageVol::lookup_by_name(&pool, &identity.disk_image_name) {
            vol.delete(0).map_err(|e| ForgeError::Libvirt {
                message: format!("failed to delete volume {}: {e}", identity.disk_image_name),
                hint: "check libvirt permissions".into(),
            })?;
            tracing::info!(volume = %identity.disk_image_name, "deleted disk volume");
        }

        // Per-VM data directory (cloud-init inputs, seed images) under the
        // pool path.
        let vm_dir = self.pool_path()?.join(&identity.fqdn);
        if vm_dir.exists() {
            tokio::fs::remove_dir_all(&vm_dir)
                .await
                .map_err(|e| ForgeError::Io {
                    context: format!("removing {}", vm_dir.display()),
                    source: e,
                })?;
            tracing::info!(path = %vm_dir.display(), "removed VM data directory");
        }

        Ok(())
    }
}

/// Pull the text of the first `<tag>…</tag>` out of an XML document. Pool
/// XML is small and regular enough that string scanning beats a parser
/// dependency.
fn extract_tag<'a>(xml: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(xml[start..end].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extract_tag_finds_pool_path() {
        let xml = r#"<pool type='dir'>
  <name>vms</name>
  <target>
    <path>/var/lib/libvirt/images</path>
  </target>
</pool>"#;
        assert_eq!(extract_tag(xml, "path"), Some("/var/lib/libvirt/images"));
        assert_eq!(extract_tag(xml, "name"), Some("vms"));
    }

    #[test]
    fn extract_tag_missing_returns_none() {
        assert_eq!(extract_tag("<pool></pool>", "path"), None);
    }
}
