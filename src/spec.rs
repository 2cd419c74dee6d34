//! The validated per-run configuration and the values derived from it for
//! each cluster index.

use std::net::IpAddr;
use std::path::PathBuf;

use crate::address;
use crate::cli::{CreateVmArgs, VmType};
use crate::error::ForgeError;

/// Immutable per-run configuration, shared by reference across every
/// per-index derived structure.
#[derive(Debug, Clone)]
pub struct ClusterSpec {
    pub vm_type: VmType,
    pub host_name: String,
    pub domain_name: String,
    pub cluster_size: u32,
    pub cpus: u32,
    pub memory_mb: u32,
    pub disk_size_gb: u32,
    pub bridge_interface: Option<String>,
    pub vm_host: String,
    pub disk_pool: Option<String>,
    pub network: Option<StaticNetwork>,
    pub nameservers: Vec<String>,
    pub mac_address: Option<String>,
    pub delete_if_exists: bool,
    pub dry_run: bool,
    pub debug: bool,
    pub timeout_secs: u64,
    pub use_uefi: bool,
    pub debian: DebianSettings,
    pub coreos: CoreosSettings,
    pub proxmox: ProxmoxSettings,
}

/// All-or-nothing static addressing block.
#[derive(Debug, Clone)]
pub struct StaticNetwork {
    pub ip_address: IpAddr,
    pub netmask: String,
    pub gateway: String,
}

#[derive(Debug, Clone)]
pub struct DebianSettings {
    pub mirror: String,
    pub debian_release: String,
    pub ubuntu_release: String,
    pub preseed_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CoreosSettings {
    pub channel: String,
    pub image_age_days: u64,
    pub ct_version: String,
    pub cloud_config_template: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ProxmoxSettings {
    pub template: Option<String>,
    pub storage: Option<String>,
    pub auth_config: Option<PathBuf>,
    pub cluster: Option<String>,
    pub sshkeys: Option<String>,
    pub insecure_tls: bool,
}

impl ClusterSpec {
    /// Validate CLI arguments into a spec. Every configuration error is
    /// caught here, before any backend connection is attempted.
    pub fn from_args(args: CreateVmArgs, debug: bool) -> Result<Self, ForgeError> {
        if args.cluster_size == 0 {
            return Err(ForgeError::Config {
                message: "--cluster-size must be at least 1".into(),
            });
        }

        let network = validate_static_network(&args)?;

        if let Some(ref mac) = args.mac_address {
            if !address::valid_mac(mac) {
                return Err(ForgeError::Config {
                    message: format!("'{mac}' is not a valid MAC address"),
                });
            }
        }

        let spec = ClusterSpec {
            vm_type: args.vm_type,
            host_name: args.host_name,
            domain_name: args.domain_name,
            cluster_size: args.cluster_size,
            cpus: args.cpus,
            memory_mb: args.memory,
            disk_size_gb: args.disk_size_gb,
            bridge_interface: args.bridge_interface,
            vm_host: args.vm_host,
            disk_pool: args.disk_pool,
            network,
            nameservers: args.nameservers,
            mac_address: args.mac_address,
            delete_if_exists: args.delete_if_exists,
            dry_run: args.dry_run,
            debug,
            timeout_secs: args.timeout_secs,
            use_uefi: args.use_uefi,
            debian: DebianSettings {
                mirror: args.dist_mirror,
                debian_release: args.debian_release,
                ubuntu_release: args.ubuntu_release,
                preseed_url: args.preseed_url,
            },
            coreos: CoreosSettings {
                channel: args.coreos_channel,
                image_age_days: args.coreos_image_age,
                ct_version: args.coreos_ct_version,
                cloud_config_template: args.coreos_cloud_config_template,
            },
            proxmox: ProxmoxSettings {
                template: args.proxmox_template,
                storage: args.proxmox_storage,
                auth_config: args.auth_config,
                cluster: args.cluster,
                sshkeys: args.proxmox_sshkeys,
                insecure_tls: args.insecure_tls,
            },
        };

        spec.check_required_args()?;
        Ok(spec)
    }

    /// The libvirt connection URI for the target host.
    pub fn libvirt_uri(&self) -> String {
        if self.vm_host == "localhost" {
            "qemu:///system".to_string()
        } else {
            format!("qemu+ssh://{}/system", self.vm_host)
        }
    }

    /// Pool name, required for all libvirt variants.
    pub fn pool_name(&self) -> &str {
        self.disk_pool.as_deref().unwrap_or_default()
    }

    fn check_required_args(&self) -> Result<(), ForgeError> {
        let mut missing = Vec::new();

        if self.bridge_interface.is_none() {
            missing.push("--bridge-interface");
        }
        if self.vm_type.uses_libvirt() {
            if self.disk_pool.is_none() {
                missing.push("--disk-pool");
            }
        } else {
            if self.proxmox.template.is_none() {
                missing.push("--proxmox-template");
            }
            if self.proxmox.storage.is_none() {
                missing.push("--proxmox-storage");
            }
            if self.proxmox.cluster.is_none() {
                missing.push("--cluster");
            }
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ForgeError::Config {
                message: format!("missing required arguments: {}", missing.join(", ")),
            })
        }
    }
}

fn validate_static_network(args: &CreateVmArgs) -> Result<Option<StaticNetwork>, ForgeError> {
    let any_set = args.ip_address.is_some() || args.netmask.is_some() || args.gateway.is_some();
    if !any_set {
        return Ok(None);
    }

    let (Some(ip), Some(netmask), Some(gateway)) =
        (&args.ip_address, &args.netmask, &args.gateway)
    else {
        return Err(ForgeError::Config {
            message: "static network configuration requires all of --ip-address, --netmask \
                      and --gateway"
                .into(),
        });
    };

    let ip_address: IpAddr = ip.parse().map_err(|_| ForgeError::Config {
        message: format!("'{ip}' is not an IP address"),
    })?;

    // Reject a malformed netmask now rather than deep inside the run.
    address::prefix_length(ip_address, netmask)?;

    Ok(Some(StaticNetwork {
        ip_address,
        netmask: netmask.clone(),
        gateway: gateway.clone(),
    }))
}

// ── per-index derivations ───────────────────────────────────────────

/// Naming facts for one instance, owned by a single loop iteration.
#[derive(Debug, Clone)]
pub struct InstanceIdentity {
    pub index: u32,
    pub hostname: String,
    pub fqdn: String,
    pub disk_image_name: String,
}

impl InstanceIdentity {
    pub fn new(spec: &ClusterSpec, index: u32) -> Self {
        let hostname = if spec.cluster_size == 1 {
            spec.host_name.clone()
        } else {
            // Strip any domain part before indexing: "db.example.net" in a
            // cluster of 3 yields db0, db1, db2.
            let base = spec
                .host_name
                .split('.')
                .next()
                .unwrap_or(&spec.host_name);
            format!("{base}{index}")
        };
        let fqdn = format!("{hostname}.{}", spec.domain_name);
        let disk_image_name = format!("{fqdn}.qcow2");
        InstanceIdentity {
            index,
            hostname,
            fqdn,
            disk_image_name,
        }
    }
}

/// Addressing for one instance. `address` of `None` means DHCP.
#[derive(Debug, Clone)]
pub struct NetworkPlan {
    pub address: Option<IpAddr>,
    pub prefix_len: Option<u8>,
    pub netmask: Option<String>,
    pub gateway: Option<String>,
    pub nameservers: Vec<String>,
}

impl NetworkPlan {
    pub fn for_index(spec: &ClusterSpec, index: u32) -> Result<Self, ForgeError> {
        let Some(ref net) = spec.network else {
            return Ok(NetworkPlan {
                address: None,
                prefix_len: None,
                netmask: None,
                gateway: None,
                nameservers: spec.nameservers.clone(),
            });
        };

        let address = match net.ip_address {
            IpAddr::V4(base) => {
                IpAddr::V4(address::plan(base, &net.netmask, spec.cluster_size, index)?)
            }
            IpAddr::V6(v6) => {
                if spec.cluster_size > 1 {
                    return Err(ForgeError::InvalidNetworkSpec {
                        message: "IPv6 cluster addressing is not supported; \
                                  use --cluster-size 1"
                            .into(),
                    });
                }
                IpAddr::V6(v6)
            }
        };

        Ok(NetworkPlan {
            prefix_len: Some(address::prefix_length(address, &net.netmask)?),
            address: Some(address),
            netmask: Some(net.netmask.clone()),
            gateway: Some(net.gateway.clone()),
            nameservers: spec.nameservers.clone(),
        })
    }

    pub fn is_static(&self) -> bool {
        self.address.is_some()
    }
}
