use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

/// RAM sizes the installer profiles are tuned for.
const MEMORY_CHOICES: &[u32] = &[512, 1024, 2048, 4096, 8192];

#[derive(Parser, Debug)]
#[command(
    name = "vmforge",
    about = "Cluster-aware VM provisioning for libvirt and Proxmox",
    version
)]
pub struct Cli {
    /// Enable debug output
    #[arg(long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create one VM, or an indexed cluster of VMs
    CreateVm(CreateVmArgs),

    /// List storage pools on the VM host
    ListDiskPools {
        #[command(flatten)]
        host: HostArgs,
    },

    /// List host network interfaces available for bridging
    ListNetworkInterfaces {
        #[command(flatten)]
        host: HostArgs,
    },

    /// List volumes in a storage pool on the VM host
    ListPoolVolumes {
        #[command(flatten)]
        host: HostArgs,

        /// Storage pool to enumerate
        #[arg(long)]
        disk_pool: String,
    },
}

#[derive(Args, Debug)]
pub struct HostArgs {
    /// VM host to connect to
    #[arg(long, default_value = "localhost")]
    pub vm_host: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub enum VmType {
    /// Debian netboot install
    Debian,
    /// Ubuntu netboot install
    Ubuntu,
    /// Ubuntu cloud image with a cloud-init seed
    UbuntuCloud,
    /// Container Linux with an Ignition config
    Coreos,
    /// Clone from a Proxmox template
    ProxmoxClone,
}

impl VmType {
    /// Variants installed through virt-install against a libvirt host.
    pub fn uses_libvirt(self) -> bool {
        !matches!(self, VmType::ProxmoxClone)
    }
}

#[derive(Args, Debug)]
pub struct CreateVmArgs {
    /// Type of VM to create
    #[arg(long, value_enum)]
    pub vm_type: VmType,

    /// Base hostname for the VM (indexed when --cluster-size > 1)
    #[arg(long)]
    pub host_name: String,

    /// DNS domain name appended to the hostname
    #[arg(long)]
    pub domain_name: String,

    /// Number of virtual CPUs
    #[arg(long, default_value_t = 1)]
    pub cpus: u32,

    /// Amount of RAM in MB
    #[arg(long, default_value_t = 512, value_parser = parse_memory_mb)]
    pub memory: u32,

    /// Size of the VM disk image, in GB
    #[arg(long, default_value_t = 10)]
    pub disk_size_gb: u32,

    /// Host NIC/VLAN to bridge (see list-network-interfaces)
    #[arg(long)]
    pub bridge_interface: Option<String>,

    /// VM host to create the guest on
    #[arg(long, default_value = "localhost")]
    pub vm_host: String,

    /// Storage pool for the VM disk image (see list-disk-pools)
    #[arg(long)]
    pub disk_pool: Option<String>,

    /// Number of identically-configured instances to create
    #[arg(long, default_value_t = 1)]
    pub cluster_size: u32,

    /// Report what would happen without touching the backend
    #[arg(long)]
    pub dry_run: bool,

    /// Delete a pre-existing VM and disk image of the same name
    #[arg(long)]
    pub delete_if_exists: bool,

    /// Deadline for asynchronous backend tasks, in seconds
    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,

    /// Boot the guest with UEFI firmware
    #[arg(long)]
    pub use_uefi: bool,

    // ── static network ───────────────────────────────────
    /// Static IP address for the first instance
    #[arg(long)]
    pub ip_address: Option<String>,

    /// Dotted-quad subnet mask (IPv4) or prefix length (IPv6)
    #[arg(long)]
    pub netmask: Option<String>,

    /// Default gateway address
    #[arg(long)]
    pub gateway: Option<String>,

    /// Nameserver address (repeatable)
    #[arg(long = "nameserver")]
    pub nameservers: Vec<String>,

    /// Fixed MAC address for the guest NIC
    #[arg(long)]
    pub mac_address: Option<String>,

    // ── debian family ────────────────────────────────────
    /// Mirror host serving /debian and /ubuntu installer trees
    #[arg(long, default_value = "mirrors.kernel.org")]
    pub dist_mirror: String,

    /// Debian release codename
    #[arg(long, default_value = "bookworm")]
    pub debian_release: String,

    /// Ubuntu release codename
    #[arg(long, default_value = "bionic")]
    pub ubuntu_release: String,

    /// URL of the preseed file handed to the installer
    #[arg(long)]
    pub preseed_url: Option<String>,

    // ── coreos ───────────────────────────────────────────
    /// Container Linux release channel
    #[arg(long, default_value = "stable")]
    pub coreos_channel: String,

    /// Re-download the snapshot image when older than this many days
    #[arg(long, default_value_t = 30)]
    pub coreos_image_age: u64,

    /// Version of the config transpiler to download and run
    #[arg(long, default_value = "0.9.0")]
    pub coreos_ct_version: String,

    /// Container Linux config template ({{ key }} placeholders)
    #[arg(long)]
    pub coreos_cloud_config_template: Option<PathBuf>,

    // ── proxmox ──────────────────────────────────────────
    /// Name of the template VM to clone
    #[arg(long)]
    pub proxmox_template: Option<String>,

    /// Proxmox storage the cloned disk lands on
    #[arg(long)]
    pub proxmox_storage: Option<String>,

    /// TOML file holding API token credentials
    #[arg(long)]
    pub auth_config: Option<PathBuf>,

    /// Cluster section of the auth config to use
    #[arg(long)]
    pub cluster: Option<String>,

    /// SSH public keys for the cloned guest: a local path or URL
    #[arg(long)]
    pub proxmox_sshkeys: Option<String>,

    /// Skip TLS certificate verification against the Proxmox API
    #[arg(long)]
    pub insecure_tls: bool,
}

fn parse_memory_mb(s: &str) -> Result<u32, String> {
    let mb: u32 = s.parse().map_err(|_| format!("'{s}' is not a number"))?;
    if MEMORY_CHOICES.contains(&mb) {
        Ok(mb)
    } else {
        Err(format!(
            "memory must be one of {MEMORY_CHOICES:?} (got {mb})"
        ))
    }
}
