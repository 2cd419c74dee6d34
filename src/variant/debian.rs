//! Netboot installs for the Debian family. Debian and Ubuntu share the
//! installer flow and differ only in release codename and keyboard/locale
//! preseed parameters.

use crate::cli::VmType;
use crate::error::ForgeError;
use crate::flags::VirtInstallPlan;
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::tools;

use super::{ProvisionCtx, base_args, common_flags};

/// Locale parameters shared by the whole family. Fixed per OS family, not
/// user-configurable.
const FAMILY_LOCALE_ARGS: &[(&str, &str)] = &[
    ("keyboard-configuration/xkb-keymap", "us"),
    ("console-setup/ask_detect", "false"),
    ("locale", "en_US"),
];

/// Ubuntu asks different keyboard questions than Debian does.
const UBUNTU_KEYMAP_ARGS: &[(&str, &str)] = &[
    ("console-keymaps-at/keymap", "American"),
    ("console-setup/layoutcode", "us"),
    ("keyboard-configuration/layout", "USA"),
    ("keyboard-configuration/variant", "US"),
];

/// Kernel parameters appended after the preseed key=value pairs.
const CONSOLE_ADD_ONS: &[&str] = &["serial", "console=tty0", "console=ttyS0,9600n8"];

/// Create the empty instance disk in the pool.
pub async fn prepare(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let args: Vec<String> = vec![
        "-c".into(),
        spec.libvirt_uri(),
        "vol-create-as".into(),
        "--pool".into(),
        spec.pool_name().to_string(),
        "--name".into(),
        identity.disk_image_name.clone(),
        "--capacity".into(),
        format!("{}G", spec.disk_size_gb),
        "--format".into(),
        "qcow2".into(),
        "--prealloc-metadata".into(),
    ];
    tracing::debug!(command_line = %args.join(" "), "virsh vol-create-as");

    if spec.dry_run {
        tracing::info!(vm = %identity.fqdn, "DRY RUN: no disk image was created");
        return Ok(());
    }

    tools::run_checked("virsh", &args).await?;
    tracing::info!(volume = %identity.disk_image_name, "disk image created");
    Ok(())
}

pub fn compose(
    spec: &ClusterSpec,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> VirtInstallPlan {
    let mut flags = common_flags(spec, identity);
    flags.set("location", dist_location(spec));
    flags.set("extra-args", extra_args(spec, identity, plan));
    VirtInstallPlan {
        base_args: base_args(spec),
        flags,
        capture_xml_to: None,
        post: None,
    }
}

/// Installer source URL for the family member being installed.
fn dist_location(spec: &ClusterSpec) -> String {
    let (distro, release) = match spec.vm_type {
        VmType::Debian => ("debian", spec.debian.debian_release.as_str()),
        VmType::Ubuntu => ("ubuntu", spec.debian.ubuntu_release.as_str()),
        _ => unreachable!("not a netboot variant"),
    };
    format!(
        "https://{}/{distro}/dists/{release}/main/installer-amd64",
        spec.debian.mirror
    )
}

/// The preseed kernel command line: locale and keyboard answers, identity,
/// optional static network answers, then the serial-console add-ons.
fn extra_args(spec: &ClusterSpec, identity: &InstanceIdentity, plan: &NetworkPlan) -> String {
    let mut pairs: Vec<(String, String)> = FAMILY_LOCALE_ARGS
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

    pairs.push(("netcfg/get_domain".into(), spec.domain_name.clone()));
    pairs.push(("netcfg/get_hostname".into(), identity.hostname.clone()));
    if let Some(ref url) = spec.debian.preseed_url {
        pairs.push(("preseed/url".into(), url.clone()));
    }
    pairs.extend(network_args(plan));
    if spec.vm_type == VmType::Ubuntu {
        pairs.extend(
            UBUNTU_KEYMAP_ARGS
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        );
    }

    let mut rendered = pairs
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    for add_on in CONSOLE_ADD_ONS {
        rendered.push(' ');
        rendered.push_str(add_on);
    }
    rendered
}

/// Installer answers that switch the guest off DHCP.
fn network_args(plan: &NetworkPlan) -> Vec<(String, String)> {
    let Some(address) = plan.address else {
        return Vec::new();
    };
    let mut args = Vec::new();
    if !plan.nameservers.is_empty() {
        args.push((
            "netcfg/get_nameservers".to_string(),
            plan.nameservers.join(" "),
        ));
    }
    args.push(("netcfg/get_ipaddress".to_string(), address.to_string()));
    if let Some(ref netmask) = plan.netmask {
        args.push(("netcfg/get_netmask".to_string(), netmask.clone()));
    }
    if let Some(ref gateway) = plan.gateway {
        args.push(("netcfg/get_gateway".to_string(), gateway.clone()));
    }
    args.push(("netcfg/confirm_static".to_string(), "true".to_string()));
    args.push(("netcfg/disable_autoconfig".to_string(), "true".to_string()));
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::NetworkPlan;
    use crate::variant::test_support::spec_from;

    fn static_args() -> Vec<&'static str> {
        vec![
            "--ip-address",
            "10.0.0.10",
            "--netmask",
            "255.255.255.0",
            "--gateway",
            "10.0.0.1",
            "--nameserver",
            "10.0.0.2",
            "--nameserver",
            "10.0.0.3",
        ]
    }

    #[test]
    fn debian_location_uses_debian_release() {
        let spec = spec_from(&[
            "--vm-type",
            "debian",
            "--disk-pool",
            "vms",
            "--debian-release",
            "bookworm",
        ]);
        assert_eq!(
            dist_location(&spec),
            "https://mirrors.kernel.org/debian/dists/bookworm/main/installer-amd64"
        );
    }

    #[test]
    fn ubuntu_location_uses_ubuntu_release() {
        let spec = spec_from(&[
            "--vm-type",
            "ubuntu",
            "--disk-pool",
            "vms",
            "--ubuntu-release",
            "bionic",
            "--dist-mirror",
            "mirror.example.org",
        ]);
        assert_eq!(
            dist_location(&spec),
            "https://mirror.example.org/ubuntu/dists/bionic/main/installer-amd64"
        );
    }

    #[test]
    fn dhcp_plan_leaves_installer_network_defaults() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(!rendered.contains("netcfg/get_ipaddress"));
        assert!(!rendered.contains("netcfg/confirm_static"));
    }

    #[test]
    fn static_plan_injects_netcfg_answers() {
        let mut argv = vec!["--vm-type", "debian", "--disk-pool", "vms"];
        argv.extend(static_args());
        let spec = spec_from(&argv);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(rendered.contains("netcfg/get_ipaddress=10.0.0.10"));
        assert!(rendered.contains("netcfg/get_netmask=255.255.255.0"));
        assert!(rendered.contains("netcfg/get_gateway=10.0.0.1"));
        assert!(rendered.contains("netcfg/get_nameservers=10.0.0.2 10.0.0.3"));
        assert!(rendered.contains("netcfg/confirm_static=true"));
        assert!(rendered.contains("netcfg/disable_autoconfig=true"));
    }

    #[test]
    fn static_addresses_follow_the_cluster_index() {
        let mut argv = vec![
            "--vm-type",
            "debian",
            "--disk-pool",
            "vms",
            "--cluster-size",
            "3",
        ];
        argv.extend(static_args());
        let spec = spec_from(&argv);
        let identity = InstanceIdentity::new(&spec, 2);
        let plan = NetworkPlan::for_index(&spec, 2).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(rendered.contains("netcfg/get_ipaddress=10.0.0.12"));
        assert!(rendered.contains("netcfg/get_hostname=db2"));
    }

    #[test]
    fn ubuntu_gets_its_keymap_answers() {
        let spec = spec_from(&["--vm-type", "ubuntu", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(rendered.contains("console-keymaps-at/keymap=American"));
        assert!(rendered.contains("keyboard-configuration/layout=USA"));
    }

    #[test]
    fn debian_skips_ubuntu_keymap_answers() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(!rendered.contains("console-keymaps-at/keymap"));
    }

    #[test]
    fn console_add_ons_close_the_command_line() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let rendered = extra_args(&spec, &identity, &plan);
        assert!(rendered.ends_with("serial console=tty0 console=ttyS0,9600n8"));
    }

    #[test]
    fn compose_sets_location_and_extra_args() {
        let spec = spec_from(&["--vm-type", "debian", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let plan = NetworkPlan::for_index(&spec, 0).unwrap();
        let composed = compose(&spec, &identity, &plan);
        assert!(composed.flags.get("location").is_some());
        assert!(composed.flags.get("extra-args").is_some());
        assert!(composed.capture_xml_to.is_none());
    }
}
