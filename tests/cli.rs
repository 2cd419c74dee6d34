use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn vmforge() -> assert_cmd::Command {
    cargo_bin_cmd!("vmforge").into()
}

fn create_vm_base() -> assert_cmd::Command {
    let mut cmd = vmforge();
    cmd.args([
        "create-vm",
        "--vm-type",
        "debian",
        "--host-name",
        "db",
        "--domain-name",
        "example.net",
    ]);
    cmd
}

#[test]
fn help_works() {
    vmforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains(
            "Cluster-aware VM provisioning for libvirt and Proxmox",
        ));
}

#[test]
fn create_vm_requires_vm_type() {
    vmforge()
        .args(["create-vm", "--host-name", "db", "--domain-name", "example.net"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--vm-type"));
}

#[test]
fn missing_bridge_and_pool_reported_before_any_connection() {
    create_vm_base()
        .assert()
        .failure()
        .stderr(predicate::str::contains("--bridge-interface").and(predicate::str::contains("--disk-pool")));
}

#[test]
fn partial_static_network_exits_before_backend() {
    // --gateway omitted: configuration error, no libvirt connection is
    // ever attempted (this test box has none).
    create_vm_base()
        .args([
            "--bridge-interface",
            "br0",
            "--disk-pool",
            "vms",
            "--ip-address",
            "10.0.0.10",
            "--netmask",
            "255.255.255.0",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("static network configuration requires"));
}

#[test]
fn memory_outside_discrete_set_is_rejected() {
    create_vm_base()
        .args(["--bridge-interface", "br0", "--disk-pool", "vms", "--memory", "3000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("memory must be one of"));
}

#[test]
fn unknown_vm_type_is_rejected() {
    vmforge()
        .args([
            "create-vm",
            "--vm-type",
            "windows",
            "--host-name",
            "db",
            "--domain-name",
            "example.net",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value"));
}

#[test]
fn malformed_mac_address_is_rejected() {
    create_vm_base()
        .args([
            "--bridge-interface",
            "br0",
            "--disk-pool",
            "vms",
            "--mac-address",
            "zz:zz:zz",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not a valid MAC address"));
}

#[test]
fn proxmox_clone_requires_template_storage_and_cluster() {
    vmforge()
        .args([
            "create-vm",
            "--vm-type",
            "proxmox-clone",
            "--host-name",
            "db",
            "--domain-name",
            "example.net",
            "--bridge-interface",
            "vmbr0",
        ])
        .assert()
        .failure()
        .stderr(
            predicate::str::contains("--proxmox-template")
                .and(predicate::str::contains("--proxmox-storage"))
                .and(predicate::str::contains("--cluster")),
        );
}

#[test]
fn proxmox_clone_missing_auth_config_is_io_error() {
    // All required args present; the run should die loading the (absent)
    // auth config, still before any API call.
    vmforge()
        .args([
            "create-vm",
            "--vm-type",
            "proxmox-clone",
            "--host-name",
            "db",
            "--domain-name",
            "example.net",
            "--bridge-interface",
            "vmbr0",
            "--proxmox-template",
            "tmpl",
            "--proxmox-storage",
            "local",
            "--cluster",
            "home",
            "--auth-config",
            "/nonexistent/proxmox.toml",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("auth config"));
}

#[test]
fn proxmox_clone_unknown_cluster_section_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let auth_path = dir.path().join("proxmox.toml");
    let mut f = std::fs::File::create(&auth_path).unwrap();
    write!(
        f,
        r#"
[cluster.work]
user = "provision@pve"
token = "vmforge"
secret = "00000000-0000-0000-0000-000000000000"
"#
    )
    .unwrap();

    vmforge()
        .args([
            "create-vm",
            "--vm-type",
            "proxmox-clone",
            "--host-name",
            "db",
            "--domain-name",
            "example.net",
            "--bridge-interface",
            "vmbr0",
            "--proxmox-template",
            "tmpl",
            "--proxmox-storage",
            "local",
            "--cluster",
            "home",
            "--auth-config",
            auth_path.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no [cluster.home] section"));
}

#[test]
fn list_pool_volumes_requires_disk_pool() {
    vmforge()
        .args(["list-pool-volumes"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("--disk-pool"));
}
