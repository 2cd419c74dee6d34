//! Ubuntu cloud-image installs: a golden base image converted once, a
//! copy-on-write instance disk, and a cloud-init seed image packed by
//! cloud-localds.

use std::path::{Path, PathBuf};

use crate::cloudinit;
use crate::error::ForgeError;
use crate::flags::VirtInstallPlan;
use crate::image;
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::sshkeys;
use crate::tools;

use super::{ProvisionCtx, base_args, common_flags};

/// Releases with published minimal cloud images.
const RELEASE_TO_VER: &[(&str, &str)] = &[
    ("bionic", "18.04"),
    ("cosmic", "18.10"),
    ("disco", "19.04"),
];

fn release_ver(release: &str) -> Result<&'static str, ForgeError> {
    RELEASE_TO_VER
        .iter()
        .find(|(name, _)| *name == release)
        .map(|(_, ver)| *ver)
        .ok_or_else(|| ForgeError::Config {
            message: format!(
                "no cloud image known for ubuntu release '{release}' \
                 (known: bionic, cosmic, disco)"
            ),
        })
}

fn image_filename(ver: &str) -> String {
    format!("ubuntu-{ver}-minimal-cloudimg-amd64.img")
}

fn download_url(release: &str, ver: &str) -> String {
    format!(
        "https://cloud-images.ubuntu.com/minimal/releases/{release}/release/{}",
        image_filename(ver)
    )
}

fn golden_image_path(pool_path: &Path, ver: &str) -> PathBuf {
    pool_path.join(format!("ubuntu-{ver}-minimal-cloudimg-amd64-golden.img"))
}

pub(crate) fn seed_image_path(pool_path: &Path, identity: &InstanceIdentity) -> PathBuf {
    pool_path.join(format!("{}-seed.img", identity.fqdn))
}

/// Release image, golden image, per-VM seed documents, seed image and the
/// instance disk — everything the installer needs on the pool.
pub async fn prepare(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let pool_path = ctx.pool_path()?;
    let release = &spec.debian.ubuntu_release;
    let ver = release_ver(release)?;

    let release_image = pool_path.join(image_filename(ver));
    let golden_image = golden_image_path(pool_path, ver);

    // 1. Release image
    if spec.dry_run && !release_image.exists() {
        tracing::info!(
            url = %download_url(release, ver),
            "DRY RUN: would have downloaded the release cloud image"
        );
    } else {
        image::ensure_download(&download_url(release, ver), &release_image).await?;
    }

    // 2. Golden image, converted once and reused by every install
    if golden_image.exists() {
        tracing::info!(path = %golden_image.display(), "golden image already exists");
    } else if spec.dry_run {
        tracing::info!("DRY RUN: would have created the golden image");
    } else {
        image::convert_to_qcow2(&release_image, &golden_image).await?;
    }

    // 3. Per-VM directory holding the cloud-init inputs
    let vm_dir = pool_path.join(&identity.fqdn);
    if !vm_dir.exists() {
        if spec.dry_run {
            tracing::info!(path = %vm_dir.display(), "DRY RUN: would have created the VM directory");
        } else {
            tokio::fs::create_dir_all(&vm_dir)
                .await
                .map_err(|e| ForgeError::Io {
                    context: format!("creating VM directory {}", vm_dir.display()),
                    source: e,
                })?;
            tracing::info!(path = %vm_dir.display(), "created VM directory");
        }
    }

    // 4. Seed documents
    let ssh_keys = sshkeys::local_public_keys()?;
    let docs = cloudinit::render_seed_docs(identity, plan, &ssh_keys);
    tracing::debug!(user_data = %docs.user_data, "rendered user-data");
    if spec.dry_run {
        tracing::info!("DRY RUN: did not write user-data, meta-data or network-config");
    } else {
        write_doc(&vm_dir.join("user-data"), &docs.user_data).await?;
        write_doc(&vm_dir.join("meta-data"), &docs.meta_data).await?;
        if let Some(ref network_config) = docs.network_config {
            write_doc(&vm_dir.join("network-config"), network_config).await?;
        }
    }

    // 5. Pack the seed image
    let seed_path = seed_image_path(pool_path, identity);
    let mut localds_args: Vec<String> = Vec::new();
    if docs.network_config.is_some() {
        localds_args.push("--network-config".into());
        localds_args.push(vm_dir.join("network-config").display().to_string());
    }
    localds_args.push(seed_path.display().to_string());
    localds_args.push(vm_dir.join("user-data").display().to_string());
    localds_args.push(vm_dir.join("meta-data").display().to_string());
    tracing::debug!(command_line = %localds_args.join(" "), "cloud-localds");
    if spec.dry_run {
        tracing::info!("DRY RUN: would have packed the seed image");
    } else {
        tracing::info!(path = %seed_path.display(), "writing VM seed image with user and meta data");
        tools::run_checked("cloud-localds", &localds_args).await?;
    }

    // 6. Instance disk backed by the golden image, uploaded into the pool
    let disk_path = pool_path.join(&identity.disk_image_name);
    if spec.dry_run {
        tracing::info!(path = %disk_path.display(), "DRY RUN: would have created and uploaded the instance disk");
        return Ok(());
    }
    image::create_backed_qcow2(&golden_image, &disk_path, Some(spec.disk_size_gb)).await?;
    refresh_and_upload(spec, identity, &disk_path).await?;
    Ok(())
}

/// `virsh pool-refresh` + `virsh vol-upload` so libvirt sees the disk that
/// qemu-img just wrote into the pool directory.
pub(crate) async fn refresh_and_upload(
    spec: &ClusterSpec,
    identity: &InstanceIdentity,
    disk_path: &Path,
) -> Result<(), ForgeError> {
    let refresh: Vec<String> = vec![
        "-c".into(),
        spec.libvirt_uri(),
        "pool-refresh".into(),
        "--pool".into(),
        spec.pool_name().to_string(),
    ];
    tools::run_checked("virsh", &refresh).await?;

    let upload: Vec<String> = vec![
        "-c".into(),
        spec.libvirt_uri(),
        "vol-upload".into(),
        "--vol".into(),
        identity.disk_image_name.clone(),
        "--pool".into(),
        spec.pool_name().to_string(),
        "--file".into(),
        disk_path.display().to_string(),
    ];
    tools::run_checked("virsh", &upload).await?;
    tracing::info!(volume = %identity.disk_image_name, "instance disk uploaded to pool");
    Ok(())
}

async fn write_doc(path: &Path, contents: &str) -> Result<(), ForgeError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("writing {}", path.display()),
            source: e,
        })
}

/// Boot disk first, seed disk second; the guest boots straight off the
/// cloud image.
pub fn compose(
    spec: &ClusterSpec,
    identity: &InstanceIdentity,
    pool_path: &Path,
) -> VirtInstallPlan {
    let mut flags = common_flags(spec, identity);
    flags.set(
        "disk",
        format!(
            "vol={}/{},cache=none,bus=virtio",
            spec.pool_name(),
            identity.disk_image_name
        ),
    );
    flags.push(
        "disk",
        format!(
            "{},cache=none,bus=virtio",
            seed_image_path(pool_path, identity).display()
        ),
    );
    flags.set("boot", "hd");
    VirtInstallPlan {
        base_args: base_args(spec),
        flags,
        capture_xml_to: None,
        post: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::test_support::spec_from;

    #[test]
    fn release_mapping_covers_known_releases() {
        assert_eq!(release_ver("bionic").unwrap(), "18.04");
        assert_eq!(release_ver("cosmic").unwrap(), "18.10");
        assert_eq!(release_ver("disco").unwrap(), "19.04");
    }

    #[test]
    fn unknown_release_is_a_configuration_error() {
        assert!(matches!(
            release_ver("warty").unwrap_err(),
            ForgeError::Config { .. }
        ));
    }

    #[test]
    fn download_url_points_at_minimal_releases() {
        assert_eq!(
            download_url("bionic", "18.04"),
            "https://cloud-images.ubuntu.com/minimal/releases/bionic/release/\
             ubuntu-18.04-minimal-cloudimg-amd64.img"
        );
    }

    #[test]
    fn compose_orders_boot_disk_before_seed() {
        let spec = spec_from(&["--vm-type", "ubuntu-cloud", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let composed = compose(&spec, &identity, Path::new("/var/lib/libvirt/images"));
        let disks = composed.flags.get("disk").unwrap();
        assert_eq!(disks.len(), 2);
        assert!(disks[0].starts_with("vol=vms/db.example.net.qcow2"));
        assert!(disks[1].starts_with("/var/lib/libvirt/images/db.example.net-seed.img"));
        assert_eq!(composed.flags.get("boot").unwrap(), &["hd".to_string()]);
    }

    #[test]
    fn seed_image_is_named_after_the_instance() {
        let spec = spec_from(&[
            "--vm-type",
            "ubuntu-cloud",
            "--disk-pool",
            "vms",
            "--cluster-size",
            "2",
        ]);
        let identity = InstanceIdentity::new(&spec, 1);
        assert_eq!(
            seed_image_path(Path::new("/pool"), &identity),
            PathBuf::from("/pool/db1.example.net-seed.img")
        );
    }
}
