//! Container Linux installs: a channel snapshot image with age-based
//! refresh, a transpiled Ignition config, and a domain XML patched to hand
//! the config to the guest over fw_cfg.

use std::path::{Path, PathBuf};

use crate::cloudinit;
use crate::error::ForgeError;
use crate::flags::{PostInstall, VirtInstallPlan};
use crate::image;
use crate::spec::{ClusterSpec, InstanceIdentity, NetworkPlan};
use crate::sshkeys;
use crate::tools;

use super::{ProvisionCtx, base_args, common_flags};

const CT_RELEASE_BASE: &str =
    "https://github.com/coreos/container-linux-config-transpiler/releases/download";

fn compressed_snapshot_path(pool_path: &Path, channel: &str) -> PathBuf {
    pool_path.join(format!("coreos_production_qemu_image-{channel}.img.bz2"))
}

fn snapshot_path(pool_path: &Path, channel: &str) -> PathBuf {
    pool_path.join(format!("coreos_production_qemu_image-{channel}.img"))
}

fn snapshot_url(channel: &str) -> String {
    format!("http://{channel}.release.core-os.net/amd64-usr/current/coreos_production_qemu_image.img.bz2")
}

fn config_base(pool_path: &Path) -> PathBuf {
    pool_path.join("coreos")
}

fn vm_config_dir(pool_path: &Path, identity: &InstanceIdentity) -> PathBuf {
    config_base(pool_path).join(&identity.fqdn)
}

pub(crate) fn ignition_path(pool_path: &Path, identity: &InstanceIdentity) -> PathBuf {
    vm_config_dir(pool_path, identity).join("config.ign")
}

pub(crate) fn domain_xml_path(pool_path: &Path, identity: &InstanceIdentity) -> PathBuf {
    vm_config_dir(pool_path, identity).join("vm.xml")
}

fn ct_path(pool_path: &Path, version: &str) -> PathBuf {
    config_base(pool_path).join(format!("ct-v{version}"))
}

fn ct_url(version: &str) -> String {
    format!("{CT_RELEASE_BASE}/v{version}/ct-v{version}-x86_64-unknown-linux-gnu")
}

pub async fn prepare(
    ctx: &ProvisionCtx<'_>,
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let pool_path = ctx.pool_path()?;
    let channel = &spec.coreos.channel;

    ensure_snapshot_image(ctx, pool_path).await?;

    // Container Linux config
    let ssh_keys = sshkeys::local_public_keys()?;
    let template = match spec.coreos.cloud_config_template {
        Some(ref path) => Some(std::fs::read_to_string(path).map_err(|e| ForgeError::Io {
            context: format!("reading cloud config template {}", path.display()),
            source: e,
        })?),
        None => None,
    };
    let rendered = cloudinit::render_container_linux_config(
        identity,
        plan,
        channel,
        &ssh_keys,
        template.as_deref(),
    );
    tracing::debug!(config = %rendered, "rendered Container Linux config");

    let config_dir = vm_config_dir(pool_path, identity);
    let cl_path = config_dir.join("config.cl");
    if spec.dry_run {
        tracing::info!("DRY RUN: did not write the Container Linux config");
    } else {
        tokio::fs::create_dir_all(&config_dir)
            .await
            .map_err(|e| ForgeError::Io {
                context: format!("creating config directory {}", config_dir.display()),
                source: e,
            })?;
        tokio::fs::write(&cl_path, &rendered)
            .await
            .map_err(|e| ForgeError::Io {
                context: format!("writing {}", cl_path.display()),
                source: e,
            })?;
    }

    ensure_transpiler(ctx, pool_path).await?;
    transpile_ignition(ctx, pool_path, identity, &cl_path, &rendered).await?;

    // Instance disk backed by the snapshot image, at the image's own size
    let disk_path = pool_path.join(&identity.disk_image_name);
    if spec.dry_run {
        tracing::info!(path = %disk_path.display(), "DRY RUN: would have created and uploaded the instance disk");
        return Ok(());
    }
    image::create_backed_qcow2(&snapshot_path(pool_path, channel), &disk_path, None).await?;
    super::ubuntu_cloud::refresh_and_upload(spec, identity, &disk_path).await?;
    Ok(())
}

/// Download (or refresh, once it ages out) the channel snapshot image and
/// keep a decompressed copy next to it.
async fn ensure_snapshot_image(
    ctx: &ProvisionCtx<'_>,
    pool_path: &Path,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let channel = &spec.coreos.channel;
    let compressed = compressed_snapshot_path(pool_path, channel);
    let uncompressed = snapshot_path(pool_path, channel);
    let age_days = spec.coreos.image_age_days;

    if compressed.exists() && !image::older_than_days(&compressed, age_days) {
        tracing::info!(
            channel = %channel,
            age_days,
            "snapshot image is fresh enough, not re-downloading"
        );
    } else {
        if compressed.exists() {
            tracing::info!(channel = %channel, age_days, "snapshot image aged out, re-downloading");
        } else {
            tracing::info!(channel = %channel, "no local snapshot image found, downloading");
        }
        if spec.dry_run {
            tracing::info!(channel = %channel, "DRY RUN: would have retrieved a new snapshot image");
            return Ok(());
        }
        let _ = tokio::fs::remove_file(&compressed).await;
        let _ = tokio::fs::remove_file(&uncompressed).await;
        image::ensure_download(&snapshot_url(channel), &compressed).await?;
    }

    if !uncompressed.exists() {
        if spec.dry_run {
            tracing::info!("DRY RUN: would have decompressed the snapshot image");
            return Ok(());
        }
        tracing::debug!(path = %compressed.display(), "decompressing snapshot image");
        image::decompress_bz2(&compressed).await?;
        tracing::info!(path = %uncompressed.display(), "snapshot image decompressed");
    }
    Ok(())
}

/// Download the config transpiler release binary and mark it executable.
async fn ensure_transpiler(ctx: &ProvisionCtx<'_>, pool_path: &Path) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let version = &spec.coreos.ct_version;
    let ct = ct_path(pool_path, version);
    if ct.exists() {
        tracing::info!(version = %version, "config transpiler already downloaded");
        return Ok(());
    }
    if spec.dry_run {
        tracing::info!(version = %version, "DRY RUN: would have downloaded the config transpiler");
        return Ok(());
    }
    image::ensure_download(&ct_url(version), &ct).await?;

    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(&ct)
        .map_err(|e| ForgeError::Io {
            context: format!("reading metadata for {}", ct.display()),
            source: e,
        })?
        .permissions();
    perms.set_mode(perms.mode() | 0o110);
    std::fs::set_permissions(&ct, perms).map_err(|e| ForgeError::Io {
        context: format!("marking {} executable", ct.display()),
        source: e,
    })?;
    Ok(())
}

/// Transpile the Container Linux config into an Ignition document. A dry
/// run transpiles in memory when the transpiler is available, proving the
/// config is valid without writing anything.
async fn transpile_ignition(
    ctx: &ProvisionCtx<'_>,
    pool_path: &Path,
    identity: &InstanceIdentity,
    cl_path: &Path,
    rendered: &str,
) -> Result<(), ForgeError> {
    let spec = ctx.spec;
    let ct = ct_path(pool_path, &spec.coreos.ct_version);
    let ct_bin = ct.display().to_string();
    let base: Vec<String> = vec![
        "-pretty".into(),
        "-strict".into(),
        "-platform".into(),
        "vagrant-virtualbox".into(),
    ];

    if spec.dry_run {
        if ct.exists() {
            tools::run_with_stdin(&ct_bin, &base, rendered).await?;
            tracing::info!("DRY RUN: transpiled an in-memory Ignition config");
        } else {
            tracing::info!("DRY RUN: transpiler not present, skipping in-memory transpile");
        }
        return Ok(());
    }

    if !ct.exists() {
        return Err(ForgeError::Config {
            message: format!("config transpiler not found at {}", ct.display()),
        });
    }

    let ign = ignition_path(pool_path, identity);
    let mut args = base;
    args.push("-in-file".into());
    args.push(cl_path.display().to_string());
    args.push("-out-file".into());
    args.push(ign.display().to_string());
    tools::run_checked(&ct_bin, &args).await?;
    tracing::info!(path = %ign.display(), "wrote Ignition config");
    Ok(())
}

/// The install never boots directly: virt-install prints the domain XML,
/// which gets patched with the fw_cfg stanza before define + start.
pub fn compose(
    spec: &ClusterSpec,
    identity: &InstanceIdentity,
    pool_path: &Path,
) -> VirtInstallPlan {
    let mut flags = common_flags(spec, identity);
    flags.set("os-variant", "virtio26");
    flags.set("import", "");
    flags.set("print-xml", "");

    let xml_path = domain_xml_path(pool_path, identity);
    VirtInstallPlan {
        base_args: base_args(spec),
        flags,
        capture_xml_to: Some(xml_path.clone()),
        post: Some(PostInstall::DefineWithIgnition {
            xml_path,
            ignition_path: ignition_path(pool_path, identity),
            vm_name: identity.fqdn.clone(),
        }),
    }
}

/// Add the qemu namespace and a fw_cfg command line pointing at the
/// Ignition config.
pub(crate) fn inject_ignition(xml: &str, ignition_path: &Path) -> String {
    let with_ns = if xml.contains("xmlns:qemu") {
        xml.to_string()
    } else {
        xml.replacen(
            "<domain ",
            "<domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0' ",
            1,
        )
    };
    let stanza = format!(
        "  <qemu:commandline>\n    <qemu:arg value='-fw_cfg'/>\n    \
         <qemu:arg value='name=opt/com.coreos/config,file={}'/>\n  </qemu:commandline>\n",
        ignition_path.display()
    );
    with_ns.replacen("</domain>", &format!("{stanza}</domain>"), 1)
}

/// Patch the captured XML, then `virsh define` + `virsh start`.
pub(crate) async fn define_with_ignition(
    ctx: &ProvisionCtx<'_>,
    xml_path: &Path,
    ignition_path: &Path,
    vm_name: &str,
) -> Result<(), ForgeError> {
    let xml = tokio::fs::read_to_string(xml_path)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("reading {}", xml_path.display()),
            source: e,
        })?;
    let patched = inject_ignition(&xml, ignition_path);
    tracing::debug!(xml = %patched, "domain XML with Ignition command line");
    tokio::fs::write(xml_path, &patched)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("writing {}", xml_path.display()),
            source: e,
        })?;

    let uri = ctx.spec.libvirt_uri();
    let define: Vec<String> = vec![
        "-c".into(),
        uri.clone(),
        "define".into(),
        xml_path.display().to_string(),
    ];
    tools::run_checked("virsh", &define).await?;

    let start: Vec<String> = vec!["-c".into(), uri, "start".into(), vm_name.to_string()];
    tools::run_checked("virsh", &start).await?;
    tracing::info!(vm = vm_name, "defined and started VM");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variant::test_support::spec_from;

    const DOMAIN_XML: &str = "<domain type='kvm'>\n  <name>core0.example.net</name>\n</domain>\n";

    #[test]
    fn inject_ignition_adds_namespace_and_stanza() {
        let patched = inject_ignition(DOMAIN_XML, Path::new("/pool/coreos/c0/config.ign"));
        assert!(patched.starts_with(
            "<domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0' type='kvm'>"
        ));
        assert!(patched.contains("<qemu:arg value='-fw_cfg'/>"));
        assert!(patched.contains(
            "<qemu:arg value='name=opt/com.coreos/config,file=/pool/coreos/c0/config.ign'/>"
        ));
        assert!(patched.trim_end().ends_with("</domain>"));
    }

    #[test]
    fn inject_ignition_keeps_existing_namespace() {
        let xml = "<domain xmlns:qemu='http://libvirt.org/schemas/domain/qemu/1.0' \
                   type='kvm'>\n</domain>\n";
        let patched = inject_ignition(xml, Path::new("/pool/config.ign"));
        assert_eq!(patched.matches("xmlns:qemu").count(), 1);
    }

    #[test]
    fn snapshot_paths_are_channel_specific() {
        let pool = Path::new("/pool");
        assert_eq!(
            compressed_snapshot_path(pool, "stable"),
            PathBuf::from("/pool/coreos_production_qemu_image-stable.img.bz2")
        );
        assert_eq!(
            snapshot_path(pool, "beta"),
            PathBuf::from("/pool/coreos_production_qemu_image-beta.img")
        );
    }

    #[test]
    fn transpiler_url_matches_release_layout() {
        assert_eq!(
            ct_url("0.9.0"),
            "https://github.com/coreos/container-linux-config-transpiler/releases/download/\
             v0.9.0/ct-v0.9.0-x86_64-unknown-linux-gnu"
        );
    }

    #[test]
    fn compose_prints_xml_and_patches_afterwards() {
        let spec = spec_from(&["--vm-type", "coreos", "--disk-pool", "vms"]);
        let identity = InstanceIdentity::new(&spec, 0);
        let composed = compose(&spec, &identity, Path::new("/pool"));
        assert_eq!(composed.flags.get("os-variant").unwrap(), &["virtio26".to_string()]);
        assert!(composed.flags.to_args().contains(&"--print-xml".to_string()));
        assert!(composed.flags.to_args().contains(&"--import".to_string()));
        let xml = composed.capture_xml_to.unwrap();
        assert_eq!(xml, PathBuf::from("/pool/coreos/db.example.net/vm.xml"));
        assert!(matches!(
            composed.post,
            Some(PostInstall::DefineWithIgnition { .. })
        ));
    }
}
