//! Rendering of the textual first-boot documents: cloud-init user-data,
//! meta-data and network-config for cloud images, and the Container Linux
//! config that gets transpiled into an Ignition document.

use std::net::IpAddr;

use facet_value::{VArray, Value, value};
use uuid::Uuid;

use crate::spec::{InstanceIdentity, NetworkPlan};

/// The three NoCloud seed documents. `network_config` is only rendered for
/// static plans; DHCP guests rely on the image default.
pub struct SeedDocs {
    pub user_data: String,
    pub meta_data: String,
    pub network_config: Option<String>,
}

pub fn render_seed_docs(
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
    ssh_keys: &[String],
) -> SeedDocs {
    SeedDocs {
        user_data: build_user_data(identity, ssh_keys),
        meta_data: build_meta_data(identity),
        network_config: plan.is_static().then(|| build_network_config(plan)),
    }
}

fn build_user_data(identity: &InstanceIdentity, ssh_keys: &[String]) -> String {
    let mut doc = value!({
        "hostname": (identity.hostname.as_str()),
        "fqdn": (identity.fqdn.as_str()),
        "manage_etc_hosts": true,
    });

    if !ssh_keys.is_empty() {
        let keys = VArray::from_iter(ssh_keys.iter().map(|k| Value::from(k.as_str())));
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("ssh_authorized_keys", Value::from(keys));
        }
    }

    to_cloud_config(&doc)
}

fn build_meta_data(identity: &InstanceIdentity) -> String {
    let instance_id = Uuid::new_v4();
    format!(
        "instance-id: {instance_id}\nlocal-hostname: {hostname}\n",
        hostname = identity.hostname
    )
}

fn build_network_config(plan: &NetworkPlan) -> String {
    let address = plan.address.expect("static plan has an address");
    let prefix = plan.prefix_len.expect("static plan has a prefix length");
    let gateway_key = match address {
        IpAddr::V4(_) => "gateway4",
        IpAddr::V6(_) => "gateway6",
    };

    let matcher = value!({ "name": "en*" });
    let cidr = format!("{address}/{prefix}");
    let addresses = VArray::from_iter([Value::from(cidr.as_str())]);
    let mut iface = value!({
        "match": (matcher),
        "addresses": (Value::from(addresses)),
    });
    if let Some(obj) = iface.as_object_mut() {
        if let Some(ref gw) = plan.gateway {
            obj.insert(gateway_key, Value::from(gw.as_str()));
        }
        if !plan.nameservers.is_empty() {
            let addrs =
                VArray::from_iter(plan.nameservers.iter().map(|n| Value::from(n.as_str())));
            obj.insert("nameservers", value!({ "addresses": (Value::from(addrs)) }));
        }
    }

    let ethernets = value!({ "id0": (iface) });
    let doc = value!({
        "version": 2,
        "ethernets": (ethernets),
    });

    to_yaml(&doc)
}

/// Container Linux config for CoreOS guests. When `template` is given its
/// `{{ key }}` placeholders are substituted; otherwise a built-in document
/// is rendered.
pub fn render_container_linux_config(
    identity: &InstanceIdentity,
    plan: &NetworkPlan,
    channel: &str,
    ssh_keys: &[String],
    template: Option<&str>,
) -> String {
    if let Some(template) = template {
        let keys_yaml = format!(
            "[{}]",
            ssh_keys
                .iter()
                .map(|k| format!("\"{k}\""))
                .collect::<Vec<_>>()
                .join(", ")
        );
        let vars: Vec<(&str, String)> = vec![
            ("hostname", identity.hostname.clone()),
            ("fqdn", identity.fqdn.clone()),
            ("channel", channel.to_string()),
            ("ssh_keys", keys_yaml),
            (
                "ip_address",
                plan.address.map(|a| a.to_string()).unwrap_or_default(),
            ),
            (
                "prefix_len",
                plan.prefix_len.map(|p| p.to_string()).unwrap_or_default(),
            ),
            ("gateway", plan.gateway.clone().unwrap_or_default()),
            ("dns", plan.nameservers.join(" ")),
        ];
        return substitute(template, &vars);
    }

    let keys = VArray::from_iter(ssh_keys.iter().map(|k| Value::from(k.as_str())));
    let user = value!({
        "name": "core",
        "ssh_authorized_keys": (Value::from(keys)),
    });
    let passwd = value!({ "users": (Value::from(VArray::from_iter([user]))) });

    let contents = value!({ "inline": (identity.fqdn.as_str()) });
    let hostname_file = value!({
        "path": "/etc/hostname",
        "filesystem": "root",
        "mode": 420,
        "contents": (contents),
    });
    let storage = value!({ "files": (Value::from(VArray::from_iter([hostname_file]))) });

    let mut doc = value!({
        "passwd": (passwd),
        "storage": (storage),
    });

    if plan.is_static() {
        let address = plan.address.expect("static plan has an address");
        let prefix = plan.prefix_len.expect("static plan has a prefix length");
        let mut unit = format!("[Match]\nName=en*\n\n[Network]\nAddress={address}/{prefix}\n");
        if let Some(ref gw) = plan.gateway {
            unit.push_str(&format!("Gateway={gw}\n"));
        }
        for ns in &plan.nameservers {
            unit.push_str(&format!("DNS={ns}\n"));
        }
        let network_unit = value!({
            "name": "00-static.network",
            "contents": (unit.as_str()),
        });
        let units = VArray::from_iter([network_unit]);
        if let Some(obj) = doc.as_object_mut() {
            obj.insert("networkd", value!({ "units": (Value::from(units)) }));
        }
    }

    to_yaml(&doc)
}

/// Fill `{{ key }}` placeholders in a template. Unknown placeholders are
/// left untouched so mistakes stay visible in the rendered output.
pub fn substitute(template: &str, vars: &[(&str, String)]) -> String {
    let mut rendered = template.to_string();
    for (key, value) in vars {
        rendered = rendered.replace(&format!("{{{{ {key} }}}}"), value);
        rendered = rendered.replace(&format!("{{{{{key}}}}}"), value);
    }
    rendered
}

fn to_yaml(doc: &Value) -> String {
    let yaml = facet_yaml::to_string(doc).expect("valid YAML serialization");
    yaml.strip_prefix("---\n").unwrap_or(&yaml).to_string()
}

fn to_cloud_config(doc: &Value) -> String {
    // cloud-init expects #cloud-config as the very first line.
    format!("#cloud-config\n{}", to_yaml(doc))
}
