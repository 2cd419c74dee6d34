//! Proxmox VE REST client: API-token auth, a per-invocation index of all
//! cluster guests, and polling for asynchronous tasks.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use facet::Facet;
use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};

use crate::error::ForgeError;
use crate::spec::InstanceIdentity;

use super::{PresenceResult, ProvisionBackend, VmRef};

/// Fixed poll interval for asynchronous backend tasks.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

// ── auth configuration ──────────────────────────────────────────────

#[derive(Debug, Clone, Facet)]
pub struct ProxmoxAuth {
    pub user: String,
    pub token: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Facet)]
#[facet(default)]
pub struct AuthFileConfig {
    #[facet(default)]
    pub cluster: BTreeMap<String, ProxmoxAuth>,
}

/// Load API token credentials for one cluster section from the TOML auth
/// file (default `~/.config/vmforge/proxmox.toml`).
pub fn load_auth(path: Option<&Path>, cluster: &str) -> Result<ProxmoxAuth, ForgeError> {
    let path: PathBuf = match path {
        Some(p) => p.to_path_buf(),
        None => dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/etc"))
            .join("vmforge")
            .join("proxmox.toml"),
    };

    let contents = std::fs::read_to_string(&path).map_err(|source| ForgeError::Io {
        context: format!("reading auth config {}", path.display()),
        source,
    })?;

    let config: AuthFileConfig =
        facet_toml::from_str(&contents).map_err(|e| ForgeError::Config {
            message: format!("parsing auth config {}: {e}", path.display()),
        })?;

    let auth = config
        .cluster
        .get(cluster)
        .ok_or_else(|| ForgeError::Config {
            message: format!(
                "no [cluster.{cluster}] section in auth config {}",
                path.display()
            ),
        })?;

    tracing::info!(user = %auth.user, token = %auth.token, "using API token auth");
    Ok(auth.clone())
}

// ── wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ResponseBase<T> {
    data: T,
}

#[derive(Debug, Deserialize)]
struct NodeEntry {
    node: String,
}

/// One guest from the per-node qemu listing, annotated with its node.
#[derive(Debug, Clone, Deserialize)]
pub struct VmEntry {
    pub vmid: u32,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub template: u8,
    #[serde(default)]
    pub status: String,
    #[serde(skip)]
    pub node: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusEntry {
    status: String,
    #[serde(default)]
    exitstatus: Option<String>,
}

/// Body for POSTs that carry no parameters.
#[derive(Serialize)]
struct NoParams {}

#[derive(Debug, Clone, Serialize)]
pub struct CloneOptions {
    pub name: String,
    pub newid: u32,
    pub full: u8,
    pub format: String,
    pub storage: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResizeOptions {
    pub disk: String,
    pub size: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct VmConfigOptions {
    pub agent: String,
    pub ciuser: String,
    pub ipconfig0: String,
    pub memory: u32,
    pub net0: String,
    pub onboot: u8,
    pub ostype: String,
    pub sockets: u32,
    pub tags: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameserver: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sshkeys: Option<String>,
}

// ── client ──────────────────────────────────────────────────────────

pub struct ProxmoxClient {
    http: reqwest::Client,
    base: String,
    node: String,
    timeout_secs: u64,
    // All guests by vmid, fetched once per invocation so presence and
    // template queries never hit the API again.
    vms: BTreeMap<u32, VmEntry>,
}

impl ProxmoxClient {
    /// Build the client and populate the guest index. A failure here is a
    /// fatal BackendUnavailable for the whole run.
    pub async fn connect(
        vm_host: &str,
        auth: &ProxmoxAuth,
        insecure_tls: bool,
        timeout_secs: u64,
    ) -> Result<Self, ForgeError> {
        let mut headers = reqwest::header::HeaderMap::new();
        let value = format!("PVEAPIToken={}!{}={}", auth.user, auth.token, auth.secret);
        headers.insert(
            reqwest::header::AUTHORIZATION,
            value.parse().map_err(|_| ForgeError::Config {
                message: "API token credentials contain invalid header characters".into(),
            })?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .danger_accept_invalid_certs(insecure_tls)
            .build()
            .map_err(|e| ForgeError::Backend {
                message: format!("building HTTP client: {e}"),
            })?;

        let mut client = ProxmoxClient {
            http,
            base: format!("https://{vm_host}:8006/api2/json"),
            node: vm_host.split('.').next().unwrap_or(vm_host).to_string(),
            timeout_secs,
            vms: BTreeMap::new(),
        };
        client.refresh_index().await?;
        Ok(client)
    }

    /// Node name installs land on, derived from the vm_host argument.
    pub fn node(&self) -> &str {
        &self.node
    }

    async fn refresh_index(&mut self) -> Result<(), ForgeError> {
        let nodes: Vec<NodeEntry> = self.get("/nodes").await?;
        for node in nodes {
            tracing::debug!(node = %node.node, "listing guests");
            let guests: Vec<VmEntry> = self.get(&format!("/nodes/{}/qemu", node.node)).await?;
            for mut vm in guests {
                vm.node = node.node.clone();
                self.vms.insert(vm.vmid, vm);
            }
        }
        tracing::info!(count = self.vms.len(), "indexed cluster guests");
        Ok(())
    }

    /// In-memory lookup against the cached guest index.
    pub fn find_by_name(&self, name: &str) -> Option<&VmEntry> {
        self.vms.values().find(|vm| vm.name == name)
    }

    /// Resolve the vmid of a template by name among guests flagged as
    /// templates on the target node. Fails before any clone RPC.
    pub fn template_vmid(&self, template: &str) -> Result<u32, ForgeError> {
        for vm in self.vms.values() {
            if vm.template == 1 && vm.node == self.node {
                tracing::debug!(vmid = vm.vmid, name = %vm.name, "found candidate template VM");
                if vm.name == template {
                    return Ok(vm.vmid);
                }
            }
        }
        Err(ForgeError::TemplateNotFound {
            template: template.to_string(),
            node: self.node.clone(),
        })
    }

    /// Next free vmid in the cluster.
    pub async fn next_id(&self) -> Result<u32, ForgeError> {
        let id: String = self.get("/cluster/nextid").await?;
        id.parse().map_err(|_| ForgeError::Proxmox {
            message: format!("cluster/nextid returned '{id}'"),
        })
    }

    pub async fn clone_vm(
        &self,
        template_vmid: u32,
        opts: &CloneOptions,
    ) -> Result<String, ForgeError> {
        let upid = self
            .post_form(
                &format!("/nodes/{}/qemu/{template_vmid}/clone", self.node),
                opts,
            )
            .await?
            .ok_or_else(|| ForgeError::Proxmox {
                message: "clone returned no task id".into(),
            })?;
        tracing::info!(template_vmid, newid = opts.newid, upid = %upid, "clone started");
        Ok(upid)
    }

    pub async fn resize_disk(&self, vmid: u32, opts: &ResizeOptions) -> Result<(), ForgeError> {
        let url = format!("{}/nodes/{}/qemu/{vmid}/resize", self.base, self.node);
        let response = self
            .http
            .put(&url)
            .form(opts)
            .send()
            .await
            .map_err(|e| ForgeError::Backend {
                message: format!("PUT {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(ForgeError::Proxmox {
                message: format!("resizing disk on VM {vmid}: HTTP {}", response.status()),
            });
        }
        tracing::info!(vmid, size = %opts.size, disk = %opts.disk, "disk resized");
        Ok(())
    }

    pub async fn update_config(
        &self,
        vmid: u32,
        opts: &VmConfigOptions,
    ) -> Result<(), ForgeError> {
        self.post_form(&format!("/nodes/{}/qemu/{vmid}/config", self.node), opts)
            .await?;
        tracing::info!(vmid, "VM options set");
        Ok(())
    }

    pub async fn start_vm(&self, vmid: u32) -> Result<(), ForgeError> {
        self.post_form(
            &format!("/nodes/{}/qemu/{vmid}/status/start", self.node),
            &NoParams {},
        )
        .await?;
        tracing::info!(vmid, "VM started");
        Ok(())
    }

    /// Poll a task every 10s until it stops or the run deadline passes.
    pub async fn wait_for_task(&self, node: &str, upid: &str) -> Result<(), ForgeError> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(self.timeout_secs);
        let spinner = ProgressBar::new_spinner();
        spinner.set_message(format!("waiting on task {upid}"));
        spinner.enable_steady_tick(Duration::from_millis(120));

        loop {
            if tokio::time::Instant::now() >= deadline {
                spinner.finish_and_clear();
                return Err(ForgeError::TaskTimeout {
                    node: node.to_string(),
                    upid: upid.to_string(),
                    timeout_secs: self.timeout_secs,
                });
            }

            let status: TaskStatusEntry = self
                .get(&format!("/nodes/{node}/tasks/{upid}/status"))
                .await?;

            if status.status == "running" {
                tracing::debug!(upid, "task still running");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }

            spinner.finish_and_clear();
            return match status.exitstatus.as_deref() {
                Some("OK") => {
                    tracing::info!(upid, "task finished OK");
                    Ok(())
                }
                other => Err(ForgeError::Proxmox {
                    message: format!("task {upid} exited {}", other.unwrap_or("without status")),
                }),
            };
        }
    }

    async fn get<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ForgeError> {
        let url = format!("{}{path}", self.base);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ForgeError::Backend {
                message: format!("GET {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(ForgeError::Proxmox {
                message: format!("GET {path} returned HTTP {}", response.status()),
            });
        }
        let body: ResponseBase<T> = response.json().await.map_err(|e| ForgeError::Proxmox {
            message: format!("decoding response from {path}: {e}"),
        })?;
        Ok(body.data)
    }

    async fn post_form<F: Serialize>(
        &self,
        path: &str,
        form: &F,
    ) -> Result<Option<String>, ForgeError> {
        let url = format!("{}{path}", self.base);
        let response = self
            .http
            .post(&url)
            .form(form)
            .send()
            .await
            .map_err(|e| ForgeError::Backend {
                message: format!("POST {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(ForgeError::Proxmox {
                message: format!("POST {path} returned HTTP {}", response.status()),
            });
        }
        let body: ResponseBase<Option<String>> =
            response.json().await.map_err(|e| ForgeError::Proxmox {
                message: format!("decoding response from {path}: {e}"),
            })?;
        Ok(body.data)
    }

    #[cfg(test)]
    fn with_index(node: &str, vms: Vec<VmEntry>) -> Self {
        ProxmoxClient {
            http: reqwest::Client::new(),
            base: String::new(),
            node: node.to_string(),
            timeout_secs: 300,
            vms: vms.into_iter().map(|vm| (vm.vmid, vm)).collect(),
        }
    }
}

impl ProvisionBackend for ProxmoxClient {
    async fn probe(&self, identity: &InstanceIdentity) -> Result<PresenceResult, ForgeError> {
        let Some(vm) = self.find_by_name(&identity.fqdn) else {
            return Ok(PresenceResult::default());
        };
        Ok(PresenceResult {
            disk_volume_exists: false,
            vm_defined: true,
            vm_active: vm.status == "running",
            vm_ref: Some(VmRef::Proxmox {
                vmid: vm.vmid,
                node: vm.node.clone(),
            }),
        })
    }

    async fn stop_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        let VmRef::Proxmox { vmid, node } = vm else {
            unreachable!("libvirt ref on proxmox backend");
        };
        let upid = self
            .post_form(&format!("/nodes/{node}/qemu/{vmid}/status/stop"), &NoParams {})
            .await?
            .ok_or_else(|| ForgeError::Proxmox {
                message: "stop returned no task id".into(),
            })?;
        self.wait_for_task(node, &upid).await?;
        tracing::info!(vmid, "stopped existing VM");
        Ok(())
    }

    async fn delete_vm(&self, vm: &VmRef) -> Result<(), ForgeError> {
        let VmRef::Proxmox { vmid, node } = vm else {
            unreachable!("libvirt ref on proxmox backend");
        };
        let url = format!("{}/nodes/{node}/qemu/{vmid}", self.base);
        let response = self
            .http
            .delete(&url)
            .query(&[("purge", "1")])
            .send()
            .await
            .map_err(|e| ForgeError::Backend {
                message: format!("DELETE {url}: {e}"),
            })?;
        if !response.status().is_success() {
            return Err(ForgeError::Proxmox {
                message: format!("deleting VM {vmid}: HTTP {}", response.status()),
            });
        }
        let body: ResponseBase<Option<String>> =
            response.json().await.map_err(|e| ForgeError::Proxmox {
                message: format!("decoding delete response: {e}"),
            })?;
        if let Some(upid) = body.data {
            self.wait_for_task(node, &upid).await?;
        }
        tracing::info!(vmid, "deleted existing VM");
        Ok(())
    }

    async fn delete_storage(&self, _identity: &InstanceIdentity) -> Result<(), ForgeError> {
        // Purge on delete removes the cloned disks; there is no separate
        // volume to clean up.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(vmid: u32, name: &str, node: &str, template: u8, status: &str) -> VmEntry {
        VmEntry {
            vmid,
            name: name.to_string(),
            template,
            status: status.to_string(),
            node: node.to_string(),
        }
    }

    fn client() -> ProxmoxClient {
        ProxmoxClient::with_index(
            "pve1",
            vec![
                entry(100, "ubuntu-tmpl", "pve1", 1, "stopped"),
                entry(101, "web.example.net", "pve1", 0, "running"),
                entry(102, "other-tmpl", "pve2", 1, "stopped"),
            ],
        )
    }

    #[test]
    fn template_lookup_matches_node_and_flag() {
        assert_eq!(client().template_vmid("ubuntu-tmpl").unwrap(), 100);
    }

    #[test]
    fn template_on_other_node_is_not_found() {
        let err = client().template_vmid("other-tmpl").unwrap_err();
        assert!(matches!(err, ForgeError::TemplateNotFound { .. }));
    }

    #[test]
    fn plain_guest_is_not_a_template() {
        let err = client().template_vmid("web.example.net").unwrap_err();
        assert!(matches!(err, ForgeError::TemplateNotFound { .. }));
    }

    #[tokio::test]
    async fn probe_answers_from_cached_index() {
        let client = client();
        let identity = InstanceIdentity {
            index: 0,
            hostname: "web".into(),
            fqdn: "web.example.net".into(),
            disk_image_name: "web.example.net.qcow2".into(),
        };
        let presence = client.probe(&identity).await.unwrap();
        assert!(presence.vm_defined);
        assert!(presence.vm_active);
        assert_eq!(
            presence.vm_ref,
            Some(VmRef::Proxmox {
                vmid: 101,
                node: "pve1".into()
            })
        );
    }

    #[tokio::test]
    async fn probe_misses_cleanly() {
        let client = client();
        let identity = InstanceIdentity {
            index: 0,
            hostname: "ghost".into(),
            fqdn: "ghost.example.net".into(),
            disk_image_name: "ghost.example.net.qcow2".into(),
        };
        let presence = client.probe(&identity).await.unwrap();
        assert!(!presence.any());
    }

    #[test]
    fn guest_listing_deserializes() {
        let json = r#"{"data":[{"vmid":100,"name":"tmpl","template":1,"status":"stopped"},{"vmid":101,"status":"running"}]}"#;
        let body: ResponseBase<Vec<VmEntry>> = serde_json::from_str(json).unwrap();
        assert_eq!(body.data.len(), 2);
        assert_eq!(body.data[0].template, 1);
        assert_eq!(body.data[1].name, "");
    }

    #[test]
    fn task_status_deserializes_without_exitstatus() {
        let json = r#"{"data":{"status":"running","pid":4321}}"#;
        let body: ResponseBase<TaskStatusEntry> = serde_json::from_str(json).unwrap();
        assert_eq!(body.data.status, "running");
        assert!(body.data.exitstatus.is_none());
    }
}
