use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ForgeError {
    /// Incomplete or contradictory command-line configuration. Detected
    /// before any backend connection is attempted.
    #[error("configuration error: {message}")]
    Config { message: String },

    #[error("'{name}' already exists on {host}")]
    #[diagnostic(help("pass --delete-if-exists to tear down the existing VM and its disk image"))]
    ResourceConflict { name: String, host: String },

    #[error("backend unavailable: {message}")]
    Backend { message: String },

    #[error("libvirt operation failed: {message}")]
    #[diagnostic(help("{hint}"))]
    Libvirt { message: String, hint: String },

    #[error("proxmox API error: {message}")]
    Proxmox { message: String },

    #[error("task {upid} on node {node} did not finish within {timeout_secs}s")]
    TaskTimeout {
        node: String,
        upid: String,
        timeout_secs: u64,
    },

    #[error("{tool} exited with {status}")]
    #[diagnostic(help("{stderr}"))]
    ExternalTool {
        tool: String,
        status: String,
        stderr: String,
    },

    #[error("address range exhausted: no usable host at offset {offset} of {base}/{prefix}")]
    AddressRangeExhausted {
        base: String,
        prefix: u8,
        offset: u32,
    },

    #[error("invalid network specification: {message}")]
    InvalidNetworkSpec { message: String },

    #[error("no template VM named '{template}' found on node {node}")]
    TemplateNotFound { template: String, node: String },

    #[error("failed to download {url}: {message}")]
    Download { url: String, message: String },

    #[error("{context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}
