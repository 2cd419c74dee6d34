//! Runner for the external binaries vmforge drives: virt-install, virsh,
//! qemu-img, cloud-localds, bzip2 and the CoreOS config transpiler.

use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::error::ForgeError;

/// Run a tool to completion, failing with the tool's stderr on a non-zero
/// exit. Returns captured stdout.
pub async fn run_checked(tool: &str, args: &[String]) -> Result<String, ForgeError> {
    tracing::debug!(tool, ?args, "executing");
    let output = Command::new(tool)
        .args(args)
        .output()
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("spawning {tool}"),
            source: e,
        })?;

    if !output.status.success() {
        return Err(ForgeError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Run a tool with `input` piped to stdin, returning stdout.
pub async fn run_with_stdin(
    tool: &str,
    args: &[String],
    input: &str,
) -> Result<String, ForgeError> {
    tracing::debug!(tool, ?args, "executing with piped stdin");
    let mut child = Command::new(tool)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| ForgeError::Io {
            context: format!("spawning {tool}"),
            source: e,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(input.as_bytes())
            .await
            .map_err(|e| ForgeError::Io {
                context: format!("writing to {tool} stdin"),
                source: e,
            })?;
    }

    let output = child.wait_with_output().await.map_err(|e| ForgeError::Io {
        context: format!("waiting for {tool}"),
        source: e,
    })?;

    if !output.status.success() {
        return Err(ForgeError::ExternalTool {
            tool: tool.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
