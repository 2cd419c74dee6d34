//! Operator SSH public keys, injected into cloud-init and Ignition
//! documents so the first login works.

use std::path::Path;

use crate::error::ForgeError;

const KEY_FILES: &[&str] = &["id_ed25519.pub", "id_rsa.pub", "authorized_keys"];

/// Collect the operator's public keys from `~/.ssh`. Not finding any is
/// fatal: a cloud image without keys is unreachable.
pub fn local_public_keys() -> Result<Vec<String>, ForgeError> {
    let Some(home) = dirs::home_dir() else {
        return Err(ForgeError::Config {
            message: "cannot locate home directory to read SSH keys from".into(),
        });
    };

    let mut keys = Vec::new();
    for file in KEY_FILES {
        let path = home.join(".ssh").join(file);
        if let Ok(contents) = std::fs::read_to_string(&path) {
            keys.extend(
                contents
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty())
                    .map(String::from),
            );
        }
    }

    if keys.is_empty() {
        return Err(ForgeError::Config {
            message: "unable to read any SSH public keys from ~/.ssh \
                      (do you need to create one?)"
                .into(),
        });
    }
    Ok(keys)
}

/// Read SSH keys from a local path or fetch them from a URL.
pub async fn load_keys(source: &str) -> Result<String, ForgeError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source)
            .await
            .map_err(|e| ForgeError::Download {
                url: source.to_string(),
                message: e.to_string(),
            })?;
        if !response.status().is_success() {
            return Err(ForgeError::Download {
                url: source.to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }
        response.text().await.map_err(|e| ForgeError::Download {
            url: source.to_string(),
            message: e.to_string(),
        })
    } else {
        std::fs::read_to_string(Path::new(source)).map_err(|e| ForgeError::Io {
            context: format!("reading SSH keys from {source}"),
            source: e,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn load_keys_reads_local_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys");
        std::fs::write(&path, "ssh-ed25519 AAAA test\n").unwrap();
        let keys = load_keys(path.to_str().unwrap()).await.unwrap();
        assert!(keys.contains("ssh-ed25519"));
    }

    #[tokio::test]
    async fn load_keys_missing_file_is_io_error() {
        let err = load_keys("/nonexistent/keys").await.unwrap_err();
        assert!(matches!(err, ForgeError::Io { .. }));
    }
}
