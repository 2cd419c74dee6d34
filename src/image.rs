//! Base image handling: release image downloads, golden image conversion
//! and per-instance copy-on-write disks.

use std::path::Path;
use std::time::{Duration, SystemTime};

use futures_util::StreamExt;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::io::AsyncWriteExt;

use crate::error::ForgeError;
use crate::tools;

/// Download a response body to a file, updating the progress bar as chunks
/// arrive.
async fn download_to_file(
    path: &Path,
    response: reqwest::Response,
    pb: &ProgressBar,
) -> Result<(), ForgeError> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("creating temp file {}", path.display()),
            source: e,
        })?;

    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ForgeError::Download {
            url: "response body".into(),
            message: e.to_string(),
        })?;
        file.write_all(&chunk).await.map_err(|e| ForgeError::Io {
            context: "writing image data".into(),
            source: e,
        })?;
        pb.inc(chunk.len() as u64);
    }

    file.flush().await.map_err(|e| ForgeError::Io {
        context: "flushing image file".into(),
        source: e,
    })?;

    Ok(())
}

/// Download `url` to `dest` unless it already exists. Partial downloads go
/// to a `.part` file that is renamed only on success.
pub async fn ensure_download(url: &str, dest: &Path) -> Result<(), ForgeError> {
    if dest.exists() {
        tracing::info!(path = %dest.display(), "image already downloaded, skipping");
        return Ok(());
    }

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| ForgeError::Io {
                context: format!("creating directory {}", parent.display()),
                source: e,
            })?;
    }

    tracing::info!(url, path = %dest.display(), "downloading image");

    let response = reqwest::get(url).await.map_err(|e| ForgeError::Download {
        url: url.to_string(),
        message: e.to_string(),
    })?;

    if !response.status().is_success() {
        return Err(ForgeError::Download {
            url: url.to_string(),
            message: format!("HTTP {}", response.status()),
        });
    }

    let total_size = response.content_length().unwrap_or(0);
    let pb = ProgressBar::new(total_size);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .expect("valid progress template")
            .progress_chars("#>-"),
    );

    let tmp_path = dest.with_extension("part");

    // Remove any stale .part file from a previous failed download
    let _ = tokio::fs::remove_file(&tmp_path).await;

    if let Err(e) = download_to_file(&tmp_path, response, &pb).await {
        let _ = tokio::fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    tokio::fs::rename(&tmp_path, dest)
        .await
        .map_err(|e| ForgeError::Io {
            context: format!("renaming {} to {}", tmp_path.display(), dest.display()),
            source: e,
        })?;

    pb.finish_and_clear();
    tracing::info!(path = %dest.display(), "image downloaded");

    Ok(())
}

/// Whether `path` was modified more than `age_days` days ago. Missing
/// files count as stale.
pub fn older_than_days(path: &Path, age_days: u64) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    match SystemTime::now().duration_since(modified) {
        Ok(age) => age > Duration::from_secs(age_days * 24 * 60 * 60),
        Err(_) => false,
    }
}

/// `qemu-img convert -O qcow2 src dest` — produce a golden image from a
/// release image.
pub async fn convert_to_qcow2(src: &Path, dest: &Path) -> Result<(), ForgeError> {
    let args = vec![
        "convert".to_string(),
        "-O".to_string(),
        "qcow2".to_string(),
        src.display().to_string(),
        dest.display().to_string(),
    ];
    tools::run_checked("qemu-img", &args).await?;
    tracing::info!(path = %dest.display(), "created golden image");
    Ok(())
}

/// Create a copy-on-write qcow2 disk backed by `backing`, optionally grown
/// to `size_gb`.
pub async fn create_backed_qcow2(
    backing: &Path,
    dest: &Path,
    size_gb: Option<u32>,
) -> Result<(), ForgeError> {
    let mut args = vec![
        "create".to_string(),
        "-f".to_string(),
        "qcow2".to_string(),
        "-b".to_string(),
        backing.display().to_string(),
        "-F".to_string(),
        "qcow2".to_string(),
        dest.display().to_string(),
    ];
    if let Some(gb) = size_gb {
        args.push(format!("{gb}G"));
    }
    tools::run_checked("qemu-img", &args).await?;
    tracing::info!(path = %dest.display(), "created instance disk");
    Ok(())
}

/// `bzip2 -d -k path` — decompress next to the original, keeping it for
/// the age check on later runs.
pub async fn decompress_bz2(path: &Path) -> Result<(), ForgeError> {
    let args = vec![
        "-d".to_string(),
        "-k".to_string(),
        path.display().to_string(),
    ];
    tools::run_checked("bzip2", &args).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_counts_as_stale() {
        assert!(older_than_days(Path::new("/nonexistent/image.bz2"), 7));
    }

    #[test]
    fn fresh_file_is_not_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("image");
        std::fs::write(&path, b"data").unwrap();
        assert!(!older_than_days(&path, 1));
    }
}
