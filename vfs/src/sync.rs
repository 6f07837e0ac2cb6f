//! Mirror a local directory tree into a virtual folder.
//!
//! Every regular file below the local root is uploaded to the same relative
//! path under the remote folder, creating folders as needed. Files already
//! present remotely are left alone, so an interrupted sync can simply be run
//! again.

use common::{join_path, Error, Result, UPLOAD_CHUNK};
use futures::{StreamExt, TryStreamExt};
use std::path::{Path, PathBuf};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

use crate::{FileSystem, WriteOutcome};

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Delete each local file once it is stored
    pub delete_original: bool,
    pub mime: String,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            delete_original: false,
            mime: "application/octet-stream".to_string(),
        }
    }
}

/// Remote paths, grouped by what happened to them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<String>,
    pub aborted: bool,
}

/// Regular files below `root` with their `/`-joined relative paths, in name order
fn local_files(root: &Path) -> Vec<(PathBuf, String)> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!("skipping unreadable path: {}", err);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        files.push((entry.path().to_path_buf(), relative.join("/")));
    }
    files
}

/// Upload every file under `local_dir` that `remote_dir` does not hold yet
pub async fn sync_dir(
    fs: &dyn FileSystem,
    local_dir: &Path,
    remote_dir: &str,
    options: &SyncOptions,
    abort: CancellationToken,
) -> Result<SyncReport> {
    if !local_dir.is_dir() {
        return Err(Error::InvalidPath(format!(
            "{} is not a local directory",
            local_dir.display()
        )));
    }
    let root = fs.mkdir_all(remote_dir).await?;
    tracing::info!("syncing {} into {} ({})", local_dir.display(), remote_dir, root.id);

    let walk_root = local_dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || local_files(&walk_root))
        .await
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    tracing::info!("found {} local files", files.len());

    let mut report = SyncReport::default();
    for (local, relative) in files {
        if abort.is_cancelled() {
            report.aborted = true;
            break;
        }
        let remote = join_path(remote_dir, &relative);
        match fs.stat(&remote).await {
            Ok(existing) if !existing.is_temp() => {
                tracing::debug!("{} already exists as {}", remote, existing.id);
                report.skipped.push(remote);
                continue;
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        match upload_one(fs, &local, &remote, options, abort.clone()).await {
            Ok(true) => {
                if options.delete_original {
                    tokio::fs::remove_file(&local).await?;
                    tracing::debug!("deleted local {}", local.display());
                }
                report.uploaded.push(remote);
            }
            Ok(false) => {
                report.aborted = true;
                break;
            }
            Err(e) => {
                tracing::warn!("{} could not be synced: {}", remote, e);
                discard_partial(fs, &remote).await;
                report.failed.push(remote);
            }
        }
    }

    tracing::info!(
        "sync finished: {} uploaded, {} skipped, {} failed{}",
        report.uploaded.len(),
        report.skipped.len(),
        report.failed.len(),
        if report.aborted { ", aborted" } else { "" }
    );
    Ok(report)
}

/// Returns false when the upload was aborted
async fn upload_one(
    fs: &dyn FileSystem,
    local: &Path,
    remote: &str,
    options: &SyncOptions,
    abort: CancellationToken,
) -> Result<bool> {
    let (parent, _) = common::split_parent(remote)?;
    fs.mkdir_all(&parent).await?;

    let file = tokio::fs::File::open(local).await?;
    let source = ReaderStream::with_capacity(file, UPLOAD_CHUNK)
        .map_err(Error::from)
        .boxed();
    match fs.write(remote, &options.mime, source, abort).await? {
        WriteOutcome::Created(entry) => {
            tracing::info!("{} stored as {} ({} bytes)", local.display(), entry.id, entry.size());
            Ok(true)
        }
        WriteOutcome::Aborted => Ok(false),
    }
}

/// Drop whatever a failed upload left at `remote`
async fn discard_partial(fs: &dyn FileSystem, remote: &str) {
    match fs.stat(remote).await {
        Ok(entry) if entry.is_temp() => {
            if let Err(e) = fs.remove(remote, false).await {
                tracing::warn!("could not remove partial {}: {}", remote, e);
            }
        }
        _ => {}
    }
}
