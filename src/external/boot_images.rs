//! The local boot image store.
//!
//! Images live under a fixed directory layout,
//! `<root>/current/{osystem}/{arch}/{subarch}/{release}/{label}/{purpose}`,
//! written by the importer and read by the TFTP/HTTP boot path. Listing is a
//! directory walk; importing shells out to the importer with the requested
//! sources on stdin.

use async_trait::async_trait;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

use crate::rpc::messages::{BootImage, BootSource};

#[derive(Debug, Error)]
pub enum BootImageError {
    #[error("cannot read boot image store: {0}")]
    Read(#[from] std::io::Error),
    #[error("importer failed: {0}")]
    Import(String),
}

#[async_trait]
pub trait BootImageStore: Send + Sync {
    async fn list(&self) -> Result<Vec<BootImage>, BootImageError>;
    /// Kick off an import in the background. A second call while one runs is
    /// a no-op; the region polls `import_running` to find out.
    async fn start_import(
        &self,
        sources: Vec<BootSource>,
        http_proxy: Option<String>,
        https_proxy: Option<String>,
    ) -> Result<(), BootImageError>;
    fn import_running(&self) -> bool;
}

pub struct FilesystemBootImageStore {
    root: PathBuf,
    import_command: String,
    importing: Arc<AtomicBool>,
}

impl FilesystemBootImageStore {
    pub fn new(root: PathBuf, import_command: String) -> Self {
        Self {
            root,
            import_command,
            importing: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl BootImageStore for FilesystemBootImageStore {
    async fn list(&self) -> Result<Vec<BootImage>, BootImageError> {
        let root = self.root.join("current");
        tokio::task::spawn_blocking(move || walk_images(&root))
            .await
            .map_err(|e| BootImageError::Import(e.to_string()))?
    }

    async fn start_import(
        &self,
        sources: Vec<BootSource>,
        http_proxy: Option<String>,
        https_proxy: Option<String>,
    ) -> Result<(), BootImageError> {
        if self.importing.swap(true, Ordering::AcqRel) {
            info!("boot image import already running");
            return Ok(());
        }
        let command = self.import_command.clone();
        let importing = self.importing.clone();
        let manifest = json!({
            "sources": sources,
            "http_proxy": http_proxy,
            "https_proxy": https_proxy,
        });
        tokio::spawn(async move {
            let result = run_importer(&command, &manifest.to_string()).await;
            importing.store(false, Ordering::Release);
            match result {
                Ok(()) => info!("boot image import finished"),
                Err(err) => warn!(%err, "boot image import failed"),
            }
        });
        Ok(())
    }

    fn import_running(&self) -> bool {
        self.importing.load(Ordering::Acquire)
    }
}

async fn run_importer(command: &str, manifest: &str) -> Result<(), BootImageError> {
    use tokio::io::AsyncWriteExt;

    let mut child = tokio::process::Command::new(command)
        .stdin(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BootImageError::Import(format!("cannot start importer: {e}")))?;
    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(manifest.as_bytes())
            .await
            .map_err(|e| BootImageError::Import(e.to_string()))?;
    }
    let status = child
        .wait()
        .await
        .map_err(|e| BootImageError::Import(e.to_string()))?;
    if !status.success() {
        return Err(BootImageError::Import(format!(
            "importer exited with {status}"
        )));
    }
    Ok(())
}

fn walk_images(root: &std::path::Path) -> Result<Vec<BootImage>, BootImageError> {
    let mut images = Vec::new();
    let Ok(osystems) = std::fs::read_dir(root) else {
        // An empty or missing store means no images yet, not an error.
        return Ok(images);
    };
    for osystem in dirs(osystems) {
        for arch in dirs_in(&osystem)? {
            for subarch in dirs_in(&arch)? {
                for release in dirs_in(&subarch)? {
                    for label in dirs_in(&release)? {
                        for purpose in dirs_in(&label)? {
                            images.push(BootImage {
                                osystem: name_of(&osystem),
                                architecture: name_of(&arch),
                                subarchitecture: name_of(&subarch),
                                release: name_of(&release),
                                label: name_of(&label),
                                purpose: name_of(&purpose),
                            });
                        }
                    }
                }
            }
        }
    }
    images.sort_by(|a, b| {
        (&a.osystem, &a.architecture, &a.release).cmp(&(&b.osystem, &b.architecture, &b.release))
    });
    Ok(images)
}

fn dirs(entries: std::fs::ReadDir) -> Vec<PathBuf> {
    entries
        .flatten()
        .filter(|e| e.path().is_dir())
        .map(|e| e.path())
        .collect()
}

fn dirs_in(path: &std::path::Path) -> Result<Vec<PathBuf>, BootImageError> {
    Ok(dirs(std::fs::read_dir(path)?))
}

fn name_of(path: &std::path::Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
