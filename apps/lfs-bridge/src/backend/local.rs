//! Content-addressed store on local disk.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{object_path, partial_path, verify_file, Backend, ProgressReporter, TransferRequest};
use crate::error::TransferError;
use crate::validate::Oid;

const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
    verify: bool,
}

impl LocalBackend {
    pub fn new(root: impl Into<PathBuf>, verify: bool) -> Self {
        Self {
            root: root.into(),
            verify,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn object_path(&self, oid: &Oid) -> PathBuf {
        object_path(&self.root, oid)
    }

    fn tmp_path(&self, oid: &Oid) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{oid}.{}.partial", Uuid::new_v4()))
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn put(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError> {
        let source_len = match fs::metadata(&request.path).await {
            Ok(meta) if meta.is_file() => meta.len(),
            Ok(_) => {
                return Err(TransferError::InvalidRequest(format!(
                    "{} is not a regular file",
                    request.path.display()
                )));
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::InvalidRequest(format!(
                    "source file {} does not exist",
                    request.path.display()
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if source_len != request.size {
            return Err(TransferError::InvalidRequest(format!(
                "source file is {source_len} bytes but {} were declared",
                request.size
            )));
        }

        let dest = self.object_path(&request.oid);
        if let Ok(existing) = fs::metadata(&dest).await {
            if existing.is_file() && existing.len() == request.size {
                debug!(
                    target: "lfs_bridge::backend::local",
                    oid = %request.oid,
                    "object already stored"
                );
                progress.report(request.size).await;
                return Ok(());
            }
            warn!(
                target: "lfs_bridge::backend::local",
                oid = %request.oid,
                stored = existing.len(),
                declared = request.size,
                "replacing stored object with unexpected size"
            );
        }

        let tmp = self.tmp_path(&request.oid);
        let result: Result<(), TransferError> = async {
            let copied = copy_with_progress(&request.path, &tmp, progress).await?;
            if copied != request.size {
                return Err(TransferError::InvalidRequest(format!(
                    "source file changed during upload ({copied} of {} bytes)",
                    request.size
                )));
            }
            promote(&tmp, &dest).await
        }
        .await;
        if result.is_err() {
            discard(&tmp).await;
        }
        result
    }

    async fn get(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError> {
        let source = self.object_path(&request.oid);
        if !fs::try_exists(&source).await? {
            return Err(TransferError::NotFound(request.oid.to_string()));
        }

        let partial = partial_path(&request.path);
        let result: Result<(), TransferError> = async {
            copy_with_progress(&source, &partial, progress).await?;
            if self.verify {
                verify_file(&partial, &request.oid, request.size).await?;
            } else {
                let len = fs::metadata(&partial).await?.len();
                if len != request.size {
                    return Err(TransferError::Integrity(format!(
                        "object {} has {len} bytes, expected {}",
                        request.oid, request.size
                    )));
                }
            }
            promote(&partial, &request.path).await
        }
        .await;
        if result.is_err() {
            discard(&partial).await;
        }
        result
    }

    async fn exists(&self, oid: &Oid) -> Result<bool, TransferError> {
        Ok(fs::try_exists(self.object_path(oid)).await?)
    }
}

async fn copy_with_progress(
    source: &Path,
    dest: &Path,
    progress: &ProgressReporter,
) -> Result<u64, TransferError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut reader = File::open(source).await?;
    let mut writer = File::create(dest).await?;
    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut copied = 0u64;
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        writer.write_all(&buffer[..read]).await?;
        copied += read as u64;
        progress.report(copied).await;
    }
    writer.flush().await?;
    writer.sync_all().await?;
    Ok(copied)
}

async fn promote(tmp: &Path, dest: &Path) -> Result<(), TransferError> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    fs::rename(tmp, dest).await?;
    Ok(())
}

async fn discard(path: &Path) {
    if let Err(err) = fs::remove_file(path).await {
        if err.kind() != io::ErrorKind::NotFound {
            warn!(
                target: "lfs_bridge::backend::local",
                path = %path.display(),
                error = %err,
                "failed to remove partial file"
            );
        }
    }
}
