//! Storage capability seen by the engine.
//!
//! A backend either stores objects on local disk or drives the bridge
//! process. Both share the fan-out layout and the success rule: `put` only
//! succeeds once the object is durably stored, `get` only once the
//! destination file has been verified.

pub mod local;
pub mod remote;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use lfs_bridge_proto::TransferEvent;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::engine::outbound::Outbound;
use crate::error::TransferError;
use crate::validate::Oid;

pub use local::LocalBackend;
pub use remote::BridgeBackend;

const HASH_CHUNK: usize = 64 * 1024;

/// One validated unit of work.
///
/// `path` is the source file for uploads and the destination for downloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub oid: Oid,
    pub size: u64,
    pub path: PathBuf,
}

#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn put(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError>;

    async fn get(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError>;

    async fn exists(&self, oid: &Oid) -> Result<bool, TransferError>;

    /// Drops expired state. Called periodically by the engine.
    async fn sweep(&self) {}
}

/// `{root}/{oid[0:2]}/{oid[2:4]}/{oid}`
pub fn object_path(root: &Path, oid: &Oid) -> PathBuf {
    let (first, second) = oid.shards();
    root.join(first).join(second).join(oid.as_str())
}

/// Forward-slash variant of [`object_path`] for remote keys.
pub fn remote_key(base: &str, oid: &Oid) -> String {
    let (first, second) = oid.shards();
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("{first}/{second}/{oid}")
    } else {
        format!("{base}/{first}/{second}/{oid}")
    }
}

/// Sibling temp path for a download destination.
pub(crate) fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    dest.with_file_name(name)
}

/// Checks `path` holds exactly `size` bytes hashing to `oid`.
pub(crate) async fn verify_file(path: &Path, oid: &Oid, size: u64) -> Result<(), TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_CHUNK];
    let mut total = 0u64;
    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        total += read as u64;
    }
    if total != size {
        return Err(TransferError::Integrity(format!(
            "object {oid} has {total} bytes, expected {size}"
        )));
    }
    let digest = hex::encode(hasher.finalize());
    if digest != oid.as_str() {
        return Err(TransferError::Integrity(format!(
            "object {oid} content hashes to {digest}"
        )));
    }
    Ok(())
}

/// Per-transfer progress sink.
///
/// Values that do not advance are dropped, so the host only ever sees a
/// strictly increasing `bytesSoFar`.
#[derive(Debug)]
pub struct ProgressReporter {
    sink: Option<(String, Outbound)>,
    reported: AtomicU64,
}

impl ProgressReporter {
    pub fn new(oid: impl Into<String>, outbound: Outbound) -> Self {
        Self {
            sink: Some((oid.into(), outbound)),
            reported: AtomicU64::new(0),
        }
    }

    pub fn disabled() -> Self {
        Self {
            sink: None,
            reported: AtomicU64::new(0),
        }
    }

    pub fn reported(&self) -> u64 {
        self.reported.load(Ordering::Acquire)
    }

    pub async fn report(&self, bytes_so_far: u64) {
        let previous = self.reported.fetch_max(bytes_so_far, Ordering::AcqRel);
        if bytes_so_far <= previous {
            return;
        }
        let Some((oid, outbound)) = &self.sink else {
            return;
        };
        let event = TransferEvent::Progress {
            oid: oid.clone(),
            bytes_so_far,
            bytes_since_last: bytes_so_far - previous,
        };
        // A closed stream is noticed when the completion is sent.
        let _ = outbound.send(event).await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::engine::outbound::spawn_writer;
    use crate::validate::validate_oid;
    use tokio::io::{AsyncBufReadExt, BufReader};

    pub(crate) fn sha256_oid(data: &[u8]) -> Oid {
        validate_oid(&hex::encode(Sha256::digest(data))).unwrap()
    }

    #[test]
    fn object_path_fans_out_two_levels() {
        let oid = validate_oid(&"ab".repeat(32)).unwrap();
        let path = object_path(Path::new("/store"), &oid);
        assert_eq!(
            path,
            Path::new("/store/ab/ab").join("ab".repeat(32))
        );
    }

    #[test]
    fn remote_key_joins_base_without_double_slash() {
        let oid = validate_oid(&"0123456789abcdef".repeat(4)).unwrap();
        let expected = format!("vault/lfs/01/23/{oid}");
        assert_eq!(remote_key("vault/lfs/", &oid), expected);
        assert_eq!(remote_key("vault/lfs", &oid), expected);
        assert_eq!(remote_key("", &oid), format!("01/23/{oid}"));
    }

    #[test]
    fn partial_path_is_a_sibling() {
        assert_eq!(
            partial_path(Path::new("/tmp/dl/abc")),
            PathBuf::from("/tmp/dl/abc.partial")
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn verify_file_checks_size_and_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        tokio::fs::write(&path, b"hello").await.unwrap();
        let oid = sha256_oid(b"hello");

        verify_file(&path, &oid, 5).await.unwrap();
        let short = verify_file(&path, &oid, 4).await.unwrap_err();
        assert!(matches!(short, TransferError::Integrity(_)), "{short:?}");

        let other = sha256_oid(b"world");
        let mismatch = verify_file(&path, &other, 5).await.unwrap_err();
        assert!(matches!(mismatch, TransferError::Integrity(_)), "{mismatch:?}");
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn progress_is_strictly_increasing() {
        let (agent, host) = tokio::io::duplex(4096);
        let (outbound, task) = spawn_writer(agent);
        let progress = ProgressReporter::new("abc", outbound);

        progress.report(4).await;
        progress.report(4).await;
        progress.report(2).await;
        progress.report(10).await;
        assert_eq!(progress.reported(), 10);
        drop(progress);
        task.await.unwrap().unwrap();

        let mut lines = BufReader::new(host).lines();
        let mut events = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            events.push(serde_json::from_str::<TransferEvent>(&line).unwrap());
        }
        assert_eq!(
            events,
            vec![
                TransferEvent::Progress {
                    oid: "abc".into(),
                    bytes_so_far: 4,
                    bytes_since_last: 4,
                },
                TransferEvent::Progress {
                    oid: "abc".into(),
                    bytes_so_far: 10,
                    bytes_since_last: 6,
                },
            ]
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn disabled_reporter_still_tracks_value() {
        let progress = ProgressReporter::disabled();
        progress.report(7).await;
        assert_eq!(progress.reported(), 7);
    }
}
