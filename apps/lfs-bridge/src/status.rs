//! Liveness file for external observers (tray icons, editors, scripts).
//!
//! The snapshot is rewritten after every transition. Readers only ever see a
//! complete file because each write goes to a temp file that is renamed over
//! the previous one.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lfs_bridge_proto::Operation;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusState {
    Idle,
    Transferring,
    Ok,
    Error,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: StatusState,
    pub last_object_id: Option<String>,
    pub last_operation: Option<Operation>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub error_code: Option<i32>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Default)]
struct PublisherState {
    last: Option<StatusSnapshot>,
}

#[derive(Debug)]
pub struct StatusPublisher {
    path: Option<PathBuf>,
    state: Mutex<PublisherState>,
}

impl StatusPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            state: Mutex::new(PublisherState::default()),
        }
    }

    /// A publisher that tracks snapshots but never touches the filesystem.
    pub fn disabled() -> Self {
        Self {
            path: None,
            state: Mutex::new(PublisherState::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn last(&self) -> Option<StatusSnapshot> {
        self.state.lock().last.clone()
    }

    pub fn idle(&self) {
        self.publish(StatusState::Idle, None, None, None);
    }

    pub fn transferring(&self, oid: &str, operation: Operation) {
        self.publish(StatusState::Transferring, Some(oid), Some(operation), None);
    }

    pub fn succeeded(&self, oid: &str, operation: Operation) {
        self.publish(StatusState::Ok, Some(oid), Some(operation), None);
    }

    pub fn failed(&self, oid: &str, operation: Operation, code: i32, detail: &str) {
        self.publish(
            StatusState::Error,
            Some(oid),
            Some(operation),
            Some((code, detail)),
        );
    }

    /// Final state; keeps the last object so observers can show it.
    pub fn stopped(&self) {
        let mut state = self.state.lock();
        let (oid, operation) = match &state.last {
            Some(last) => (last.last_object_id.clone(), last.last_operation),
            None => (None, None),
        };
        let snapshot = StatusSnapshot {
            state: StatusState::Stopped,
            last_object_id: oid,
            last_operation: operation,
            timestamp: next_timestamp(state.last.as_ref()),
            error_code: None,
            error_detail: None,
        };
        self.store(&mut state, snapshot);
    }

    fn publish(
        &self,
        status: StatusState,
        oid: Option<&str>,
        operation: Option<Operation>,
        error: Option<(i32, &str)>,
    ) {
        let mut state = self.state.lock();
        let snapshot = StatusSnapshot {
            state: status,
            last_object_id: oid.map(str::to_owned),
            last_operation: operation,
            timestamp: next_timestamp(state.last.as_ref()),
            error_code: error.map(|(code, _)| code),
            error_detail: error.map(|(_, detail)| detail.to_owned()),
        };
        self.store(&mut state, snapshot);
    }

    fn store(&self, state: &mut PublisherState, snapshot: StatusSnapshot) {
        if let Some(path) = &self.path {
            // The lock is held across the write so files land in timestamp
            // order.
            if let Err(err) = write_atomically(path, &snapshot) {
                warn!(
                    target: "lfs_bridge::status",
                    path = %path.display(),
                    error = %err,
                    "failed to publish status"
                );
            }
        }
        state.last = Some(snapshot);
    }
}

fn next_timestamp(last: Option<&StatusSnapshot>) -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    match last {
        Some(last) if now <= last.timestamp => last.timestamp + Duration::microseconds(1),
        _ => now,
    }
}

fn write_atomically(path: &Path, snapshot: &StatusSnapshot) -> io::Result<()> {
    let bytes = serde_json::to_vec_pretty(snapshot).map_err(io::Error::other)?;
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "status".to_string());
    let tmp = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    // No fsync: the file is advisory and only the rename has to be atomic.
    let written = File::create(&tmp).and_then(|mut file| file.write_all(&bytes));
    if let Err(err) = written.and_then(|()| fs::rename(&tmp, path)) {
        let _ = fs::remove_file(&tmp);
        return Err(err);
    }
    Ok(())
}
