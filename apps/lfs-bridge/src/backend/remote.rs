//! Backend that stores objects through the bridge process.

use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use time::{Duration as LeaseDuration, OffsetDateTime};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{partial_path, remote_key, verify_file, Backend, ProgressReporter, TransferRequest};
use crate::bridge::BridgeClient;
use crate::error::TransferError;
use crate::validate::Oid;

/// Lifetime assumed when `auth` returns a session without an expiry.
pub const DEFAULT_LEASE_TTL: LeaseDuration = LeaseDuration::minutes(15);

/// Session handle handed out by the bridge's `auth` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthLease {
    pub session: String,
    pub expires_at: OffsetDateTime,
}

impl AuthLease {
    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum LeaseState {
    Unknown,
    /// The bridge authenticates on every call by itself.
    PerCall,
    Held(AuthLease),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthPayload {
    #[serde(default)]
    session: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    expires_at: Option<OffsetDateTime>,
}

#[derive(Debug, Deserialize)]
struct StoredPayload {
    #[serde(default)]
    oid: Option<String>,
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ExistsPayload {
    exists: bool,
}

pub struct BridgeBackend {
    client: Arc<BridgeClient>,
    credential_provider: String,
    remote_base: String,
    verify: bool,
    lease: Mutex<LeaseState>,
}

impl BridgeBackend {
    pub fn new(
        client: Arc<BridgeClient>,
        credential_provider: impl Into<String>,
        remote_base: impl Into<String>,
        verify: bool,
    ) -> Self {
        Self {
            client,
            credential_provider: credential_provider.into(),
            remote_base: remote_base.into(),
            verify,
            lease: Mutex::new(LeaseState::Unknown),
        }
    }

    pub async fn current_lease(&self) -> Option<AuthLease> {
        match &*self.lease.lock().await {
            LeaseState::Held(lease) => Some(lease.clone()),
            _ => None,
        }
    }

    /// Returns the session to forward, authenticating first if needed.
    async fn session(&self) -> Result<Option<String>, TransferError> {
        let mut state = self.lease.lock().await;
        match &*state {
            LeaseState::PerCall => return Ok(None),
            LeaseState::Held(lease) if !lease.is_expired_at(OffsetDateTime::now_utc()) => {
                return Ok(Some(lease.session.clone()));
            }
            _ => {}
        }

        let payload = json!({ "credentialProvider": self.credential_provider });
        let response = self.client.call("auth", payload, None).await?;
        let auth: AuthPayload = serde_json::from_value(response).map_err(|err| {
            TransferError::Internal(format!("malformed auth response from bridge: {err}"))
        })?;

        match auth.session {
            Some(session) => {
                let expires_at = auth
                    .expires_at
                    .unwrap_or_else(|| OffsetDateTime::now_utc() + DEFAULT_LEASE_TTL);
                info!(
                    target: "lfs_bridge::backend::bridge",
                    expires_at = %expires_at,
                    "obtained bridge session lease"
                );
                *state = LeaseState::Held(AuthLease {
                    session: session.clone(),
                    expires_at,
                });
                Ok(Some(session))
            }
            None => {
                debug!(
                    target: "lfs_bridge::backend::bridge",
                    "bridge authenticates per call; no lease held"
                );
                *state = LeaseState::PerCall;
                Ok(None)
            }
        }
    }

    async fn payload(&self, oid: &Oid, fields: Value) -> Result<Value, TransferError> {
        let mut map = Map::new();
        map.insert("oid".into(), Value::String(oid.to_string()));
        map.insert(
            "remotePath".into(),
            Value::String(remote_key(&self.remote_base, oid)),
        );
        map.insert(
            "credentialProvider".into(),
            Value::String(self.credential_provider.clone()),
        );
        if let Some(session) = self.session().await? {
            map.insert("session".into(), Value::String(session));
        }
        if let Value::Object(extra) = fields {
            map.extend(extra);
        }
        Ok(Value::Object(map))
    }
}

#[async_trait]
impl Backend for BridgeBackend {
    fn name(&self) -> &'static str {
        "bridge"
    }

    async fn put(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError> {
        let source_len = tokio::fs::metadata(&request.path)
            .await
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => TransferError::InvalidRequest(format!(
                    "source file {} does not exist",
                    request.path.display()
                )),
                _ => TransferError::Io(err),
            })?
            .len();
        if source_len != request.size {
            return Err(TransferError::InvalidRequest(format!(
                "source file is {source_len} bytes but {} were declared",
                request.size
            )));
        }

        let payload = self
            .payload(
                &request.oid,
                json!({
                    "size": request.size,
                    "localPath": request.path.display().to_string(),
                }),
            )
            .await?;
        let response = self.client.call("upload", payload, None).await?;
        confirm_stored(&request.oid, request.size, response)?;
        progress.report(request.size).await;
        Ok(())
    }

    async fn get(
        &self,
        request: &TransferRequest,
        progress: &ProgressReporter,
    ) -> Result<(), TransferError> {
        if let Some(parent) = request.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = partial_path(&request.path);
        let payload = self
            .payload(
                &request.oid,
                json!({
                    "size": request.size,
                    "localPath": partial.display().to_string(),
                }),
            )
            .await?;

        let result: Result<(), TransferError> = async {
            self.client.call("download", payload, None).await?;
            self.check_download(&partial, request).await?;
            tokio::fs::rename(&partial, &request.path).await?;
            Ok(())
        }
        .await;

        match result {
            Ok(()) => {
                progress.report(request.size).await;
                Ok(())
            }
            Err(err) => {
                if let Err(remove) = tokio::fs::remove_file(&partial).await {
                    if remove.kind() != io::ErrorKind::NotFound {
                        warn!(
                            target: "lfs_bridge::backend::bridge",
                            path = %partial.display(),
                            error = %remove,
                            "failed to remove partial download"
                        );
                    }
                }
                Err(err)
            }
        }
    }

    async fn exists(&self, oid: &Oid) -> Result<bool, TransferError> {
        let payload = self.payload(oid, json!({})).await?;
        let response = self.client.call("exists", payload, None).await?;
        let parsed: ExistsPayload = serde_json::from_value(response).map_err(|err| {
            TransferError::Internal(format!("malformed exists response from bridge: {err}"))
        })?;
        Ok(parsed.exists)
    }

    async fn sweep(&self) {
        // An `auth` call holds the lease across a bridge round trip.
        let Ok(mut state) = self.lease.try_lock() else {
            debug!(
                target: "lfs_bridge::backend::bridge",
                "lease busy; skipping sweep"
            );
            return;
        };
        if let LeaseState::Held(lease) = &*state {
            if lease.is_expired_at(OffsetDateTime::now_utc()) {
                debug!(
                    target: "lfs_bridge::backend::bridge",
                    expired_at = %lease.expires_at,
                    "dropping expired bridge session lease"
                );
                *state = LeaseState::Unknown;
            }
        }
    }
}

impl BridgeBackend {
    async fn check_download(
        &self,
        partial: &Path,
        request: &TransferRequest,
    ) -> Result<(), TransferError> {
        let len = match tokio::fs::metadata(partial).await {
            Ok(meta) => meta.len(),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(TransferError::Integrity(format!(
                    "bridge reported success but wrote no file for {}",
                    request.oid
                )));
            }
            Err(err) => return Err(err.into()),
        };
        if self.verify {
            verify_file(partial, &request.oid, request.size).await
        } else if len != request.size {
            Err(TransferError::Integrity(format!(
                "object {} has {len} bytes, expected {}",
                request.oid, request.size
            )))
        } else {
            Ok(())
        }
    }
}

/// An upload only counts once the bridge echoes the object back.
fn confirm_stored(oid: &Oid, size: u64, response: Value) -> Result<(), TransferError> {
    let stored: StoredPayload = serde_json::from_value(response).map_err(|err| {
        TransferError::Internal(format!("malformed upload response from bridge: {err}"))
    })?;
    match stored.oid {
        Some(echoed) if echoed.eq_ignore_ascii_case(oid.as_str()) => {}
        Some(echoed) => {
            return Err(TransferError::Integrity(format!(
                "bridge confirmed {echoed} while storing {oid}"
            )));
        }
        None => {
            return Err(TransferError::Integrity(format!(
                "bridge did not confirm storage of {oid}"
            )));
        }
    }
    match stored.size {
        Some(echoed) if echoed != size => Err(TransferError::Integrity(format!(
            "bridge stored {echoed} bytes for {oid}, expected {size}"
        ))),
        _ => Ok(()),
    }
}
