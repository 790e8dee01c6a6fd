//! Wire types for the Git LFS custom transfer protocol.
//!
//! The host (`git-lfs`) writes one JSON object per line to the agent's stdin
//! and reads one JSON object per line from its stdout. Every message carries an
//! `event` discriminator except the replies to `init`, which are either `{}` or
//! `{"error": {...}}`.
//!
//! This crate only describes the shapes; framing, validation and dispatch live
//! in the `lfs-bridge` application.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Direction negotiated for the whole session in the `init` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Upload,
    Download,
}

impl Operation {
    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Upload => "upload",
            Operation::Download => "download",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages sent by the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum HostRequest {
    Init(InitRequest),
    Upload(UploadRequest),
    Download(DownloadRequest),
    Terminate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitRequest {
    pub operation: Operation,
    pub remote: String,
    /// Older hosts omit the concurrency fields entirely.
    #[serde(default)]
    pub concurrent: bool,
    #[serde(default = "default_concurrent_transfers")]
    pub concurrenttransfers: u32,
}

fn default_concurrent_transfers() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadRequest {
    pub oid: String,
    pub size: u64,
    pub path: String,
    /// Server-supplied action metadata. `null` or absent in standalone mode.
    #[serde(default)]
    pub action: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadRequest {
    pub oid: String,
    pub size: u64,
    #[serde(default)]
    pub action: Option<Value>,
}

/// `{code, message}` pair carried by failed `init` replies and by
/// object-scoped `complete` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub code: i32,
    pub message: String,
}

impl ProtocolError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Reply to `init`: serializes to `{}` on success.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitResponse {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error: Option<ProtocolError>,
}

impl InitResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(error: ProtocolError) -> Self {
        Self { error: Some(error) }
    }
}

/// Per-object events written by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum TransferEvent {
    Progress {
        oid: String,
        #[serde(rename = "bytesSoFar")]
        bytes_so_far: u64,
        #[serde(rename = "bytesSinceLast")]
        bytes_since_last: u64,
    },
    Complete {
        oid: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        path: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<ProtocolError>,
    },
}

impl TransferEvent {
    pub fn completed(oid: impl Into<String>, path: Option<String>) -> Self {
        TransferEvent::Complete {
            oid: oid.into(),
            path,
            error: None,
        }
    }

    pub fn failed(oid: impl Into<String>, error: ProtocolError) -> Self {
        TransferEvent::Complete {
            oid: oid.into(),
            path: None,
            error: Some(error),
        }
    }
}

/// Anything the agent writes to stdout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AgentMessage {
    Transfer(TransferEvent),
    Init(InitResponse),
}

impl From<InitResponse> for AgentMessage {
    fn from(value: InitResponse) -> Self {
        AgentMessage::Init(value)
    }
}

impl From<TransferEvent> for AgentMessage {
    fn from(value: TransferEvent) -> Self {
        AgentMessage::Transfer(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_init_with_concurrency_fields() {
        let line = r#"{"event":"init","operation":"upload","remote":"origin","concurrent":true,"concurrenttransfers":3}"#;
        let request: HostRequest = serde_json::from_str(line).unwrap();
        assert_eq!(
            request,
            HostRequest::Init(InitRequest {
                operation: Operation::Upload,
                remote: "origin".into(),
                concurrent: true,
                concurrenttransfers: 3,
            })
        );
    }

    #[test]
    fn init_without_concurrency_fields_defaults_to_serial() {
        let line = r#"{"event":"init","operation":"download","remote":"origin"}"#;
        let HostRequest::Init(init) = serde_json::from_str(line).unwrap() else {
            panic!("expected init");
        };
        assert!(!init.concurrent);
        assert_eq!(init.concurrenttransfers, 1);
    }

    #[test]
    fn upload_accepts_null_action() {
        let line = r#"{"event":"upload","oid":"abc","size":5,"path":"/tmp/x","action":null}"#;
        let HostRequest::Upload(upload) = serde_json::from_str(line).unwrap() else {
            panic!("expected upload");
        };
        assert_eq!(upload.size, 5);
        assert!(upload.action.is_none());
    }

    #[test]
    fn terminate_has_no_fields() {
        let request: HostRequest = serde_json::from_str(r#"{"event":"terminate"}"#).unwrap();
        assert_eq!(request, HostRequest::Terminate);
    }

    #[test]
    fn unknown_event_is_rejected() {
        assert!(serde_json::from_str::<HostRequest>(r#"{"event":"resume"}"#).is_err());
    }

    #[test]
    fn init_ack_serializes_to_empty_object() {
        let value = serde_json::to_value(AgentMessage::from(InitResponse::ok())).unwrap();
        assert_eq!(value, json!({}));
    }

    #[test]
    fn complete_events_omit_absent_fields() {
        let upload = serde_json::to_value(TransferEvent::completed("abc", None)).unwrap();
        assert_eq!(upload, json!({"event": "complete", "oid": "abc"}));

        let failed = serde_json::to_value(TransferEvent::failed(
            "abc",
            ProtocolError::new(404, "missing"),
        ))
        .unwrap();
        assert_eq!(
            failed,
            json!({"event": "complete", "oid": "abc", "error": {"code": 404, "message": "missing"}})
        );
    }

    #[test]
    fn progress_uses_camel_case_counters() {
        let value = serde_json::to_value(TransferEvent::Progress {
            oid: "abc".into(),
            bytes_so_far: 10,
            bytes_since_last: 4,
        })
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "progress", "oid": "abc", "bytesSoFar": 10, "bytesSinceLast": 4})
        );
    }
}
