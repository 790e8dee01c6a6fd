//! Client for the external capability process ("the bridge").
//!
//! Each logical call spawns one child, writes a single JSON request to its
//! stdin, waits for it to exit and recovers the response envelope from its
//! output. This is the only place in the adapter that starts processes.

pub mod codec;
pub mod env;
pub mod pool;

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use self::codec::{BridgeEnvelope, CodecError};
use self::env::EnvAllowlist;
use self::pool::SlotPool;

pub const DEFAULT_POOL_SIZE: usize = 10;
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(300);
/// Code reported when a child dies without producing an envelope.
pub const FALLBACK_ERROR_CODE: i64 = 500;
/// Per-stream capture limit. The envelope is at the end, so the head is
/// what gets discarded.
const MAX_CAPTURED_OUTPUT: usize = 8 * 1024 * 1024;
const READ_CHUNK: usize = 16 * 1024;
/// How long output pipes may stay open after the child exited. A descendant
/// that inherited them (a backgrounded helper, a build server) can hold them
/// indefinitely, and the envelope is already buffered by then.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: EnvAllowlist,
    pub timeout: Duration,
    pub pool_size: usize,
}

impl BridgeConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: EnvAllowlist::default(),
            timeout: DEFAULT_CALL_TIMEOUT,
            pool_size: DEFAULT_POOL_SIZE,
        }
    }
}

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("too many concurrent operations (limit {limit})")]
    TooManyConcurrentOperations { limit: usize },
    #[error("bridge command '{command}' timed out after {}ms", .timeout.as_millis())]
    Timeout { command: String, timeout: Duration },
    #[error("failed to spawn bridge '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("bridge i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("malformed bridge output: {0}")]
    MalformedOutput(#[from] CodecError),
    #[error("bridge command '{command}' failed with code {code}: {error}")]
    Remote {
        command: String,
        code: i64,
        error: String,
        details: String,
    },
}

struct ChildOutput {
    exit_code: Option<i32>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

pub struct BridgeClient {
    config: BridgeConfig,
    pool: SlotPool,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig) -> Self {
        let pool = SlotPool::new(config.pool_size);
        Self { config, pool }
    }

    pub fn capacity(&self) -> usize {
        self.pool.capacity()
    }

    pub fn engaged(&self) -> usize {
        self.pool.engaged()
    }

    /// Runs `command` in a fresh child and returns the success payload.
    ///
    /// `timeout` overrides the configured per-call timeout.
    pub async fn call(
        &self,
        command: &str,
        payload: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, BridgeError> {
        let _slot = self
            .pool
            .try_acquire()
            .map_err(|exhausted| BridgeError::TooManyConcurrentOperations {
                limit: exhausted.capacity,
            })?;
        let timeout = timeout.unwrap_or(self.config.timeout);
        let request = codec::encode_request(command, &payload)?;

        let started = Instant::now();
        let output = self.run_child(command, &request, timeout).await?;
        let envelope = codec::decode_response(
            &output.stdout,
            &output.stderr,
            output.exit_code,
            FALLBACK_ERROR_CODE,
        )?;

        debug!(
            target: "lfs_bridge::bridge",
            command,
            exit_code = ?output.exit_code,
            ok = envelope.is_success(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "bridge call finished"
        );

        match envelope {
            BridgeEnvelope::Success { payload } => Ok(payload),
            BridgeEnvelope::Failure {
                code,
                error,
                details,
            } => Err(BridgeError::Remote {
                command: command.to_string(),
                code,
                error,
                details,
            }),
        }
    }

    async fn run_child(
        &self,
        command: &str,
        request: &[u8],
        timeout: Duration,
    ) -> Result<ChildOutput, BridgeError> {
        let mut process = Command::new(&self.config.program);
        process
            .args(&self.config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        self.config.env.apply(&mut process);

        let program = self.config.program.display().to_string();
        let mut child = process.spawn().map_err(|source| BridgeError::Spawn {
            program: program.clone(),
            source,
        })?;
        debug!(
            target: "lfs_bridge::bridge",
            command,
            program = %program,
            pid = ?child.id(),
            "spawned bridge process"
        );

        let stdin = child.stdin.take();
        let stdout = spawn_capture(child.stdout.take());
        let stderr = spawn_capture(child.stderr.take());

        // Only the child itself is raced against the timeout. Once it has
        // exited, its result is final no matter who still holds the pipes.
        let exchange = async {
            if let Some(stdin) = stdin {
                write_request(stdin, request).await;
            }
            child.wait().await
        };
        let status = match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                let _ = child.start_kill();
                stdout.abort();
                stderr.abort();
                return Err(BridgeError::Io(err));
            }
            Err(_) => {
                warn!(
                    target: "lfs_bridge::bridge",
                    command,
                    program = %program,
                    timeout_ms = timeout.as_millis() as u64,
                    "bridge call timed out; killing child"
                );
                if let Err(err) = child.kill().await {
                    warn!(
                        target: "lfs_bridge::bridge",
                        command,
                        error = %err,
                        "failed to kill timed out bridge process"
                    );
                }
                stdout.abort();
                stderr.abort();
                return Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        let (stdout, stderr) = tokio::join!(
            stdout.finish(command, PIPE_DRAIN_GRACE),
            stderr.finish(command, PIPE_DRAIN_GRACE)
        );
        Ok(ChildOutput {
            exit_code: status.code(),
            stdout,
            stderr,
        })
    }
}

async fn write_request(mut stdin: ChildStdin, request: &[u8]) {
    // A child may legitimately exit before reading its input; whatever it
    // printed still decides the outcome.
    if let Err(err) = stdin.write_all(request).await {
        debug!(target: "lfs_bridge::bridge", error = %err, "bridge stdin write failed");
        return;
    }
    if let Err(err) = stdin.shutdown().await {
        debug!(target: "lfs_bridge::bridge", error = %err, "bridge stdin close failed");
    }
}

/// Keeps the last `cap` bytes written to it.
#[derive(Debug)]
struct TailBuffer {
    bytes: VecDeque<u8>,
    cap: usize,
}

impl TailBuffer {
    fn new(cap: usize) -> Self {
        Self {
            bytes: VecDeque::new(),
            cap,
        }
    }

    fn extend(&mut self, chunk: &[u8]) {
        let chunk = &chunk[chunk.len().saturating_sub(self.cap)..];
        let overflow = (self.bytes.len() + chunk.len()).saturating_sub(self.cap);
        self.bytes.drain(..overflow);
        self.bytes.extend(chunk);
    }

    fn to_vec(&self) -> Vec<u8> {
        self.bytes.iter().copied().collect()
    }
}

/// Background reader for one output stream of a child.
struct Capture {
    buffer: Arc<Mutex<TailBuffer>>,
    task: JoinHandle<io::Result<()>>,
}

impl Capture {
    fn abort(&self) {
        self.task.abort();
    }

    /// Waits up to `grace` for end of stream, then returns what arrived.
    async fn finish(mut self, command: &str, grace: Duration) -> Vec<u8> {
        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(err))) => {
                warn!(target: "lfs_bridge::bridge", command, error = %err, "reading bridge output failed");
            }
            Ok(Err(err)) => {
                warn!(target: "lfs_bridge::bridge", command, error = %err, "bridge output reader failed");
            }
            Err(_) => {
                self.task.abort();
                debug!(
                    target: "lfs_bridge::bridge",
                    command,
                    grace_ms = grace.as_millis() as u64,
                    "bridge output still open after exit; keeping what was captured"
                );
            }
        }
        self.buffer.lock().to_vec()
    }
}

fn spawn_capture<R>(stream: Option<R>) -> Capture
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = Arc::new(Mutex::new(TailBuffer::new(MAX_CAPTURED_OUTPUT)));
    let sink = Arc::clone(&buffer);
    let task = tokio::spawn(async move {
        match stream {
            Some(stream) => read_into(stream, &sink).await,
            None => Ok(()),
        }
    });
    Capture { buffer, task }
}

async fn read_into<R>(mut reader: R, buffer: &Mutex<TailBuffer>) -> io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).await?;
        if read == 0 {
            return Ok(());
        }
        buffer.lock().extend(&chunk[..read]);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn shell_bridge(script: &str, pool_size: usize) -> BridgeClient {
        let mut config = BridgeConfig::new("/bin/sh");
        config.args = vec!["-c".into(), script.into()];
        config.pool_size = pool_size;
        config.timeout = Duration::from_secs(20);
        BridgeClient::new(config)
    }

    async fn wait_for_engaged(client: &BridgeClient, expected: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while client.engaged() != expected {
            assert!(Instant::now() < deadline, "pool never reached {expected}");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn success_payload_survives_banner_noise() {
        let client = shell_bridge(
            r#"cat >/dev/null; echo "Build ok"; echo '{"ok":true,"payload":{"a":1}}'"#,
            2,
        );
        let payload = client.call("exists", json!({}), None).await.unwrap();
        assert_eq!(payload, json!({"a": 1}));
        assert_eq!(client.engaged(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn request_arrives_on_stdin() {
        let client = shell_bridge(
            r#"read line; printf '{"ok":true,"payload":{"echo":%s}}' "$line""#,
            1,
        );
        let payload = client
            .call("upload", json!({"oid": "abc"}), None)
            .await
            .unwrap();
        assert_eq!(
            payload["echo"],
            json!({"command": "upload", "payload": {"oid": "abc"}})
        );
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn structured_failure_is_remote_error() {
        let client = shell_bridge(
            r#"cat >/dev/null; echo '{"ok":false,"code":404,"error":"missing","details":"no such object"}'; exit 1"#,
            1,
        );
        let err = client.call("download", json!({}), None).await.unwrap_err();
        match err {
            BridgeError::Remote {
                command,
                code,
                error,
                details,
            } => {
                assert_eq!(command, "download");
                assert_eq!(code, 404);
                assert_eq!(error, "missing");
                assert_eq!(details, "no such object");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn crash_without_envelope_uses_fallback_code() {
        let client = shell_bridge(r#"cat >/dev/null; echo "stack overflow" >&2; exit 3"#, 1);
        let err = client.call("upload", json!({}), None).await.unwrap_err();
        match err {
            BridgeError::Remote {
                code,
                error,
                details,
                ..
            } => {
                assert_eq!(code, FALLBACK_ERROR_CODE);
                assert!(error.contains("code 3"), "{error}");
                assert!(details.contains("stack overflow"), "{details}");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn clean_exit_without_envelope_is_malformed() {
        let client = shell_bridge("cat >/dev/null; echo done", 1);
        let err = client.call("exists", json!({}), None).await.unwrap_err();
        assert!(matches!(err, BridgeError::MalformedOutput(_)), "{err:?}");
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn missing_program_is_spawn_error_and_frees_slot() {
        let client = BridgeClient::new(BridgeConfig::new("/nonexistent/lfs-bridge-helper"));
        let err = client.call("auth", json!({}), None).await.unwrap_err();
        assert!(matches!(err, BridgeError::Spawn { .. }), "{err:?}");
        assert_eq!(client.engaged(), 0);
    }

    #[test_timeout::tokio_timeout_test(secs = 30, flavor = "multi_thread", worker_threads = 4)]
    async fn pool_rejects_call_beyond_capacity() {
        let client = Arc::new(shell_bridge(
            r#"cat >/dev/null; sleep 1; echo '{"ok":true,"payload":{}}'"#,
            2,
        ));

        let mut running = Vec::new();
        for _ in 0..2 {
            let client = Arc::clone(&client);
            running.push(tokio::spawn(async move {
                client.call("upload", json!({}), None).await
            }));
        }
        wait_for_engaged(&client, 2).await;

        let err = client.call("upload", json!({}), None).await.unwrap_err();
        assert!(
            matches!(err, BridgeError::TooManyConcurrentOperations { limit: 2 }),
            "{err:?}"
        );
        assert_eq!(client.engaged(), 2);

        for task in running {
            task.await.unwrap().unwrap();
        }
        assert_eq!(client.engaged(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn hung_child_is_killed_and_slot_released() {
        let client = shell_bridge(
            r#"read line; case "$line" in *hang*) exec sleep 30;; esac; echo '{"ok":true,"payload":{}}'"#,
            1,
        );

        let limit = Duration::from_millis(300);
        let started = Instant::now();
        let err = client
            .call("hang", json!({}), Some(limit))
            .await
            .unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, BridgeError::Timeout { .. }), "{err:?}");
        assert!(elapsed >= limit);
        assert!(elapsed < limit + Duration::from_secs(5), "{elapsed:?}");
        assert_eq!(client.engaged(), 0);

        let payload = client.call("exists", json!({}), None).await.unwrap();
        assert_eq!(payload, json!({}));
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn exited_child_wins_over_lingering_descendant() {
        let client = shell_bridge(
            r#"cat >/dev/null; sleep 30 & echo '{"ok":true,"payload":{"stored":true}}'; exit 0"#,
            1,
        );
        let started = Instant::now();
        let payload = client
            .call("upload", json!({}), Some(Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(payload, json!({"stored": true}));
        assert!(
            started.elapsed() < PIPE_DRAIN_GRACE + Duration::from_secs(5),
            "{:?}",
            started.elapsed()
        );
        assert_eq!(client.engaged(), 0);
    }

    #[test_timeout::tokio_timeout_test(30)]
    async fn child_sees_only_allowed_environment() {
        let client = shell_bridge(
            r#"cat >/dev/null
names=$(env | sed -n 's/^\([A-Za-z_][A-Za-z0-9_]*\)=.*/\1/p' | tr '\n' ' ')
printf '{"ok":true,"payload":{"names":"%s"}}' "$names""#,
            1,
        );
        let payload = client.call("exists", json!({}), None).await.unwrap();
        let names = payload["names"].as_str().unwrap();
        let allow = EnvAllowlist::default();
        // Set by the shell itself rather than inherited.
        let shell_owned = ["PWD", "OLDPWD", "SHLVL", "_"];
        for name in names.split_whitespace() {
            assert!(
                allow.is_allowed(name.as_ref()) || shell_owned.contains(&name),
                "{name} leaked into the bridge environment"
            );
        }
    }

    #[test]
    fn tail_buffer_keeps_the_last_bytes_in_order() {
        let mut tail = TailBuffer::new(10);
        tail.extend(b"0123456");
        tail.extend(b"789abc");
        assert_eq!(tail.to_vec(), b"3456789abc");

        tail.extend(b"the quick brown fox");
        assert_eq!(tail.to_vec(), b" brown fox");
    }
}
