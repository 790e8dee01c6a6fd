//! Custom transfer protocol state machine.
//!
//! The engine owns the session: it reads host requests line by line,
//! validates them, hands them to a [`Backend`] and writes exactly one
//! `complete` per transfer. Anything that breaks the framing is fatal, while
//! everything that concerns a single object is reported on that object.

pub mod outbound;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lfs_bridge_proto::{
    DownloadRequest, HostRequest, InitRequest, InitResponse, Operation, ProtocolError,
    TransferEvent, UploadRequest,
};
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader, Lines};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use self::outbound::{spawn_writer, Outbound, OutputClosed};
use crate::backend::{Backend, ProgressReporter, TransferRequest};
use crate::error::{TransferError, CODE_INVALID_REQUEST};
use crate::status::StatusPublisher;
use crate::validate::{validate_oid, validate_path};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    AwaitingInit,
    Ready,
    Processing,
    Terminated,
}

/// Parameters negotiated by `init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub operation: Operation,
    pub remote: String,
    pub concurrent: bool,
    pub concurrent_transfers: u32,
}

impl From<InitRequest> for Session {
    fn from(init: InitRequest) -> Self {
        Self {
            operation: init.operation,
            remote: init.remote,
            concurrent: init.concurrent,
            concurrent_transfers: init.concurrenttransfers,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Where downloaded objects are placed before git-lfs moves them.
    pub download_dir: PathBuf,
    /// Grace period for in-flight transfers after `terminate`.
    pub drain_timeout: Duration,
    pub sweep_interval: Duration,
}

impl EngineOptions {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }
}

/// Session-fatal failures. Only failures of the first message are answered
/// (with an init error); the rest end the session without further output.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("input closed before init")]
    MissingInit,
    #[error("malformed message on line {line}: {reason}")]
    Malformed { line: usize, reason: String },
    #[error("invalid init message: {0}")]
    InvalidInit(String),
    #[error("expected init, got '{0}'")]
    UnexpectedBeforeInit(String),
    #[error("unknown event '{0}'")]
    UnknownEvent(String),
    #[error("received a second init")]
    DuplicateInit,
    #[error("failed to read protocol input: {0}")]
    Read(#[source] io::Error),
    #[error("failed to write protocol output: {0}")]
    Write(#[source] io::Error),
    #[error(transparent)]
    OutputClosed(#[from] OutputClosed),
    #[error("transfer task failed: {0}")]
    TaskFailed(String),
}

/// What a transfer task reports back once its `complete` is queued.
type TaskResult = Result<(), OutputClosed>;

pub struct Engine {
    backend: Arc<dyn Backend>,
    status: Arc<StatusPublisher>,
    options: EngineOptions,
    state: EngineState,
    session: Option<Session>,
}

impl Engine {
    pub fn new(
        backend: Arc<dyn Backend>,
        status: Arc<StatusPublisher>,
        options: EngineOptions,
    ) -> Self {
        Self {
            backend,
            status,
            options,
            state: EngineState::Idle,
            session: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    /// Serves one session to completion.
    ///
    /// `Ok` means the host terminated the session (explicitly or by closing
    /// its side after `init`); the caller should exit 0.
    pub async fn run<R, W>(&mut self, reader: R, writer: W) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, writer_task) = spawn_writer(writer);
        let mut lines = LineReader::new(reader);

        self.state = EngineState::AwaitingInit;
        let mut result = self.serve(&mut lines, &outbound).await;
        self.state = EngineState::Terminated;
        self.status.stopped();

        drop(outbound);
        let written = match writer_task.await {
            Ok(written) => written,
            Err(err) => Err(io::Error::other(err)),
        };
        if let Err(err) = written {
            if result.is_ok() {
                result = Err(EngineError::Write(err));
            }
        }

        match &result {
            Ok(()) => info!(target: "lfs_bridge::engine", "session finished"),
            Err(err) => error!(target: "lfs_bridge::engine", error = %err, "session aborted"),
        }
        result
    }

    async fn serve<R>(
        &mut self,
        lines: &mut LineReader<R>,
        outbound: &Outbound,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let session = self.initialize(lines, outbound).await?;
        let mut tasks: JoinSet<TaskResult> = JoinSet::new();
        let result = self.dispatch_loop(&session, lines, outbound, &mut tasks).await;

        match result {
            Ok(()) => self.drain(&mut tasks).await,
            Err(err) => {
                tasks.shutdown().await;
                Err(err)
            }
        }
    }

    async fn initialize<R>(
        &mut self,
        lines: &mut LineReader<R>,
        outbound: &Outbound,
    ) -> Result<Session, EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let Some((line_no, line)) = lines.next().await? else {
            return Err(EngineError::MissingInit);
        };
        let value: Value = match serde_json::from_str(&line) {
            Ok(value) => value,
            Err(err) => {
                outbound
                    .send(InitResponse::failed(ProtocolError::new(
                        CODE_INVALID_REQUEST,
                        format!("expected an init message: {err}"),
                    )))
                    .await?;
                return Err(EngineError::Malformed {
                    line: line_no,
                    reason: err.to_string(),
                });
            }
        };

        let event = event_name(&value).unwrap_or("<none>").to_string();
        if event != "init" {
            let message = format!("expected init, got '{event}'");
            outbound
                .send(InitResponse::failed(ProtocolError::new(
                    CODE_INVALID_REQUEST,
                    message,
                )))
                .await?;
            return Err(EngineError::UnexpectedBeforeInit(event));
        }

        let init: InitRequest = match serde_json::from_value(value) {
            Ok(init) => init,
            Err(err) => {
                let message = format!("invalid init: {err}");
                outbound
                    .send(InitResponse::failed(ProtocolError::new(
                        CODE_INVALID_REQUEST,
                        message,
                    )))
                    .await?;
                return Err(EngineError::InvalidInit(err.to_string()));
            }
        };

        let session = Session::from(init);
        info!(
            target: "lfs_bridge::engine",
            operation = %session.operation,
            remote = %session.remote,
            concurrent = session.concurrent,
            concurrent_transfers = session.concurrent_transfers,
            backend = self.backend.name(),
            "session initialized"
        );
        outbound.send(InitResponse::ok()).await?;
        self.session = Some(session.clone());
        self.state = EngineState::Ready;
        self.status.idle();
        Ok(session)
    }

    async fn dispatch_loop<R>(
        &mut self,
        session: &Session,
        lines: &mut LineReader<R>,
        outbound: &Outbound,
        tasks: &mut JoinSet<TaskResult>,
    ) -> Result<(), EngineError>
    where
        R: AsyncRead + Unpin,
    {
        let mut sweep = tokio::time::interval(self.options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            let next = tokio::select! {
                next = lines.next() => next?,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    settle(joined)?;
                    if tasks.is_empty() {
                        self.state = EngineState::Ready;
                    }
                    continue;
                }
                _ = sweep.tick() => {
                    self.backend.sweep().await;
                    continue;
                }
            };

            let Some((line_no, line)) = next else {
                warn!(
                    target: "lfs_bridge::engine",
                    "input closed without terminate; finishing session"
                );
                return Ok(());
            };

            let value: Value =
                serde_json::from_str(&line).map_err(|err| EngineError::Malformed {
                    line: line_no,
                    reason: err.to_string(),
                })?;

            let request = match serde_json::from_value::<HostRequest>(value.clone()) {
                Ok(request) => request,
                Err(err) => match unparsed_request(&value, line_no, err) {
                    Ok(rejected) => {
                        self.reject(outbound, rejected).await?;
                        continue;
                    }
                    Err(fatal) => return Err(fatal),
                },
            };

            let job = match request {
                HostRequest::Terminate => {
                    debug!(target: "lfs_bridge::engine", "terminate received");
                    return Ok(());
                }
                HostRequest::Init(_) => return Err(EngineError::DuplicateInit),
                HostRequest::Upload(UploadRequest {
                    oid, size, path, ..
                }) => self.prepare(session, Operation::Upload, oid, size, Some(path)),
                HostRequest::Download(DownloadRequest { oid, size, .. }) => {
                    self.prepare(session, Operation::Download, oid, size, None)
                }
            };

            let job = match job {
                Ok(job) => job,
                Err(rejected) => {
                    self.reject(outbound, rejected).await?;
                    continue;
                }
            };

            let backend = Arc::clone(&self.backend);
            let status = Arc::clone(&self.status);
            let outbound = outbound.clone();
            self.state = EngineState::Processing;
            if session.concurrent {
                tasks.spawn(job.run(backend, status, outbound));
            } else {
                job.run(backend, status, outbound).await?;
                self.state = EngineState::Ready;
            }
        }
    }

    fn prepare(
        &self,
        session: &Session,
        operation: Operation,
        host_oid: String,
        size: u64,
        path: Option<String>,
    ) -> Result<Job, Rejected> {
        let reject = |error: TransferError| Rejected {
            oid: host_oid.clone(),
            error,
        };

        if operation != session.operation {
            return Err(reject(TransferError::InvalidRequest(format!(
                "{operation} request in a {} session",
                session.operation
            ))));
        }
        let oid = validate_oid(&host_oid).map_err(|err| reject(err.into()))?;
        let path = match path {
            Some(path) => {
                validate_path(&path).map_err(|err| reject(err.into()))?;
                PathBuf::from(path)
            }
            None => self
                .options
                .download_dir
                .join(format!("{oid}-{}", Uuid::new_v4())),
        };

        Ok(Job {
            host_oid,
            operation,
            request: TransferRequest { oid, size, path },
        })
    }

    async fn reject(&self, outbound: &Outbound, rejected: Rejected) -> Result<(), EngineError> {
        warn!(
            target: "lfs_bridge::engine",
            oid = %rejected.oid,
            error = %rejected.error,
            "rejected transfer request"
        );
        outbound
            .send(TransferEvent::failed(
                rejected.oid,
                rejected.error.to_protocol(),
            ))
            .await?;
        Ok(())
    }

    async fn drain(&mut self, tasks: &mut JoinSet<TaskResult>) -> Result<(), EngineError> {
        if tasks.is_empty() {
            return Ok(());
        }
        info!(
            target: "lfs_bridge::engine",
            in_flight = tasks.len(),
            grace_ms = self.options.drain_timeout.as_millis() as u64,
            "waiting for in-flight transfers"
        );
        let waited = tokio::time::timeout(self.options.drain_timeout, async {
            while let Some(joined) = tasks.join_next().await {
                settle(joined)?;
            }
            Ok::<_, EngineError>(())
        })
        .await;

        match waited {
            Ok(result) => {
                if result.is_err() {
                    tasks.shutdown().await;
                }
                result
            }
            Err(_) => {
                warn!(
                    target: "lfs_bridge::engine",
                    abandoned = tasks.len(),
                    "grace period elapsed; abandoning in-flight transfers"
                );
                tasks.shutdown().await;
                Ok(())
            }
        }
    }
}

fn settle(joined: Result<TaskResult, tokio::task::JoinError>) -> Result<(), EngineError> {
    match joined {
        Ok(result) => result.map_err(EngineError::from),
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(EngineError::TaskFailed(err.to_string())),
    }
}

/// Decides what a line that failed typed parsing means: a transfer with an
/// identifiable oid is rejected on that object, anything else ends the
/// session.
fn unparsed_request(
    value: &Value,
    line_no: usize,
    err: serde_json::Error,
) -> Result<Rejected, EngineError> {
    match event_name(value) {
        Some("upload") | Some("download") => match value.get("oid").and_then(Value::as_str) {
            Some(oid) => Ok(Rejected {
                oid: oid.to_string(),
                error: TransferError::InvalidRequest(err.to_string()),
            }),
            None => Err(EngineError::Malformed {
                line: line_no,
                reason: err.to_string(),
            }),
        },
        Some("init") => Err(EngineError::DuplicateInit),
        Some(other) => Err(EngineError::UnknownEvent(other.to_string())),
        None => Err(EngineError::Malformed {
            line: line_no,
            reason: "missing 'event' field".to_string(),
        }),
    }
}

fn event_name(value: &Value) -> Option<&str> {
    value.get("event").and_then(Value::as_str)
}

/// A request refused before it reached the backend.
struct Rejected {
    oid: String,
    error: TransferError,
}

/// A validated transfer ready for the backend.
struct Job {
    /// Echoed back verbatim; the validated oid may differ in case.
    host_oid: String,
    operation: Operation,
    request: TransferRequest,
}

impl Job {
    async fn run(
        self,
        backend: Arc<dyn Backend>,
        status: Arc<StatusPublisher>,
        outbound: Outbound,
    ) -> TaskResult {
        let oid = self.request.oid.as_str();
        status.transferring(oid, self.operation);
        debug!(
            target: "lfs_bridge::engine",
            oid,
            operation = %self.operation,
            size = self.request.size,
            "transfer started"
        );

        let progress = ProgressReporter::new(self.host_oid.clone(), outbound.clone());
        let outcome = match self.operation {
            Operation::Upload => backend.put(&self.request, &progress).await,
            Operation::Download => backend.get(&self.request, &progress).await,
        };
        drop(progress);

        let event = match outcome {
            Ok(()) => {
                info!(
                    target: "lfs_bridge::engine",
                    oid,
                    operation = %self.operation,
                    "transfer complete"
                );
                status.succeeded(oid, self.operation);
                let path = match self.operation {
                    Operation::Download => Some(self.request.path.display().to_string()),
                    Operation::Upload => None,
                };
                TransferEvent::completed(self.host_oid, path)
            }
            Err(err) => {
                let kind = err.kind();
                if kind.is_temporary() {
                    warn!(
                        target: "lfs_bridge::engine",
                        oid,
                        operation = %self.operation,
                        kind = kind.as_str(),
                        retryable = kind.is_retryable(),
                        error = %err,
                        "transfer failed"
                    );
                } else {
                    error!(
                        target: "lfs_bridge::engine",
                        oid,
                        operation = %self.operation,
                        kind = kind.as_str(),
                        error = %err,
                        "transfer failed"
                    );
                }
                let protocol = err.to_protocol();
                status.failed(oid, self.operation, protocol.code, &protocol.message);
                TransferEvent::failed(self.host_oid, protocol)
            }
        };
        outbound.send(event).await
    }
}

/// Line splitter that skips blank lines and counts what it reads.
struct LineReader<R> {
    lines: Lines<BufReader<R>>,
    line_no: usize,
}

impl<R> LineReader<R>
where
    R: AsyncRead + Unpin,
{
    fn new(reader: R) -> Self {
        Self {
            lines: BufReader::new(reader).lines(),
            line_no: 0,
        }
    }

    /// Cancel safe: a partially read line stays buffered.
    async fn next(&mut self) -> Result<Option<(usize, String)>, EngineError> {
        loop {
            let Some(line) = self.lines.next_line().await.map_err(EngineError::Read)? else {
                return Ok(None);
            };
            self.line_no += 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            return Ok(Some((self.line_no, trimmed.to_string())));
        }
    }
}
