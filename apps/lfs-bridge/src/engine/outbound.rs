//! Single writer for the host-facing stdout stream.
//!
//! Every message the agent produces goes through one bounded channel, so the
//! order in which a transfer queues its progress and completion is the order
//! the host reads them.

use std::io;

use lfs_bridge_proto::AgentMessage;
use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

const OUTBOUND_CAPACITY: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("protocol output stream is closed")]
pub struct OutputClosed;

#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<AgentMessage>,
}

impl Outbound {
    pub async fn send(&self, message: impl Into<AgentMessage>) -> Result<(), OutputClosed> {
        self.tx.send(message.into()).await.map_err(|_| OutputClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Starts the writer task. The task ends once every [`Outbound`] clone is
/// dropped, or early with the error that broke the pipe.
pub fn spawn_writer<W>(writer: W) -> (Outbound, JoinHandle<io::Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
    let task = tokio::spawn(write_loop(writer, rx));
    (Outbound { tx }, task)
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::Receiver<AgentMessage>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = rx.recv().await {
        let mut line = match serde_json::to_vec(&message) {
            Ok(line) => line,
            Err(err) => {
                error!(
                    target: "lfs_bridge::engine",
                    error = %err,
                    "failed to serialize protocol message"
                );
                continue;
            }
        };
        line.push(b'\n');
        // Dropping `rx` on failure makes every pending and later send fail,
        // which is how the engine learns the pipe is gone.
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
    writer.shutdown().await.or_else(|err| match err.kind() {
        io::ErrorKind::BrokenPipe => Ok(()),
        _ => Err(err),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use lfs_bridge_proto::{InitResponse, TransferEvent};
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test_timeout::tokio_timeout_test(10)]
    async fn writes_one_json_line_per_message_in_order() {
        let (agent, host) = tokio::io::duplex(4096);
        let (outbound, task) = spawn_writer(agent);

        outbound.send(InitResponse::ok()).await.unwrap();
        outbound
            .send(TransferEvent::completed("abc", None))
            .await
            .unwrap();
        drop(outbound);
        task.await.unwrap().unwrap();

        let mut lines = BufReader::new(host).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), "{}");
        assert_eq!(
            lines.next_line().await.unwrap().unwrap(),
            r#"{"event":"complete","oid":"abc"}"#
        );
        assert!(lines.next_line().await.unwrap().is_none());
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn closed_reader_surfaces_as_send_failure() {
        let (agent, host) = tokio::io::duplex(64);
        drop(host);
        let (outbound, task) = spawn_writer(agent);

        // Queued before the writer noticed, so this one may still succeed.
        let _ = outbound.send(TransferEvent::completed("abc", None)).await;
        assert!(task.await.unwrap().is_err());
        assert_eq!(
            outbound.send(TransferEvent::completed("def", None)).await,
            Err(OutputClosed)
        );
        assert!(outbound.is_closed());
    }
}
