//! Delivery of one process session's output to the caller's sinks.
//!
//! Auxiliary output connections are copied on tracked tasks. [`StreamHandler::wait`]
//! does not report the exit status until every copy task has finished, so
//! sinks are complete by the time the caller sees the process exit.

use std::io;

use futures::{Stream, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::task::TaskTracker;

use super::connection::Connection;
use super::error::{Error, Result};
use crate::protocol::{PayloadSource, ProcessPayload, StreamId, StreamType};

/// Boxed output sink.
pub type Sink = Box<dyn AsyncWrite + Send + Unpin>;

pub struct StreamHandler {
    copies: TaskTracker,
    stdout: Option<Sink>,
    stderr: Option<Sink>,
}

impl Default for StreamHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamHandler {
    pub fn new() -> Self {
        Self {
            copies: TaskTracker::new(),
            stdout: None,
            stderr: None,
        }
    }

    /// Hijack the auxiliary connection for `stream` and copy it into `sink`
    /// on a tracked task.
    pub async fn attach(
        &mut self,
        connection: &Connection,
        handle: &str,
        process_id: u32,
        stream_id: StreamId,
        stream: StreamType,
        mut sink: Sink,
    ) -> Result<()> {
        let mut source = connection
            .hijack_process_stream(handle, process_id, &stream_id.to_string(), stream)
            .await?;

        self.copies.spawn(async move {
            match tokio::io::copy(&mut source, &mut sink).await {
                Ok(bytes) => {
                    tracing::trace!(%stream_id, %stream, bytes, "Output stream drained");
                }
                Err(e) => {
                    tracing::warn!(%stream_id, %stream, error = %e, "Output stream copy failed");
                }
            }
            if let Err(e) = sink.flush().await {
                tracing::warn!(%stream_id, %stream, error = %e, "Failed to flush output sink");
            }
        });
        Ok(())
    }

    /// Route data frames for `stream` straight into `sink`.
    pub fn inline(&mut self, stream: StreamType, sink: Sink) {
        match stream {
            StreamType::Stdout => self.stdout = Some(sink),
            StreamType::Stderr => self.stderr = Some(sink),
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_copies(&self) -> usize {
        self.copies.len()
    }

    /// Consume frames until the process exits or fails.
    ///
    /// Returns the exit status, [`Error::Process`] for an error frame, or
    /// [`Error::Protocol`] if the stream breaks first. In every case the
    /// auxiliary copies are drained before returning.
    pub async fn wait<S>(&mut self, mut frames: S) -> Result<u32>
    where
        S: Stream<Item = io::Result<ProcessPayload>> + Unpin,
    {
        let outcome = loop {
            match frames.next().await {
                Some(Ok(ProcessPayload::Data { source, data, .. })) => {
                    self.write_inline(source, &data).await;
                }
                Some(Ok(ProcessPayload::Exited { exit_status, .. })) => break Ok(exit_status),
                Some(Ok(ProcessPayload::Error { message, .. })) => {
                    break Err(Error::Process(message));
                }
                Some(Ok(ProcessPayload::Started { .. } | ProcessPayload::Unknown)) => {}
                Some(Err(e)) => break Err(Error::Protocol(format!("undecodable frame: {e}"))),
                None => {
                    break Err(Error::Protocol(
                        "process stream ended without an exit status".to_string(),
                    ));
                }
            }
        };

        self.flush_inline().await;
        self.copies.close();
        self.copies.wait().await;
        outcome
    }

    async fn write_inline(&mut self, source: PayloadSource, data: &[u8]) {
        let (slot, name) = match source {
            PayloadSource::Stdout => (&mut self.stdout, "stdout"),
            PayloadSource::Stderr => (&mut self.stderr, "stderr"),
            PayloadSource::Stdin => return,
        };
        let Some(sink) = slot else {
            return;
        };
        if let Err(e) = sink.write_all(data).await {
            tracing::warn!(stream = name, error = %e, "Failed to write output, dropping sink");
            *slot = None;
        }
    }

    async fn flush_inline(&mut self) {
        for sink in [self.stdout.as_mut(), self.stderr.as_mut()].into_iter().flatten() {
            if let Err(e) = sink.flush().await {
                tracing::warn!(error = %e, "Failed to flush output sink");
            }
        }
    }
}
