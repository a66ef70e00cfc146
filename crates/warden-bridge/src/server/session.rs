//! Per-process streaming over a hijacked connection.
//!
//! A session writes `started`, then one frame per backend event in order,
//! then exactly one terminal frame. Output the client asked to collect on
//! auxiliary connections is diverted into channels held by the
//! [`StreamRegistry`] until the matching stream request claims them.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::codec::{FramedRead, FramedWrite};

use crate::backend::{ProcessEvent, ProcessSource, ProcessStream};
use crate::bomberman::PauseGuard;
use crate::protocol::{JsonCodec, PayloadSource, ProcessInput, ProcessPayload, StreamId, StreamType};

/// How long unclaimed auxiliary output is kept after its session ends.
pub const STREAM_CLAIM_TIMEOUT: Duration = Duration::from_secs(60);

/// Chunks buffered per auxiliary stream. Output past this is dropped while
/// the stream is unclaimed and waits for the reader once it is claimed.
pub const AUXILIARY_BUFFER: usize = 256;

impl From<ProcessSource> for PayloadSource {
    fn from(source: ProcessSource) -> Self {
        match source {
            ProcessSource::Stdout => Self::Stdout,
            ProcessSource::Stderr => Self::Stderr,
            ProcessSource::Stdin => Self::Stdin,
        }
    }
}

/// Auxiliary output channels waiting to be claimed by a stream request.
#[derive(Default)]
pub struct StreamRegistry {
    pending: DashMap<(StreamId, StreamType), mpsc::Receiver<Bytes>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, stream_id: StreamId, stream: StreamType) -> mpsc::Sender<Bytes> {
        let (tx, rx) = mpsc::channel(AUXILIARY_BUFFER);
        self.pending.insert((stream_id, stream), rx);
        tx
    }

    /// Claim a channel. Each one can be claimed once.
    pub fn take(
        &self,
        stream_id: StreamId,
        stream: StreamType,
    ) -> Option<mpsc::Receiver<Bytes>> {
        self.pending.remove(&(stream_id, stream)).map(|(_, rx)| rx)
    }

    /// Drop every unclaimed channel of a session.
    pub fn expire(&self, stream_id: StreamId) {
        self.pending.retain(|(id, _), _| *id != stream_id);
    }

    fn is_pending(&self, stream_id: StreamId, stream: StreamType) -> bool {
        self.pending.contains_key(&(stream_id, stream))
    }

    fn holds(&self, stream_id: StreamId) -> bool {
        self.pending.iter().any(|entry| entry.key().0 == stream_id)
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// Expires a session's unclaimed channels once dropped, after
/// [`STREAM_CLAIM_TIMEOUT`].
struct ClaimWindow {
    stream_id: StreamId,
    registry: Arc<StreamRegistry>,
}

impl Drop for ClaimWindow {
    fn drop(&mut self) {
        if !self.registry.holds(self.stream_id) {
            return;
        }
        let stream_id = self.stream_id;
        let registry = Arc::clone(&self.registry);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(STREAM_CLAIM_TIMEOUT).await;
                    registry.expire(stream_id);
                });
            }
            Err(_) => registry.expire(stream_id),
        }
    }
}

/// A started or attached process waiting for its connection to be upgraded.
pub struct ProcessSession {
    process_id: u32,
    stream_id: StreamId,
    stream: ProcessStream,
    auxiliary: HashMap<StreamType, mpsc::Sender<Bytes>>,
    claim_window: ClaimWindow,
    guard: PauseGuard,
}

impl ProcessSession {
    /// Registers the auxiliary channels for `streams` immediately, so stream
    /// requests racing the upgrade find them. Unclaimed channels expire after
    /// the session is run or dropped.
    pub fn new(
        process_id: u32,
        stream: ProcessStream,
        streams: &[StreamType],
        registry: Arc<StreamRegistry>,
        guard: PauseGuard,
    ) -> Self {
        let stream_id = StreamId::new();
        let auxiliary = streams
            .iter()
            .map(|&stream| (stream, registry.register(stream_id, stream)))
            .collect();

        Self {
            process_id,
            stream_id,
            stream,
            auxiliary,
            claim_window: ClaimWindow {
                stream_id,
                registry,
            },
            guard,
        }
    }

    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Drive the session over an upgraded connection until the process ends
    /// or the connection breaks.
    pub async fn run<T>(self, io: T)
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
    {
        let Self {
            process_id,
            stream_id,
            stream: ProcessStream { events, stdin },
            auxiliary,
            claim_window,
            guard,
        } = self;

        let (reader, writer) = tokio::io::split(io);
        let input = FramedRead::new(reader, JsonCodec::<ProcessInput>::new());
        let frames = FramedWrite::new(writer, JsonCodec::<ProcessPayload>::new());

        let stdin_task = tokio::spawn(forward_input(process_id, input, stdin));
        let handle = guard.handle().to_string();

        let written = write_frames(
            process_id,
            stream_id,
            events,
            auxiliary,
            &claim_window.registry,
            frames,
        )
        .await;
        match written {
            Ok(()) => tracing::debug!(%handle, process_id, "Process stream finished"),
            Err(e) => {
                tracing::debug!(%handle, process_id, error = %e, "Process connection broken");
            }
        }

        stdin_task.abort();
        drop(guard);
        drop(claim_window);
    }
}

async fn write_frames<W>(
    process_id: u32,
    stream_id: StreamId,
    mut events: mpsc::Receiver<ProcessEvent>,
    mut auxiliary: HashMap<StreamType, mpsc::Sender<Bytes>>,
    registry: &StreamRegistry,
    mut frames: FramedWrite<W, JsonCodec<ProcessPayload>>,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    frames
        .send(ProcessPayload::Started {
            process_id,
            stream_id,
        })
        .await?;

    let terminal = loop {
        match events.recv().await {
            Some(ProcessEvent::Output { source, data }) => {
                let source = PayloadSource::from(source);
                if let Some(stream) = source.stream_type()
                    && let Some(tx) = auxiliary.get(&stream)
                {
                    // A closed receiver means the client gave up on this stream.
                    if let Err(TrySendError::Full(data)) = tx.try_send(data) {
                        if registry.is_pending(stream_id, stream) {
                            tracing::warn!(
                                process_id,
                                %stream_id,
                                %stream,
                                "Auxiliary stream unclaimed, dropping output"
                            );
                        } else {
                            let _ = tx.send(data).await;
                        }
                    }
                    continue;
                }
                frames
                    .send(ProcessPayload::Data {
                        process_id,
                        source,
                        data,
                    })
                    .await?;
            }
            Some(ProcessEvent::Exited(exit_status)) => {
                break ProcessPayload::Exited {
                    process_id,
                    exit_status,
                };
            }
            Some(ProcessEvent::Failed(message)) => {
                break ProcessPayload::Error {
                    process_id: Some(process_id),
                    message,
                };
            }
            None => {
                break ProcessPayload::Error {
                    process_id: Some(process_id),
                    message: "process stream closed without an exit status".to_string(),
                };
            }
        }
    };

    // Auxiliary readers see EOF once the buffered output is drained.
    auxiliary.clear();
    frames.send(terminal).await?;
    frames.get_mut().shutdown().await
}

async fn forward_input<R>(
    process_id: u32,
    mut input: FramedRead<ReadHalf<R>, JsonCodec<ProcessInput>>,
    mut stdin: Option<mpsc::UnboundedSender<Bytes>>,
) where
    R: AsyncRead,
{
    while let Some(frame) = input.next().await {
        match frame {
            Ok(ProcessInput::Stdin { data }) => {
                if let Some(tx) = &stdin
                    && tx.send(data).is_err()
                {
                    stdin = None;
                }
            }
            Ok(ProcessInput::CloseStdin) => stdin = None,
            Err(e) => {
                tracing::debug!(process_id, error = %e, "Undecodable input frame");
                break;
            }
        }
    }
}

/// Copy one auxiliary channel onto an upgraded connection, then close it.
pub async fn pump_stream<W>(mut rx: mpsc::Receiver<Bytes>, mut io: W)
where
    W: AsyncWrite + Unpin,
{
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = io.write_all(&chunk).await {
            tracing::debug!(error = %e, "Output stream connection broken");
            return;
        }
    }
    let _ = io.shutdown().await;
}
