//! Handle to a remote process started by `run` or `attach`.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::ReaderStream;

use super::connection::Hijacked;
use super::error::{Error, Result};
use super::stream_handler::{Sink, StreamHandler};
use crate::protocol::{JsonCodec, ProcessInput, ProcessPayload, StreamId};

type FrameReader = FramedRead<ReadHalf<Hijacked>, JsonCodec<ProcessPayload>>;
type InputWriter = FramedWrite<WriteHalf<Hijacked>, JsonCodec<ProcessInput>>;

/// Caller-side endpoints of a process's standard streams. Any may be absent.
#[derive(Default)]
pub struct ProcessIo {
    pub stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stdout: Option<Sink>,
    pub stderr: Option<Sink>,
}

impl ProcessIo {
    pub fn with_stdin(mut self, stdin: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(stdin));
        self
    }

    pub fn with_stdout(mut self, stdout: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(stdout));
        self
    }

    pub fn with_stderr(mut self, stderr: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(stderr));
        self
    }
}

#[derive(Debug, Clone)]
enum Outcome {
    Exited(u32),
    Failed(String),
    Broken(String),
}

#[derive(Debug)]
pub struct Process {
    id: u32,
    stream_id: StreamId,
    frames: Option<JoinHandle<Result<u32>>>,
    stdin: Option<JoinHandle<()>>,
    outcome: Option<Outcome>,
}

impl Process {
    pub(crate) fn spawn(
        id: u32,
        stream_id: StreamId,
        frames: FrameReader,
        input: InputWriter,
        stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
        mut handler: StreamHandler,
    ) -> Self {
        let stdin = tokio::spawn(forward_stdin(id, input, stdin));
        let frames = tokio::spawn(async move { handler.wait(frames).await });

        Self {
            id,
            stream_id,
            frames: Some(frames),
            stdin: Some(stdin),
            outcome: None,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// Block until the process exits and all of its output has been delivered.
    ///
    /// The result is cached; later calls return it again.
    pub async fn wait(&mut self) -> Result<u32> {
        let outcome = match &self.outcome {
            Some(outcome) => outcome.clone(),
            None => {
                let outcome = self.finish().await;
                self.outcome = Some(outcome.clone());
                outcome
            }
        };

        match outcome {
            Outcome::Exited(status) => Ok(status),
            Outcome::Failed(message) => Err(Error::Process(message)),
            Outcome::Broken(message) => Err(Error::Protocol(message)),
        }
    }

    async fn finish(&mut self) -> Outcome {
        let result = match self.frames.as_mut() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => Err(Error::Protocol(format!("frame task failed: {e}"))),
            },
            None => Err(Error::Protocol("process stream already closed".to_string())),
        };
        self.frames = None;

        if let Some(stdin) = self.stdin.take() {
            stdin.abort();
            let _ = stdin.await;
        }

        match result {
            Ok(status) => Outcome::Exited(status),
            Err(Error::Process(message)) => Outcome::Failed(message),
            Err(Error::Protocol(message)) => Outcome::Broken(message),
            Err(e) => Outcome::Broken(e.to_string()),
        }
    }
}

impl Drop for Process {
    fn drop(&mut self) {
        if let Some(stdin) = self.stdin.take() {
            stdin.abort();
        }
        if let Some(frames) = self.frames.take() {
            frames.abort();
        }
    }
}

async fn forward_stdin(
    process_id: u32,
    mut input: InputWriter,
    stdin: Option<Box<dyn AsyncRead + Send + Unpin>>,
) {
    if let Some(stdin) = stdin {
        let mut chunks = ReaderStream::new(stdin);
        while let Some(chunk) = chunks.next().await {
            let data = match chunk {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(process_id, error = %e, "Failed to read stdin");
                    break;
                }
            };
            if let Err(e) = input.send(ProcessInput::Stdin { data }).await {
                tracing::debug!(process_id, error = %e, "Process connection closed while writing stdin");
                return;
            }
        }
    }

    if let Err(e) = input.send(ProcessInput::CloseStdin).await {
        tracing::debug!(process_id, error = %e, "Failed to close process stdin");
    }
}
