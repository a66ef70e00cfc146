//! Request envelope and dispatch to the backend.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use super::error::ApiError;
use super::session::{ProcessSession, StreamRegistry};
use crate::backend::{Backend, ByteStream, Container, NetOutRule, Properties};
use crate::bomberman::{EvictionScheduler, PauseGuard};
use crate::protocol::{
    CopyInRequest, CopyOutRequest, CreateRequest, CreateResponse, InfoResponse,
    LimitBandwidthRequest, LimitBandwidthResponse, LimitCpuRequest, LimitCpuResponse,
    LimitDiskRequest, LimitDiskResponse, LimitMemoryRequest, LimitMemoryResponse, ListResponse,
    NetInRequest, NetInResponse, PropertyValue, RunRequest, StopRequest, StreamId, StreamType,
};
use crate::routes::RouteName;
use crate::translate;

/// One decoded operation.
pub enum Request {
    Ping,
    Capacity,
    Create(CreateRequest),
    List {
        filter: Properties,
    },
    Destroy {
        handle: String,
    },
    Info {
        handle: String,
    },
    Stop {
        handle: String,
        request: StopRequest,
    },
    StreamIn {
        handle: String,
        destination: String,
        body: ByteStream,
    },
    StreamOut {
        handle: String,
        source: String,
    },
    CopyIn {
        handle: String,
        request: CopyInRequest,
    },
    CopyOut {
        handle: String,
        request: CopyOutRequest,
    },
    LimitBandwidth {
        handle: String,
        request: LimitBandwidthRequest,
    },
    CurrentBandwidthLimits {
        handle: String,
    },
    LimitCpu {
        handle: String,
        request: LimitCpuRequest,
    },
    CurrentCpuLimits {
        handle: String,
    },
    LimitDisk {
        handle: String,
        request: LimitDiskRequest,
    },
    CurrentDiskLimits {
        handle: String,
    },
    LimitMemory {
        handle: String,
        request: LimitMemoryRequest,
    },
    CurrentMemoryLimits {
        handle: String,
    },
    NetIn {
        handle: String,
        request: NetInRequest,
    },
    NetOut {
        handle: String,
        rule: NetOutRule,
    },
    GetProperty {
        handle: String,
        key: String,
    },
    SetProperty {
        handle: String,
        key: String,
        value: String,
    },
    RemoveProperty {
        handle: String,
        key: String,
    },
    Run {
        handle: String,
        request: RunRequest,
        streams: Vec<StreamType>,
    },
    Attach {
        handle: String,
        process_id: u32,
        streams: Vec<StreamType>,
    },
    ProcessStream {
        handle: String,
        process_id: u32,
        stream_id: StreamId,
        stream: StreamType,
    },
}

impl Request {
    pub fn route(&self) -> RouteName {
        match self {
            Self::Ping => RouteName::Ping,
            Self::Capacity => RouteName::Capacity,
            Self::Create(_) => RouteName::Create,
            Self::List { .. } => RouteName::List,
            Self::Destroy { .. } => RouteName::Destroy,
            Self::Info { .. } => RouteName::Info,
            Self::Stop { .. } => RouteName::Stop,
            Self::StreamIn { .. } => RouteName::StreamIn,
            Self::StreamOut { .. } => RouteName::StreamOut,
            Self::CopyIn { .. } => RouteName::CopyIn,
            Self::CopyOut { .. } => RouteName::CopyOut,
            Self::LimitBandwidth { .. } => RouteName::LimitBandwidth,
            Self::CurrentBandwidthLimits { .. } => RouteName::CurrentBandwidthLimits,
            Self::LimitCpu { .. } => RouteName::LimitCpu,
            Self::CurrentCpuLimits { .. } => RouteName::CurrentCpuLimits,
            Self::LimitDisk { .. } => RouteName::LimitDisk,
            Self::CurrentDiskLimits { .. } => RouteName::CurrentDiskLimits,
            Self::LimitMemory { .. } => RouteName::LimitMemory,
            Self::CurrentMemoryLimits { .. } => RouteName::CurrentMemoryLimits,
            Self::NetIn { .. } => RouteName::NetIn,
            Self::NetOut { .. } => RouteName::NetOut,
            Self::GetProperty { .. } => RouteName::GetProperty,
            Self::SetProperty { .. } => RouteName::SetProperty,
            Self::RemoveProperty { .. } => RouteName::RemoveProperty,
            Self::Run { .. } => RouteName::Run,
            Self::Attach { .. } => RouteName::Attach,
            Self::ProcessStream { .. } => RouteName::ProcessStream,
        }
    }

    pub fn handle(&self) -> Option<&str> {
        match self {
            Self::Ping | Self::Capacity | Self::List { .. } => None,
            Self::Create(request) => request.handle.as_deref(),
            Self::Destroy { handle }
            | Self::Info { handle }
            | Self::Stop { handle, .. }
            | Self::StreamIn { handle, .. }
            | Self::StreamOut { handle, .. }
            | Self::CopyIn { handle, .. }
            | Self::CopyOut { handle, .. }
            | Self::LimitBandwidth { handle, .. }
            | Self::CurrentBandwidthLimits { handle }
            | Self::LimitCpu { handle, .. }
            | Self::CurrentCpuLimits { handle }
            | Self::LimitDisk { handle, .. }
            | Self::CurrentDiskLimits { handle }
            | Self::LimitMemory { handle, .. }
            | Self::CurrentMemoryLimits { handle }
            | Self::NetIn { handle, .. }
            | Self::NetOut { handle, .. }
            | Self::GetProperty { handle, .. }
            | Self::SetProperty { handle, .. }
            | Self::RemoveProperty { handle, .. }
            | Self::Run { handle, .. }
            | Self::Attach { handle, .. }
            | Self::ProcessStream { handle, .. } => Some(handle),
        }
    }
}

/// Outcome of a dispatched request.
pub enum Reply {
    Json(serde_json::Value),
    Empty,
    /// Raw bytes streamed as the response body.
    Bytes(ByteStream),
    /// Process frames, written after the connection is upgraded.
    Process(ProcessSession),
    /// Auxiliary output, written raw after the connection is upgraded.
    Raw(mpsc::Receiver<bytes::Bytes>),
}

impl Reply {
    fn json<T: serde::Serialize>(value: &T) -> Result<Self, ApiError> {
        serde_json::to_value(value)
            .map(Self::Json)
            .map_err(|e| ApiError::Internal(format!("unencodable response: {e}")))
    }
}

pub struct Dispatcher {
    backend: Arc<dyn Backend>,
    scheduler: Arc<dyn EvictionScheduler>,
    streams: Arc<StreamRegistry>,
    grace_time: Duration,
}

impl Dispatcher {
    /// `grace_time` applies to containers created without one.
    pub fn new(
        backend: Arc<dyn Backend>,
        scheduler: Arc<dyn EvictionScheduler>,
        grace_time: Duration,
    ) -> Self {
        Self {
            backend,
            scheduler,
            streams: Arc::new(StreamRegistry::new()),
            grace_time,
        }
    }

    /// Look up a container and pause its eviction timer for the guard's lifetime.
    async fn container(&self, handle: &str) -> Result<(Arc<dyn Container>, PauseGuard), ApiError> {
        let container = self.backend.lookup(handle).await?;
        let guard = PauseGuard::new(Arc::clone(&self.scheduler), handle);
        Ok((container, guard))
    }

    pub async fn dispatch(&self, request: Request) -> Result<Reply, ApiError> {
        tracing::debug!(route = %request.route(), handle = ?request.handle(), "Dispatching");

        match request {
            Request::Ping => {
                self.backend.ping().await?;
                Ok(Reply::Empty)
            }

            Request::Capacity => Reply::json(&self.backend.capacity().await?),

            Request::Create(request) => {
                let spec = translate::container_spec(request, self.grace_time);
                let container = self.backend.create(spec).await?;
                let handle = container.handle();
                self.scheduler.strap(&handle, container.grace_time());
                tracing::info!(%handle, "Created container");
                Reply::json(&CreateResponse { handle })
            }

            Request::List { filter } => {
                let mut handles = Vec::new();
                for container in self.backend.containers().await? {
                    if !filter.is_empty() {
                        let properties = container.properties().await?;
                        let matches = filter
                            .iter()
                            .all(|(key, value)| properties.get(key) == Some(value));
                        if !matches {
                            continue;
                        }
                    }
                    handles.push(container.handle());
                }
                Reply::json(&ListResponse { handles })
            }

            Request::Destroy { handle } => {
                self.backend.destroy(&handle).await?;
                self.scheduler.defuse(&handle);
                tracing::info!(%handle, "Destroyed container");
                Ok(Reply::Empty)
            }

            Request::Info { handle } => {
                let (container, _guard) = self.container(&handle).await?;
                let info = container.info().await?;
                Reply::json(&InfoResponse::from(info))
            }

            Request::Stop { handle, request } => {
                let (container, guard) = self.container(&handle).await?;
                if request.background {
                    tokio::spawn(async move {
                        let _guard = guard;
                        if let Err(e) = container.stop(request.kill).await {
                            tracing::warn!(%handle, error = %e, "Background stop failed");
                        }
                    });
                } else {
                    container.stop(request.kill).await?;
                }
                Ok(Reply::Empty)
            }

            Request::StreamIn {
                handle,
                destination,
                body,
            } => {
                let (container, _guard) = self.container(&handle).await?;
                container.stream_in(&destination, body).await?;
                Ok(Reply::Empty)
            }

            Request::StreamOut { handle, source } => {
                let (container, guard) = self.container(&handle).await?;
                let reader = container.stream_out(&source).await?;
                Ok(Reply::Bytes(Box::new(GuardedReader {
                    inner: reader,
                    _guard: guard,
                })))
            }

            Request::CopyIn { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                container
                    .copy_in(&request.src_path, &request.dst_path)
                    .await?;
                Ok(Reply::Empty)
            }

            Request::CopyOut { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                container
                    .copy_out(&request.src_path, &request.dst_path, &request.owner)
                    .await?;
                Ok(Reply::Empty)
            }

            Request::LimitBandwidth { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                if let Some(limits) = translate::bandwidth_limits(&request) {
                    container.limit_bandwidth(limits).await?;
                }
                let current = container.current_bandwidth_limits().await?;
                Reply::json(&LimitBandwidthResponse::from(current))
            }

            Request::CurrentBandwidthLimits { handle } => {
                let (container, _guard) = self.container(&handle).await?;
                let current = container.current_bandwidth_limits().await?;
                Reply::json(&LimitBandwidthResponse::from(current))
            }

            Request::LimitCpu { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                if let Some(limits) = translate::cpu_limits(&request) {
                    container.limit_cpu(limits).await?;
                }
                let current = container.current_cpu_limits().await?;
                Reply::json(&LimitCpuResponse::from(current))
            }

            Request::CurrentCpuLimits { handle } => {
                let (container, _guard) = self.container(&handle).await?;
                let current = container.current_cpu_limits().await?;
                Reply::json(&LimitCpuResponse::from(current))
            }

            Request::LimitDisk { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                if let Some(limits) = translate::disk_limits(&request) {
                    container.limit_disk(limits).await?;
                }
                let current = container.current_disk_limits().await?;
                Reply::json(&LimitDiskResponse::from(current))
            }

            Request::CurrentDiskLimits { handle } => {
                let (container, _guard) = self.container(&handle).await?;
                let current = container.current_disk_limits().await?;
                Reply::json(&LimitDiskResponse::from(current))
            }

            Request::LimitMemory { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                if let Some(limits) = translate::memory_limits(&request) {
                    container.limit_memory(limits).await?;
                }
                let current = container.current_memory_limits().await?;
                Reply::json(&LimitMemoryResponse::from(current))
            }

            Request::CurrentMemoryLimits { handle } => {
                let (container, _guard) = self.container(&handle).await?;
                let current = container.current_memory_limits().await?;
                Reply::json(&LimitMemoryResponse::from(current))
            }

            Request::NetIn { handle, request } => {
                let (container, _guard) = self.container(&handle).await?;
                let (host_port, container_port) = container
                    .net_in(
                        request.host_port.unwrap_or_default(),
                        request.container_port.unwrap_or_default(),
                    )
                    .await?;
                Reply::json(&NetInResponse {
                    host_port,
                    container_port,
                })
            }

            Request::NetOut { handle, rule } => {
                let (container, _guard) = self.container(&handle).await?;
                container.net_out(rule).await?;
                Ok(Reply::Empty)
            }

            Request::GetProperty { handle, key } => {
                let (container, _guard) = self.container(&handle).await?;
                let value = container.get_property(&key).await?;
                Reply::json(&PropertyValue { value })
            }

            Request::SetProperty { handle, key, value } => {
                let (container, _guard) = self.container(&handle).await?;
                container.set_property(&key, &value).await?;
                Ok(Reply::Empty)
            }

            Request::RemoveProperty { handle, key } => {
                let (container, _guard) = self.container(&handle).await?;
                container.remove_property(&key).await?;
                Ok(Reply::Empty)
            }

            Request::Run {
                handle,
                request,
                streams,
            } => {
                let (container, guard) = self.container(&handle).await?;
                let (process_id, stream) = container.run(request.into()).await?;
                tracing::info!(%handle, process_id, "Spawned process");
                Ok(Reply::Process(ProcessSession::new(
                    process_id,
                    stream,
                    &streams,
                    Arc::clone(&self.streams),
                    guard,
                )))
            }

            Request::Attach {
                handle,
                process_id,
                streams,
            } => {
                let (container, guard) = self.container(&handle).await?;
                let stream = container.attach(process_id).await?;
                Ok(Reply::Process(ProcessSession::new(
                    process_id,
                    stream,
                    &streams,
                    Arc::clone(&self.streams),
                    guard,
                )))
            }

            Request::ProcessStream {
                handle,
                process_id,
                stream_id,
                stream,
            } => {
                self.backend.lookup(&handle).await?;
                let rx = self.streams.take(stream_id, stream).ok_or_else(|| {
                    ApiError::UnknownStream(format!("{stream_id}/{stream} of process {process_id}"))
                })?;
                Ok(Reply::Raw(rx))
            }
        }
    }
}

/// Reader that keeps a container paused until the body has been sent.
struct GuardedReader {
    inner: ByteStream,
    _guard: PauseGuard,
}

impl AsyncRead for GuardedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}
