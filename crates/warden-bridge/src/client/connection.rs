//! Client transport: unary calls, byte-stream calls and hijacks.

use std::time::Duration;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http_body_util::{BodyExt, Full};
use hyper::StatusCode;
use hyper::header::{CONNECTION, CONTENT_TYPE, HOST, UPGRADE};
use hyper_util::rt::TokioIo;
use reqwest::Url;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::io::{ReaderStream, StreamReader};

use super::error::{Error, Result};
use super::process::{Process, ProcessIo};
use super::stream_handler::StreamHandler;
use crate::backend::{
    BandwidthLimits, ByteStream, Capacity, ContainerInfo, ContainerSpec, CpuLimits, DiskLimits,
    EnvironmentVariable, MemoryLimits, NetOutRule, ProcessSpec, Properties,
};
use crate::protocol::{
    CopyInRequest, CopyOutRequest, CreateRequest, CreateResponse, ErrorBody, InfoResponse,
    JsonCodec, LimitBandwidthRequest, LimitBandwidthResponse, LimitCpuRequest, LimitCpuResponse,
    LimitDiskRequest, LimitDiskResponse, LimitMemoryRequest, LimitMemoryResponse, ListResponse,
    NetInRequest, NetInResponse, ProcessPayload, PropertyValue, RunRequest, StopRequest,
    StreamType,
};
use crate::routes::RouteName;

/// Raw duplex stream left over after a successful hijack.
pub type Hijacked = TokioIo<hyper::upgrade::Upgraded>;

const NO_BODY: Option<&()> = None;
const JSON: &str = "application/json";
const OCTET_STREAM: &str = "application/octet-stream";
const TAR: &str = "application/x-tar";

/// Where process output travels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// One extra hijacked connection per output sink.
    #[default]
    Auxiliary,
    /// Output arrives as data frames on the process connection.
    Inline,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// `host:port` of the server.
    pub address: String,
    /// Connect timeout for every new connection.
    pub dial_timeout: Duration,
    /// Reuse idle connections for unary calls.
    pub keep_alive: bool,
    pub output_mode: OutputMode,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:7777".to_string(),
            dial_timeout: Duration::from_secs(1),
            keep_alive: false,
            output_mode: OutputMode::Auxiliary,
        }
    }
}

impl ConnectionConfig {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Default::default()
        }
    }

    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = dial_timeout;
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_output_mode(mut self, output_mode: OutputMode) -> Self {
        self.output_mode = output_mode;
        self
    }
}

/// Split `KEY=VALUE` entries, rejecting malformed ones.
pub fn parse_env<S: AsRef<str>>(entries: &[S]) -> Result<Vec<EnvironmentVariable>> {
    entries
        .iter()
        .map(|entry| {
            let entry = entry.as_ref();
            EnvironmentVariable::parse(entry).ok_or_else(|| {
                Error::Validation(format!(
                    "malformed environment variable '{entry}', expected KEY=VALUE"
                ))
            })
        })
        .collect()
}

/// Handle to one server endpoint. Cheap to clone.
#[derive(Clone)]
pub struct Connection {
    config: ConnectionConfig,
    base: Url,
    client: reqwest::Client,
    stream_client: reqwest::Client,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        let base = Url::parse(&format!("http://{}", config.address)).map_err(|e| {
            Error::Validation(format!("invalid address '{}': {e}", config.address))
        })?;

        let idle = if config.keep_alive { usize::MAX } else { 0 };
        let client = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .pool_max_idle_per_host(idle)
            .build()?;

        // Streams never share a socket.
        let stream_client = reqwest::Client::builder()
            .connect_timeout(config.dial_timeout)
            .pool_max_idle_per_host(0)
            .build()?;

        Ok(Self {
            config,
            base,
            client,
            stream_client,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Unary call: optional JSON body in, JSON body out.
    pub async fn call<B, T>(
        &self,
        route: RouteName,
        body: Option<&B>,
        params: &[(&str, &str)],
        query: &[(&str, &str)],
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.send(route, body, params, query).await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| Error::Protocol(format!("undecodable {route} response: {e}")))
    }

    async fn send<B>(
        &self,
        route: RouteName,
        body: Option<&B>,
        params: &[(&str, &str)],
        query: &[(&str, &str)],
    ) -> Result<Bytes>
    where
        B: Serialize + ?Sized,
    {
        let url = route.url(&self.base, params, query)?;
        tracing::debug!(%route, %url, "Calling server");

        let mut request = self.client.request(route.method(), url);
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(remote_error(status.as_u16(), &bytes));
        }
        Ok(bytes)
    }

    /// Byte-stream call: the request body and the response body are streamed,
    /// never buffered.
    pub async fn stream(
        &self,
        route: RouteName,
        body: Option<ByteStream>,
        params: &[(&str, &str)],
        query: &[(&str, &str)],
        content_type: &str,
    ) -> Result<ByteStream> {
        let url = route.url(&self.base, params, query)?;
        tracing::debug!(%route, %url, "Streaming from server");

        let mut request = self
            .stream_client
            .request(route.method(), url)
            .header(CONTENT_TYPE, content_type);
        if let Some(body) = body {
            request = request.body(reqwest::Body::wrap_stream(ReaderStream::new(body)));
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let bytes = response.bytes().await?;
            return Err(remote_error(status.as_u16(), &bytes));
        }

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }

    /// Perform one request on a dedicated connection and take over its socket.
    ///
    /// The server must answer `101 Switching Protocols`; the connection is
    /// never returned to a pool.
    pub async fn hijack(
        &self,
        route: RouteName,
        body: Option<Bytes>,
        params: &[(&str, &str)],
        query: &[(&str, &str)],
        content_type: &str,
    ) -> Result<Hijacked> {
        let url = route.url(&self.base, params, query)?;
        let target = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };

        let address = &self.config.address;
        let tcp = tokio::time::timeout(self.config.dial_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| {
                Error::Dial(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("dialing {address} timed out"),
                ))
            })?
            .map_err(Error::Dial)?;

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(tcp)).await?;
        tokio::spawn(async move {
            if let Err(e) = conn.with_upgrades().await {
                tracing::debug!(error = %e, "Hijacked connection ended");
            }
        });

        let request = hyper::Request::builder()
            .method(route.method())
            .uri(target)
            .header(HOST, address.as_str())
            .header(CONNECTION, "Upgrade")
            .header(UPGRADE, "tcp")
            .header(CONTENT_TYPE, content_type)
            .body(Full::new(body.unwrap_or_default()))
            .map_err(|e| Error::Validation(e.to_string()))?;

        tracing::debug!(%route, %url, "Hijacking connection");
        let mut response = sender.send_request(request).await?;
        let status = response.status();
        if status != StatusCode::SWITCHING_PROTOCOLS {
            let bytes = response.into_body().collect().await?.to_bytes();
            if status.is_success() {
                return Err(Error::Protocol(format!(
                    "{route} answered {status} without upgrading"
                )));
            }
            return Err(remote_error(status.as_u16(), &bytes));
        }

        let upgraded = hyper::upgrade::on(&mut response).await?;
        Ok(TokioIo::new(upgraded))
    }

    pub async fn ping(&self) -> Result<()> {
        self.send(RouteName::Ping, NO_BODY, &[], &[]).await?;
        Ok(())
    }

    pub async fn capacity(&self) -> Result<Capacity> {
        self.call(RouteName::Capacity, NO_BODY, &[], &[]).await
    }

    /// Create a container; returns the handle the backend assigned.
    pub async fn create(&self, spec: ContainerSpec) -> Result<String> {
        let request = CreateRequest::from(spec);
        let response: CreateResponse = self
            .call(RouteName::Create, Some(&request), &[], &[])
            .await?;
        Ok(response.handle)
    }

    pub async fn destroy(&self, handle: &str) -> Result<()> {
        self.send(RouteName::Destroy, NO_BODY, &[("handle", handle)], &[])
            .await?;
        Ok(())
    }

    /// Handles of all containers whose properties include every entry of `filter`.
    pub async fn list(&self, filter: &Properties) -> Result<Vec<String>> {
        let mut query: Vec<(&str, &str)> = filter
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        query.sort();
        let response: ListResponse = self.call(RouteName::List, NO_BODY, &[], &query).await?;
        Ok(response.handles)
    }

    pub async fn info(&self, handle: &str) -> Result<ContainerInfo> {
        let response: InfoResponse = self
            .call(RouteName::Info, NO_BODY, &[("handle", handle)], &[])
            .await?;
        Ok(ContainerInfo::try_from(response)?)
    }

    pub async fn stop(&self, handle: &str, kill: bool, background: bool) -> Result<()> {
        let request = StopRequest { kill, background };
        self.send(RouteName::Stop, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok(())
    }

    /// Upload a tar stream and extract it at `destination` in the container.
    pub async fn stream_in(&self, handle: &str, destination: &str, tar: ByteStream) -> Result<()> {
        let _ = self
            .stream(
                RouteName::StreamIn,
                Some(tar),
                &[("handle", handle)],
                &[("destination", destination)],
                TAR,
            )
            .await?;
        Ok(())
    }

    /// Download `source` from the container as a tar stream.
    pub async fn stream_out(&self, handle: &str, source: &str) -> Result<ByteStream> {
        self.stream(
            RouteName::StreamOut,
            None,
            &[("handle", handle)],
            &[("source", source)],
            TAR,
        )
        .await
    }

    pub async fn copy_in(&self, handle: &str, src_path: &str, dst_path: &str) -> Result<()> {
        let request = CopyInRequest {
            src_path: src_path.to_string(),
            dst_path: dst_path.to_string(),
        };
        self.send(RouteName::CopyIn, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok(())
    }

    pub async fn copy_out(
        &self,
        handle: &str,
        src_path: &str,
        dst_path: &str,
        owner: &str,
    ) -> Result<()> {
        let request = CopyOutRequest {
            src_path: src_path.to_string(),
            dst_path: dst_path.to_string(),
            owner: owner.to_string(),
        };
        self.send(RouteName::CopyOut, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok(())
    }

    /// Apply bandwidth limits; returns the limits now in effect.
    pub async fn limit_bandwidth(
        &self,
        handle: &str,
        limits: BandwidthLimits,
    ) -> Result<BandwidthLimits> {
        let request = LimitBandwidthRequest::from(limits);
        let response: LimitBandwidthResponse = self
            .call(
                RouteName::LimitBandwidth,
                Some(&request),
                &[("handle", handle)],
                &[],
            )
            .await?;
        Ok(response.into())
    }

    pub async fn current_bandwidth_limits(&self, handle: &str) -> Result<BandwidthLimits> {
        let response: LimitBandwidthResponse = self
            .call(
                RouteName::CurrentBandwidthLimits,
                NO_BODY,
                &[("handle", handle)],
                &[],
            )
            .await?;
        Ok(response.into())
    }

    pub async fn limit_cpu(&self, handle: &str, limits: CpuLimits) -> Result<CpuLimits> {
        let request = LimitCpuRequest::from(limits);
        let response: LimitCpuResponse = self
            .call(RouteName::LimitCpu, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok(response.into())
    }

    pub async fn current_cpu_limits(&self, handle: &str) -> Result<CpuLimits> {
        let response: LimitCpuResponse = self
            .call(RouteName::CurrentCpuLimits, NO_BODY, &[("handle", handle)], &[])
            .await?;
        Ok(response.into())
    }

    pub async fn limit_disk(&self, handle: &str, limits: DiskLimits) -> Result<DiskLimits> {
        let request = LimitDiskRequest::from(limits);
        let response: LimitDiskResponse = self
            .call(RouteName::LimitDisk, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok(response.into())
    }

    pub async fn current_disk_limits(&self, handle: &str) -> Result<DiskLimits> {
        let response: LimitDiskResponse = self
            .call(RouteName::CurrentDiskLimits, NO_BODY, &[("handle", handle)], &[])
            .await?;
        Ok(response.into())
    }

    pub async fn limit_memory(&self, handle: &str, limits: MemoryLimits) -> Result<MemoryLimits> {
        let request = LimitMemoryRequest::from(limits);
        let response: LimitMemoryResponse = self
            .call(
                RouteName::LimitMemory,
                Some(&request),
                &[("handle", handle)],
                &[],
            )
            .await?;
        Ok(response.into())
    }

    pub async fn current_memory_limits(&self, handle: &str) -> Result<MemoryLimits> {
        let response: LimitMemoryResponse = self
            .call(
                RouteName::CurrentMemoryLimits,
                NO_BODY,
                &[("handle", handle)],
                &[],
            )
            .await?;
        Ok(response.into())
    }

    /// Map a host port to a container port; zero lets the backend choose.
    /// Returns the `(host_port, container_port)` pair actually mapped.
    pub async fn net_in(
        &self,
        handle: &str,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32)> {
        let request = NetInRequest {
            host_port: Some(host_port),
            container_port: Some(container_port),
        };
        let response: NetInResponse = self
            .call(RouteName::NetIn, Some(&request), &[("handle", handle)], &[])
            .await?;
        Ok((response.host_port, response.container_port))
    }

    pub async fn net_out(&self, handle: &str, rule: NetOutRule) -> Result<()> {
        self.send(RouteName::NetOut, Some(&rule), &[("handle", handle)], &[])
            .await?;
        Ok(())
    }

    pub async fn get_property(&self, handle: &str, key: &str) -> Result<String> {
        let response: PropertyValue = self
            .call(
                RouteName::GetProperty,
                NO_BODY,
                &[("handle", handle), ("key", key)],
                &[],
            )
            .await?;
        Ok(response.value)
    }

    pub async fn set_property(&self, handle: &str, key: &str, value: &str) -> Result<()> {
        let request = PropertyValue {
            value: value.to_string(),
        };
        self.send(
            RouteName::SetProperty,
            Some(&request),
            &[("handle", handle), ("key", key)],
            &[],
        )
        .await?;
        Ok(())
    }

    pub async fn remove_property(&self, handle: &str, key: &str) -> Result<()> {
        self.send(
            RouteName::RemoveProperty,
            NO_BODY,
            &[("handle", handle), ("key", key)],
            &[],
        )
        .await?;
        Ok(())
    }

    /// Spawn a process in the container and wire up its I/O.
    pub async fn run(&self, handle: &str, spec: ProcessSpec, io: ProcessIo) -> Result<Process> {
        let body = serde_json::to_vec(&RunRequest::from(spec))
            .map_err(|e| Error::Validation(e.to_string()))?;
        self.start_process(RouteName::Run, handle, None, Some(Bytes::from(body)), io)
            .await
    }

    /// Reattach to a running process by ID.
    pub async fn attach(&self, handle: &str, process_id: u32, io: ProcessIo) -> Result<Process> {
        self.start_process(RouteName::Attach, handle, Some(process_id), None, io)
            .await
    }

    async fn start_process(
        &self,
        route: RouteName,
        handle: &str,
        process_id: Option<u32>,
        body: Option<Bytes>,
        io: ProcessIo,
    ) -> Result<Process> {
        let ProcessIo {
            stdin,
            stdout,
            stderr,
        } = io;
        let auxiliary = self.config.output_mode == OutputMode::Auxiliary;

        let mut streams = Vec::new();
        if auxiliary && stdout.is_some() {
            streams.push(StreamType::Stdout.as_str());
        }
        if auxiliary && stderr.is_some() {
            streams.push(StreamType::Stderr.as_str());
        }
        let streams = streams.join(",");
        let stream_query = [("streams", streams.as_str())];
        let query: &[(&str, &str)] = if streams.is_empty() {
            &[]
        } else {
            &stream_query
        };

        let pid = process_id.map(|pid| pid.to_string());
        let mut params = vec![("handle", handle)];
        if let Some(pid) = &pid {
            params.push(("pid", pid.as_str()));
        }

        let conn = self.hijack(route, body, &params, query, JSON).await?;
        let (reader, writer) = tokio::io::split(conn);
        let mut frames = FramedRead::new(reader, JsonCodec::<ProcessPayload>::new());

        let (started_id, stream_id) = match frames.next().await {
            Some(Ok(ProcessPayload::Started {
                process_id,
                stream_id,
            })) => (process_id, stream_id),
            Some(Ok(ProcessPayload::Error { message, .. })) => return Err(Error::Process(message)),
            Some(Ok(other)) => {
                return Err(Error::Protocol(format!(
                    "expected started frame, got {other:?}"
                )));
            }
            Some(Err(e)) => return Err(Error::Protocol(e.to_string())),
            None => {
                return Err(Error::Protocol(
                    "connection closed before the process started".to_string(),
                ));
            }
        };
        if let Some(expected) = process_id
            && expected != started_id
        {
            return Err(Error::Protocol(format!(
                "attached to process {started_id}, expected {expected}"
            )));
        }
        tracing::debug!(%handle, process_id = started_id, %stream_id, "Process started");

        let mut handler = StreamHandler::new();
        for (stream, sink) in [(StreamType::Stdout, stdout), (StreamType::Stderr, stderr)] {
            let Some(sink) = sink else {
                continue;
            };
            if auxiliary {
                handler
                    .attach(self, handle, started_id, stream_id, stream, sink)
                    .await?;
            } else {
                handler.inline(stream, sink);
            }
        }

        Ok(Process::spawn(
            started_id,
            stream_id,
            frames,
            FramedWrite::new(writer, JsonCodec::new()),
            stdin,
            handler,
        ))
    }

    /// Hijack one auxiliary output stream of a process session.
    pub(crate) async fn hijack_process_stream(
        &self,
        handle: &str,
        process_id: u32,
        stream_id: &str,
        stream: StreamType,
    ) -> Result<Hijacked> {
        let pid = process_id.to_string();
        self.hijack(
            RouteName::ProcessStream,
            None,
            &[
                ("handle", handle),
                ("pid", pid.as_str()),
                ("stream_id", stream_id),
                ("stream", stream.as_str()),
            ],
            &[],
            OCTET_STREAM,
        )
        .await
    }
}

/// Map a non-success response to an error, preferring the JSON error body.
fn remote_error(code: u16, body: &[u8]) -> Error {
    match serde_json::from_slice::<ErrorBody>(body) {
        Ok(ErrorBody {
            handle: Some(handle),
            ..
        }) if code == 404 => Error::ContainerNotFound { handle },
        Ok(body) => Error::Remote {
            code,
            message: body.message,
        },
        Err(_) => Error::Remote {
            code,
            message: String::from_utf8_lossy(body).trim().to_string(),
        },
    }
}
