//! HTTP route handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, Query, Request as HttpRequest, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
};
use futures::TryStreamExt;
use hyper::upgrade::OnUpgrade;
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use tokio_util::io::{ReaderStream, StreamReader};

use super::dispatch::{Dispatcher, Reply, Request};
use super::error::ApiError;
use super::session::pump_stream;
use crate::backend::NetOutRule;
use crate::protocol::{
    CopyInRequest, CopyOutRequest, CreateRequest, LimitBandwidthRequest, LimitCpuRequest,
    LimitDiskRequest, LimitMemoryRequest, NetInRequest, ProcessQuery, PropertyValue, RunRequest,
    StopRequest, StreamId, StreamInQuery, StreamOutQuery, StreamType,
};
use crate::routes::RouteName;

/// Largest JSON body accepted on an upgrade request.
const MAX_UPGRADE_BODY: usize = 1024 * 1024;

type AppState = State<Arc<Dispatcher>>;
type ApiResult = Result<Response, ApiError>;

/// Decode a JSON body; an empty body means every field is absent.
fn decode<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::Validation(format!("malformed request body: {e}")))
}

fn parse_process_id(raw: &str) -> Result<u32, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::Validation(format!("invalid process id '{raw}'")))
}

fn parse_streams(query: &ProcessQuery) -> Result<Vec<StreamType>, ApiError> {
    let Some(streams) = query.streams.as_deref() else {
        return Ok(Vec::new());
    };
    streams
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.parse().map_err(ApiError::Validation))
        .collect()
}

fn respond(reply: Reply) -> Response {
    match reply {
        Reply::Json(value) => (StatusCode::OK, Json(value)).into_response(),
        Reply::Empty => StatusCode::NO_CONTENT.into_response(),
        Reply::Bytes(reader) => (
            [(header::CONTENT_TYPE, "application/x-tar")],
            Body::from_stream(ReaderStream::new(reader)),
        )
            .into_response(),
        Reply::Process(_) | Reply::Raw(_) => ApiError::Internal(
            "streaming reply without an upgradable connection".to_string(),
        )
        .into_response(),
    }
}

async fn unary(dispatcher: &Dispatcher, request: Request) -> ApiResult {
    Ok(respond(dispatcher.dispatch(request).await?))
}

/// Dispatch a request whose reply takes over the connection.
async fn upgrade(
    dispatcher: &Dispatcher,
    on_upgrade: Option<OnUpgrade>,
    request: Request,
) -> ApiResult {
    let on_upgrade = on_upgrade.ok_or_else(|| {
        ApiError::Validation(format!("{} requires a connection upgrade", request.route()))
    })?;
    let route = request.route();
    let reply = dispatcher.dispatch(request).await?;

    tokio::spawn(async move {
        let upgraded = match on_upgrade.await {
            Ok(upgraded) => TokioIo::new(upgraded),
            Err(e) => {
                tracing::debug!(%route, error = %e, "Connection upgrade failed");
                return;
            }
        };
        match reply {
            Reply::Process(session) => session.run(upgraded).await,
            Reply::Raw(rx) => pump_stream(rx, upgraded).await,
            Reply::Json(_) | Reply::Empty | Reply::Bytes(_) => {
                tracing::warn!(%route, "Non-streaming reply on an upgraded connection");
            }
        }
    });

    Ok(Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::CONNECTION, "Upgrade")
        .header(header::UPGRADE, "tcp")
        .body(Body::empty())
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response()))
}

async fn ping(State(dispatcher): AppState) -> ApiResult {
    unary(&dispatcher, Request::Ping).await
}

async fn capacity(State(dispatcher): AppState) -> ApiResult {
    unary(&dispatcher, Request::Capacity).await
}

async fn create(State(dispatcher): AppState, body: Bytes) -> ApiResult {
    let request: CreateRequest = decode(&body)?;
    unary(&dispatcher, Request::Create(request)).await
}

async fn list(
    State(dispatcher): AppState,
    Query(filter): Query<HashMap<String, String>>,
) -> ApiResult {
    unary(&dispatcher, Request::List { filter }).await
}

async fn destroy(State(dispatcher): AppState, Path(handle): Path<String>) -> ApiResult {
    unary(&dispatcher, Request::Destroy { handle }).await
}

async fn info(State(dispatcher): AppState, Path(handle): Path<String>) -> ApiResult {
    unary(&dispatcher, Request::Info { handle }).await
}

async fn stop(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let request: StopRequest = decode(&body)?;
    unary(&dispatcher, Request::Stop { handle, request }).await
}

async fn stream_in(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    Query(query): Query<StreamInQuery>,
    body: Body,
) -> ApiResult {
    let stream = body.into_data_stream().map_err(std::io::Error::other);
    let request = Request::StreamIn {
        handle,
        destination: query.destination,
        body: Box::new(StreamReader::new(Box::pin(stream))),
    };
    unary(&dispatcher, request).await
}

async fn stream_out(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    Query(query): Query<StreamOutQuery>,
) -> ApiResult {
    let request = Request::StreamOut {
        handle,
        source: query.source,
    };
    unary(&dispatcher, request).await
}

async fn copy_in(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let request: CopyInRequest = decode(&body)?;
    unary(&dispatcher, Request::CopyIn { handle, request }).await
}

async fn copy_out(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    body: Bytes,
) -> ApiResult {
    let request: CopyOutRequest = decode(&body)?;
    unary(&dispatcher, Request::CopyOut { handle, request }).await
}

async fn limit_bandwidth(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    body: Bytes,
) -> ApiResult {
    let request: LimitBandwidthRequest = decode(&body)?;
    unary(&dispatcher, Request::LimitBandwidth { handle, request }).await
}

async fn current_bandwidth_limits(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
) -> ApiResult {
    unary(&dispatcher, Request::CurrentBandwidthLimits { handle }).await
}

async fn limit_cpu(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let request: LimitCpuRequest = decode(&body)?;
    unary(&dispatcher, Request::LimitCpu { handle, request }).await
}

async fn current_cpu_limits(State(dispatcher): AppState, Path(handle): Path<String>) -> ApiResult {
    unary(&dispatcher, Request::CurrentCpuLimits { handle }).await
}

async fn limit_disk(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let request: LimitDiskRequest = decode(&body)?;
    unary(&dispatcher, Request::LimitDisk { handle, request }).await
}

async fn current_disk_limits(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
) -> ApiResult {
    unary(&dispatcher, Request::CurrentDiskLimits { handle }).await
}

async fn limit_memory(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    body: Bytes,
) -> ApiResult {
    let request: LimitMemoryRequest = decode(&body)?;
    unary(&dispatcher, Request::LimitMemory { handle, request }).await
}

async fn current_memory_limits(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
) -> ApiResult {
    unary(&dispatcher, Request::CurrentMemoryLimits { handle }).await
}

async fn net_in(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let request: NetInRequest = decode(&body)?;
    unary(&dispatcher, Request::NetIn { handle, request }).await
}

async fn net_out(State(dispatcher): AppState, Path(handle): Path<String>, body: Bytes) -> ApiResult {
    let rule: NetOutRule = decode(&body)?;
    unary(&dispatcher, Request::NetOut { handle, rule }).await
}

async fn get_property(
    State(dispatcher): AppState,
    Path((handle, key)): Path<(String, String)>,
) -> ApiResult {
    unary(&dispatcher, Request::GetProperty { handle, key }).await
}

async fn set_property(
    State(dispatcher): AppState,
    Path((handle, key)): Path<(String, String)>,
    body: Bytes,
) -> ApiResult {
    let PropertyValue { value } = decode(&body)?;
    unary(&dispatcher, Request::SetProperty { handle, key, value }).await
}

async fn remove_property(
    State(dispatcher): AppState,
    Path((handle, key)): Path<(String, String)>,
) -> ApiResult {
    unary(&dispatcher, Request::RemoveProperty { handle, key }).await
}

async fn run(
    State(dispatcher): AppState,
    Path(handle): Path<String>,
    Query(query): Query<ProcessQuery>,
    request: HttpRequest,
) -> ApiResult {
    let (mut parts, body) = request.into_parts();
    let on_upgrade = parts.extensions.remove::<OnUpgrade>();
    let body = axum::body::to_bytes(body, MAX_UPGRADE_BODY)
        .await
        .map_err(|e| ApiError::Validation(format!("unreadable request body: {e}")))?;
    let request: RunRequest = decode(&body)?;
    let streams = parse_streams(&query)?;

    upgrade(
        &dispatcher,
        on_upgrade,
        Request::Run {
            handle,
            request,
            streams,
        },
    )
    .await
}

async fn attach(
    State(dispatcher): AppState,
    Path((handle, pid)): Path<(String, String)>,
    Query(query): Query<ProcessQuery>,
    request: HttpRequest,
) -> ApiResult {
    let (mut parts, _body) = request.into_parts();
    let on_upgrade = parts.extensions.remove::<OnUpgrade>();
    let process_id = parse_process_id(&pid)?;
    let streams = parse_streams(&query)?;

    upgrade(
        &dispatcher,
        on_upgrade,
        Request::Attach {
            handle,
            process_id,
            streams,
        },
    )
    .await
}

async fn process_stream(
    State(dispatcher): AppState,
    Path((handle, pid, stream_id, stream)): Path<(String, String, String, String)>,
    request: HttpRequest,
) -> ApiResult {
    let (mut parts, _body) = request.into_parts();
    let on_upgrade = parts.extensions.remove::<OnUpgrade>();
    let process_id = parse_process_id(&pid)?;
    let stream_id = StreamId::parse(&stream_id)
        .map_err(|_| ApiError::UnknownStream(stream_id.clone()))?;
    let stream = stream.parse().map_err(ApiError::UnknownStream)?;

    upgrade(
        &dispatcher,
        on_upgrade,
        Request::ProcessStream {
            handle,
            process_id,
            stream_id,
            stream,
        },
    )
    .await
}

pub fn routes(dispatcher: Arc<Dispatcher>) -> Router {
    Router::new()
        .route(RouteName::Ping.path(), get(ping))
        .route(RouteName::Capacity.path(), get(capacity))
        .route(RouteName::Create.path(), post(create).get(list))
        .route(RouteName::Destroy.path(), delete(destroy))
        .route(RouteName::Info.path(), get(info))
        .route(RouteName::Stop.path(), put(stop))
        .route(RouteName::StreamIn.path(), put(stream_in).get(stream_out))
        .route(RouteName::CopyIn.path(), post(copy_in))
        .route(RouteName::CopyOut.path(), post(copy_out))
        .route(
            RouteName::LimitBandwidth.path(),
            put(limit_bandwidth).get(current_bandwidth_limits),
        )
        .route(
            RouteName::LimitCpu.path(),
            put(limit_cpu).get(current_cpu_limits),
        )
        .route(
            RouteName::LimitDisk.path(),
            put(limit_disk).get(current_disk_limits),
        )
        .route(
            RouteName::LimitMemory.path(),
            put(limit_memory).get(current_memory_limits),
        )
        .route(RouteName::NetIn.path(), post(net_in))
        .route(RouteName::NetOut.path(), post(net_out))
        .route(
            RouteName::GetProperty.path(),
            get(get_property).put(set_property).delete(remove_property),
        )
        .route(RouteName::Run.path(), post(run))
        .route(RouteName::Attach.path(), get(attach))
        .route(RouteName::ProcessStream.path(), get(process_stream))
        .with_state(dispatcher)
}
