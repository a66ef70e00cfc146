//! In-memory backend and server harness shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::{Notify, mpsc, oneshot};

use warden_bridge::backend::{
    Backend, BackendError, BandwidthLimits, ByteStream, Capacity, Container, ContainerInfo,
    ContainerSpec, CpuLimits, CpuStat, DiskLimits, EnvironmentVariable, MemoryLimits,
    MemoryStat, NetOutRule, PortMapping, ProcessEvent, ProcessSource, ProcessSpec, ProcessStream,
    Properties,
};
use warden_bridge::client::{Connection, ConnectionConfig, OutputMode};
use warden_bridge::server::{ServerConfig, serve_on};

/// Sink that collects everything written to it.
#[derive(Clone, Default)]
pub struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl AsyncWrite for SharedBuf {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Event history of one process, fanned out to every attached stream.
struct ProcessLog {
    events: Vec<ProcessEvent>,
    subscribers: Vec<mpsc::Sender<ProcessEvent>>,
    done: bool,
}

#[derive(Clone)]
struct Emitter(Arc<Mutex<ProcessLog>>);

impl Emitter {
    fn new() -> (Self, mpsc::Receiver<ProcessEvent>) {
        let (tx, rx) = mpsc::channel(256);
        let log = ProcessLog {
            events: Vec::new(),
            subscribers: vec![tx],
            done: false,
        };
        (Self(Arc::new(Mutex::new(log))), rx)
    }

    fn emit(&self, event: ProcessEvent) {
        let mut log = self.0.lock().unwrap();
        if log.done {
            return;
        }
        for subscriber in &log.subscribers {
            let _ = subscriber.try_send(event.clone());
        }
        let terminal = !matches!(event, ProcessEvent::Output { .. });
        log.events.push(event);
        if terminal {
            log.done = true;
            log.subscribers.clear();
        }
    }

    fn output(&self, source: ProcessSource, data: impl Into<Bytes>) {
        self.emit(ProcessEvent::Output {
            source,
            data: data.into(),
        });
    }

    /// End the process without an exit status.
    fn vanish(&self) {
        let mut log = self.0.lock().unwrap();
        log.done = true;
        log.subscribers.clear();
    }

    fn subscribe(&self) -> mpsc::Receiver<ProcessEvent> {
        let (tx, rx) = mpsc::channel(256);
        let mut log = self.0.lock().unwrap();
        for event in &log.events {
            let _ = tx.try_send(event.clone());
        }
        if !log.done {
            log.subscribers.push(tx);
        }
        rx
    }
}

/// Interpret a tiny command language:
///
/// - `echo TEXT`: TEXT plus a newline on stdout, exit 0
/// - `warn TEXT`: TEXT plus a newline on stderr, exit 0
/// - `both`: "out\n" on stdout and "err\n" on stderr, exit 0
/// - `cat`: copy stdin to stdout until it closes, exit 0
/// - `env KEY`: the value of KEY on stdout, exit 0
/// - `exit N`: exit N
/// - `fail MESSAGE`: fail with MESSAGE
/// - `vanish`: end without an exit status
async fn interpret(
    spec: ProcessSpec,
    emitter: Emitter,
    mut stdin: mpsc::UnboundedReceiver<Bytes>,
) {
    let (command, arg) = spec
        .script
        .split_once(' ')
        .unwrap_or((spec.script.as_str(), ""));

    match command {
        "echo" => {
            emitter.output(ProcessSource::Stdout, format!("{arg}\n"));
            emitter.emit(ProcessEvent::Exited(0));
        }
        "warn" => {
            emitter.output(ProcessSource::Stderr, format!("{arg}\n"));
            emitter.emit(ProcessEvent::Exited(0));
        }
        "both" => {
            emitter.output(ProcessSource::Stdout, "out\n");
            emitter.output(ProcessSource::Stderr, "err\n");
            emitter.emit(ProcessEvent::Exited(0));
        }
        "cat" => {
            while let Some(chunk) = stdin.recv().await {
                emitter.output(ProcessSource::Stdout, chunk);
            }
            emitter.emit(ProcessEvent::Exited(0));
        }
        "env" => {
            let value = spec
                .env
                .iter()
                .find(|var| var.key == arg)
                .map(|var| var.value.clone())
                .unwrap_or_default();
            emitter.output(ProcessSource::Stdout, value);
            emitter.emit(ProcessEvent::Exited(0));
        }
        "exit" => {
            emitter.emit(ProcessEvent::Exited(arg.parse().unwrap_or(1)));
        }
        "fail" => emitter.emit(ProcessEvent::Failed(arg.to_string())),
        "vanish" => emitter.vanish(),
        other => emitter.emit(ProcessEvent::Failed(format!("unknown command: {other}"))),
    }
}

#[derive(Default)]
struct Limits {
    bandwidth: BandwidthLimits,
    cpu: CpuLimits,
    disk: DiskLimits,
    memory: MemoryLimits,
}

pub struct FakeContainer {
    spec: ContainerSpec,
    properties: Mutex<Properties>,
    files: Mutex<HashMap<String, Vec<u8>>>,
    limits: Mutex<Limits>,
    processes: Mutex<HashMap<u32, Emitter>>,
    next_pid: AtomicU32,
    next_port: AtomicU32,
    net_out: Mutex<Vec<NetOutRule>>,
    copies: Mutex<Vec<String>>,
    stopped: AtomicBool,
    hold_stop: AtomicBool,
    stop_released: Notify,
}

impl FakeContainer {
    fn new(spec: ContainerSpec) -> Self {
        Self {
            properties: Mutex::new(spec.properties.clone()),
            spec,
            files: Mutex::new(HashMap::new()),
            limits: Mutex::new(Limits::default()),
            processes: Mutex::new(HashMap::new()),
            next_pid: AtomicU32::new(1),
            next_port: AtomicU32::new(61001),
            net_out: Mutex::new(Vec::new()),
            copies: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            hold_stop: AtomicBool::new(false),
            stop_released: Notify::new(),
        }
    }

    pub fn env(&self) -> Vec<EnvironmentVariable> {
        self.spec.env.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Make `stop` block until [`FakeContainer::release_stop`] is called.
    pub fn hold_stop(&self) {
        self.hold_stop.store(true, Ordering::SeqCst);
    }

    pub fn release_stop(&self) {
        self.stop_released.notify_one();
    }

    pub fn copies(&self) -> Vec<String> {
        self.copies.lock().unwrap().clone()
    }

    pub fn net_out_rules(&self) -> Vec<NetOutRule> {
        self.net_out.lock().unwrap().clone()
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn handle(&self) -> String {
        self.spec.handle.clone()
    }

    fn grace_time(&self) -> Duration {
        self.spec.grace_time
    }

    async fn properties(&self) -> Result<Properties, BackendError> {
        Ok(self.properties.lock().unwrap().clone())
    }

    async fn get_property(&self, name: &str) -> Result<String, BackendError> {
        self.properties
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| BackendError::failed(format!("no such property: {name}")))
    }

    async fn set_property(&self, name: &str, value: &str) -> Result<(), BackendError> {
        self.properties
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
        Ok(())
    }

    async fn remove_property(&self, name: &str) -> Result<(), BackendError> {
        self.properties
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| BackendError::failed(format!("no such property: {name}")))
    }

    async fn stop(&self, _kill: bool) -> Result<(), BackendError> {
        if self.hold_stop.load(Ordering::SeqCst) {
            self.stop_released.notified().await;
        }
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn info(&self) -> Result<ContainerInfo, BackendError> {
        let mut process_ids: Vec<u32> = self.processes.lock().unwrap().keys().copied().collect();
        process_ids.sort_unstable();
        let state = if self.is_stopped() { "stopped" } else { "active" };
        Ok(ContainerInfo {
            state: state.to_string(),
            events: vec!["created".to_string()],
            host_ip: "10.254.0.1".to_string(),
            container_ip: "10.254.0.2".to_string(),
            external_ip: "192.0.2.10".to_string(),
            container_path: format!("/var/lib/warden/{}", self.spec.handle),
            process_ids,
            properties: self.properties.lock().unwrap().clone(),
            cpu_stat: CpuStat {
                usage: 1200,
                user: 800,
                system: 400,
            },
            memory_stat: MemoryStat {
                rss: 4096,
                cache: 1024,
                ..MemoryStat::default()
            },
            mapped_ports: vec![PortMapping {
                host_port: 61001,
                container_port: 8080,
            }],
            ..ContainerInfo::default()
        })
    }

    async fn copy_in(&self, src_path: &str, dst_path: &str) -> Result<(), BackendError> {
        self.copies
            .lock()
            .unwrap()
            .push(format!("in {src_path} -> {dst_path}"));
        Ok(())
    }

    async fn copy_out(
        &self,
        src_path: &str,
        dst_path: &str,
        owner: &str,
    ) -> Result<(), BackendError> {
        self.copies
            .lock()
            .unwrap()
            .push(format!("out {src_path} -> {dst_path} ({owner})"));
        Ok(())
    }

    async fn stream_in(&self, dst_path: &str, mut tar: ByteStream) -> Result<(), BackendError> {
        let mut data = Vec::new();
        tar.read_to_end(&mut data)
            .await
            .map_err(|e| BackendError::failed(e.to_string()))?;
        self.files.lock().unwrap().insert(dst_path.to_string(), data);
        Ok(())
    }

    async fn stream_out(&self, src_path: &str) -> Result<ByteStream, BackendError> {
        let data = self
            .file(src_path)
            .ok_or_else(|| BackendError::failed(format!("no such file: {src_path}")))?;
        Ok(Box::new(io::Cursor::new(data)))
    }

    async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<(), BackendError> {
        self.limits.lock().unwrap().bandwidth = limits;
        Ok(())
    }

    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits, BackendError> {
        Ok(self.limits.lock().unwrap().bandwidth)
    }

    async fn limit_cpu(&self, limits: CpuLimits) -> Result<(), BackendError> {
        self.limits.lock().unwrap().cpu = limits;
        Ok(())
    }

    async fn current_cpu_limits(&self) -> Result<CpuLimits, BackendError> {
        Ok(self.limits.lock().unwrap().cpu)
    }

    async fn limit_disk(&self, limits: DiskLimits) -> Result<(), BackendError> {
        self.limits.lock().unwrap().disk = limits;
        Ok(())
    }

    async fn current_disk_limits(&self) -> Result<DiskLimits, BackendError> {
        Ok(self.limits.lock().unwrap().disk)
    }

    async fn limit_memory(&self, limits: MemoryLimits) -> Result<(), BackendError> {
        self.limits.lock().unwrap().memory = limits;
        Ok(())
    }

    async fn current_memory_limits(&self) -> Result<MemoryLimits, BackendError> {
        Ok(self.limits.lock().unwrap().memory)
    }

    async fn net_in(
        &self,
        host_port: u32,
        container_port: u32,
    ) -> Result<(u32, u32), BackendError> {
        let host_port = if host_port == 0 {
            self.next_port.fetch_add(1, Ordering::SeqCst)
        } else {
            host_port
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };
        Ok((host_port, container_port))
    }

    async fn net_out(&self, rule: NetOutRule) -> Result<(), BackendError> {
        self.net_out.lock().unwrap().push(rule);
        Ok(())
    }

    async fn run(&self, spec: ProcessSpec) -> Result<(u32, ProcessStream), BackendError> {
        let process_id = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let (emitter, events) = Emitter::new();
        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        self.processes
            .lock()
            .unwrap()
            .insert(process_id, emitter.clone());

        tokio::spawn(interpret(spec, emitter, stdin_rx));

        Ok((
            process_id,
            ProcessStream {
                events,
                stdin: Some(stdin_tx),
            },
        ))
    }

    async fn attach(&self, process_id: u32) -> Result<ProcessStream, BackendError> {
        let emitter = self
            .processes
            .lock()
            .unwrap()
            .get(&process_id)
            .cloned()
            .ok_or(BackendError::ProcessNotFound(process_id))?;
        Ok(ProcessStream {
            events: emitter.subscribe(),
            stdin: None,
        })
    }
}

#[derive(Default)]
pub struct FakeBackend {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
    next_handle: AtomicU32,
    destroy_error: Mutex<Option<String>>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Backend that already holds containers with the given handles and grace time.
    pub fn with_containers(handles: &[&str], grace_time: Duration) -> Arc<Self> {
        let backend = Self::default();
        {
            let mut containers = backend.containers.lock().unwrap();
            for handle in handles {
                let spec = ContainerSpec {
                    handle: handle.to_string(),
                    grace_time,
                    ..ContainerSpec::default()
                };
                containers.insert(handle.to_string(), Arc::new(FakeContainer::new(spec)));
            }
        }
        Arc::new(backend)
    }

    pub fn container(&self, handle: &str) -> Option<Arc<FakeContainer>> {
        self.containers.lock().unwrap().get(handle).cloned()
    }

    /// Make every later destroy fail with `message`, leaving the container in place.
    pub fn fail_destroys(&self, message: &str) {
        *self.destroy_error.lock().unwrap() = Some(message.to_string());
    }

    pub fn handles(&self) -> Vec<String> {
        let mut handles: Vec<String> = self.containers.lock().unwrap().keys().cloned().collect();
        handles.sort();
        handles
    }
}

#[async_trait]
impl Backend for FakeBackend {
    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn capacity(&self) -> Result<Capacity, BackendError> {
        Ok(Capacity {
            memory_in_bytes: 8 << 30,
            disk_in_bytes: 64 << 30,
            max_containers: 256,
        })
    }

    async fn create(&self, mut spec: ContainerSpec) -> Result<Arc<dyn Container>, BackendError> {
        let mut containers = self.containers.lock().unwrap();
        if spec.handle.is_empty() {
            let n = self.next_handle.fetch_add(1, Ordering::SeqCst);
            spec.handle = format!("container-{n}");
        }
        if containers.contains_key(&spec.handle) {
            return Err(BackendError::failed(format!(
                "handle already exists: {}",
                spec.handle
            )));
        }
        let container = Arc::new(FakeContainer::new(spec));
        containers.insert(container.handle(), Arc::clone(&container));
        Ok(container)
    }

    async fn destroy(&self, handle: &str) -> Result<(), BackendError> {
        if let Some(message) = self.destroy_error.lock().unwrap().clone() {
            return Err(BackendError::failed(message));
        }
        self.containers
            .lock()
            .unwrap()
            .remove(handle)
            .map(|_| ())
            .ok_or_else(|| BackendError::ContainerNotFound(handle.to_string()))
    }

    async fn containers(&self) -> Result<Vec<Arc<dyn Container>>, BackendError> {
        Ok(self
            .containers
            .lock()
            .unwrap()
            .values()
            .map(|c| Arc::clone(c) as Arc<dyn Container>)
            .collect())
    }

    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, BackendError> {
        self.container(handle)
            .map(|c| c as Arc<dyn Container>)
            .ok_or_else(|| BackendError::ContainerNotFound(handle.to_string()))
    }
}

/// A server on an ephemeral port, shut down when dropped.
pub struct TestServer {
    pub address: String,
    pub backend: Arc<FakeBackend>,
    _shutdown: oneshot::Sender<()>,
}

impl TestServer {
    pub async fn start(backend: Arc<FakeBackend>) -> Self {
        Self::start_with(backend, ServerConfig::default()).await
    }

    pub async fn start_with(backend: Arc<FakeBackend>, config: ServerConfig) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let (shutdown, rx) = oneshot::channel::<()>();

        let server_backend = Arc::clone(&backend);
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = rx.await;
            };
            if let Err(e) = serve_on(listener, config, server_backend, shutdown).await {
                panic!("test server failed: {e}");
            }
        });

        Self {
            address,
            backend,
            _shutdown: shutdown,
        }
    }

    pub fn connect(&self) -> Connection {
        self.connect_with(OutputMode::Auxiliary)
    }

    pub fn connect_with(&self, output_mode: OutputMode) -> Connection {
        let config = ConnectionConfig::new(self.address.clone()).with_output_mode(output_mode);
        Connection::new(config).unwrap()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
