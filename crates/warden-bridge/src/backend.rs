//! Container backend capability set and the domain types it speaks.
//!
//! The backend does the real work (isolation, filesystem copy, networking);
//! this crate only calls it. Implementations must be safe to share across
//! connection tasks.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

/// Container properties: unique keys, arbitrary string values.
pub type Properties = HashMap<String, String>;

/// Boxed byte source handed to or returned from a backend.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BackendError {
    #[error("unknown handle: {0}")]
    ContainerNotFound(String),

    #[error("unknown process: {0}")]
    ProcessNotFound(u32),

    #[error("{0}")]
    Failed(String),
}

impl BackendError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Capacity {
    pub memory_in_bytes: u64,
    pub disk_in_bytes: u64,
    pub max_containers: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountMode {
    #[default]
    Ro,
    Rw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindMountOrigin {
    #[default]
    Host,
    Container,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    pub mode: BindMountMode,
    pub origin: BindMountOrigin,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Requested handle; empty lets the backend choose one.
    pub handle: String,
    pub grace_time: Duration,
    pub rootfs_path: String,
    pub network: String,
    pub bind_mounts: Vec<BindMount>,
    pub properties: Properties,
    pub env: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentVariable {
    pub key: String,
    pub value: String,
}

impl EnvironmentVariable {
    /// Parse a `KEY=VALUE` entry. The value may itself contain `=`.
    pub fn parse(entry: &str) -> Option<Self> {
        let (key, value) = entry.split_once('=')?;
        if key.is_empty() {
            return None;
        }
        Some(Self {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

/// Per-process rlimits. Unset entries inherit the backend default.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub r#as: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub core: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fsize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub locks: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memlock: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msgqueue: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nice: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nofile: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nproc: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rss: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rtprio: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sigpending: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub script: String,
    pub privileged: bool,
    pub env: Vec<EnvironmentVariable>,
    pub tty: Option<TtySpec>,
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthLimits {
    pub rate_in_bytes_per_second: u64,
    pub burst_rate_in_bytes_per_second: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuLimits {
    pub limit_in_shares: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskLimits {
    pub block_soft: u64,
    pub block_hard: u64,
    pub inode_soft: u64,
    pub inode_hard: u64,
    pub byte_soft: u64,
    pub byte_hard: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryLimits {
    pub limit_in_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandwidthStat {
    pub in_rate: u64,
    pub in_burst: u64,
    pub out_rate: u64,
    pub out_burst: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuStat {
    pub usage: u64,
    pub user: u64,
    pub system: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskStat {
    pub bytes_used: u64,
    pub inodes_used: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryStat {
    pub cache: u64,
    pub rss: u64,
    pub mapped_file: u64,
    pub pgpgin: u64,
    pub pgpgout: u64,
    pub swap: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub inactive_anon: u64,
    pub active_anon: u64,
    pub inactive_file: u64,
    pub active_file: u64,
    pub unevictable: u64,
    pub hierarchical_memory_limit: u64,
    pub hierarchical_memsw_limit: u64,
    pub total_cache: u64,
    pub total_rss: u64,
    pub total_mapped_file: u64,
    pub total_pgpgin: u64,
    pub total_pgpgout: u64,
    pub total_swap: u64,
    pub total_pgfault: u64,
    pub total_pgmajfault: u64,
    pub total_inactive_anon: u64,
    pub total_active_anon: u64,
    pub total_inactive_file: u64,
    pub total_active_file: u64,
    pub total_unevictable: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PortMapping {
    pub host_port: u32,
    pub container_port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub state: String,
    pub events: Vec<String>,
    pub host_ip: String,
    pub container_ip: String,
    pub external_ip: String,
    pub container_path: String,
    pub process_ids: Vec<u32>,
    pub properties: Properties,
    pub bandwidth_stat: BandwidthStat,
    pub cpu_stat: CpuStat,
    pub disk_stat: DiskStat,
    pub memory_stat: MemoryStat,
    pub mapped_ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetProtocol {
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRange {
    pub start: IpAddr,
    pub end: IpAddr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

/// Outbound traffic allowance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetOutRule {
    pub protocol: NetProtocol,
    pub networks: Vec<IpRange>,
    pub ports: Vec<PortRange>,
    pub log: bool,
}

/// Which process stream a chunk of output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSource {
    Stdout,
    Stderr,
    /// Input echoed back by the backend (legacy behaviour).
    Stdin,
}

/// One event from a running process, in production order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Output { source: ProcessSource, data: Bytes },
    Exited(u32),
    Failed(String),
}

/// Live I/O of a process: its event channel and, if it accepts input, a stdin sender.
///
/// Dropping `stdin` closes the process's standard input.
pub struct ProcessStream {
    pub events: mpsc::Receiver<ProcessEvent>,
    pub stdin: Option<mpsc::UnboundedSender<Bytes>>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    async fn ping(&self) -> Result<(), BackendError>;

    async fn capacity(&self) -> Result<Capacity, BackendError>;

    async fn create(&self, spec: ContainerSpec) -> Result<Arc<dyn Container>, BackendError>;

    /// Fails with [`BackendError::ContainerNotFound`] for unknown handles.
    async fn destroy(&self, handle: &str) -> Result<(), BackendError>;

    async fn containers(&self) -> Result<Vec<Arc<dyn Container>>, BackendError>;

    /// Fails with [`BackendError::ContainerNotFound`] for unknown handles.
    async fn lookup(&self, handle: &str) -> Result<Arc<dyn Container>, BackendError>;
}

#[async_trait]
pub trait Container: Send + Sync {
    fn handle(&self) -> String;

    /// Idle time before eviction; zero means never.
    fn grace_time(&self) -> Duration;

    async fn properties(&self) -> Result<Properties, BackendError>;
    async fn get_property(&self, name: &str) -> Result<String, BackendError>;
    async fn set_property(&self, name: &str, value: &str) -> Result<(), BackendError>;
    async fn remove_property(&self, name: &str) -> Result<(), BackendError>;

    async fn stop(&self, kill: bool) -> Result<(), BackendError>;

    async fn info(&self) -> Result<ContainerInfo, BackendError>;

    async fn copy_in(&self, src_path: &str, dst_path: &str) -> Result<(), BackendError>;
    async fn copy_out(&self, src_path: &str, dst_path: &str, owner: &str)
    -> Result<(), BackendError>;

    /// Extract a tar stream into `dst_path`.
    async fn stream_in(&self, dst_path: &str, tar: ByteStream) -> Result<(), BackendError>;
    /// Produce a tar stream of `src_path`.
    async fn stream_out(&self, src_path: &str) -> Result<ByteStream, BackendError>;

    async fn limit_bandwidth(&self, limits: BandwidthLimits) -> Result<(), BackendError>;
    async fn current_bandwidth_limits(&self) -> Result<BandwidthLimits, BackendError>;
    async fn limit_cpu(&self, limits: CpuLimits) -> Result<(), BackendError>;
    async fn current_cpu_limits(&self) -> Result<CpuLimits, BackendError>;
    async fn limit_disk(&self, limits: DiskLimits) -> Result<(), BackendError>;
    async fn current_disk_limits(&self) -> Result<DiskLimits, BackendError>;
    async fn limit_memory(&self, limits: MemoryLimits) -> Result<(), BackendError>;
    async fn current_memory_limits(&self) -> Result<MemoryLimits, BackendError>;

    /// Map a host port to a container port; zero asks the backend to pick.
    async fn net_in(&self, host_port: u32, container_port: u32)
    -> Result<(u32, u32), BackendError>;
    async fn net_out(&self, rule: NetOutRule) -> Result<(), BackendError>;

    /// Spawn a process. Returns its container-unique ID and live I/O.
    async fn run(&self, spec: ProcessSpec) -> Result<(u32, ProcessStream), BackendError>;
    async fn attach(&self, process_id: u32) -> Result<ProcessStream, BackendError>;
}
