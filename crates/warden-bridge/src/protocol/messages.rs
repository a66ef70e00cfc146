//! JSON request and response bodies for unary operations.
//!
//! Request fields that callers may omit are `Option` so the server can tell
//! "absent" from "zero". Response fields decode absence as the zero value.

use serde::{Deserialize, Serialize};

use crate::backend::{
    BandwidthStat, BindMount, CpuStat, DiskStat, EnvironmentVariable, MemoryStat, PortMapping,
    ResourceLimits, TtySpec,
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// Error descriptor carried in every non-2xx response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handle: Option<String>,
    /// Seconds; absent means the server default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grace_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rootfs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub bind_mounts: Vec<BindMount>,
    pub properties: Vec<Property>,
    pub env: Vec<EnvironmentVariable>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CreateResponse {
    pub handle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListResponse {
    pub handles: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StopRequest {
    pub kill: bool,
    /// Reply immediately and stop in the background.
    pub background: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyInRequest {
    pub src_path: String,
    pub dst_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CopyOutRequest {
    pub src_path: String,
    pub dst_path: String,
    pub owner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitBandwidthRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub burst: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitBandwidthResponse {
    pub rate: u64,
    pub burst: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitCpuRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_in_shares: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitCpuResponse {
    pub limit_in_shares: u64,
}

/// Disk limits, including the legacy aliases for the hard limits.
///
/// `block_limit`, `block` and `block_hard` all name the hard block limit
/// (likewise for inodes and bytes).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitDiskRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_soft: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_hard: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub block_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode_soft: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode_hard: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inode_limit: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_soft: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_hard: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_limit: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitDiskResponse {
    pub block_soft: u64,
    pub block_hard: u64,
    pub inode_soft: u64,
    pub inode_hard: u64,
    pub byte_soft: u64,
    pub byte_hard: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitMemoryRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit_in_bytes: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitMemoryResponse {
    pub limit_in_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_port: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_port: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetInResponse {
    pub host_port: u32,
    pub container_port: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyValue {
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InfoResponse {
    pub state: String,
    pub events: Vec<String>,
    pub host_ip: String,
    pub container_ip: String,
    pub external_ip: String,
    pub container_path: String,
    pub process_ids: Vec<u64>,
    pub properties: Vec<Property>,
    pub bandwidth_stat: BandwidthStat,
    pub cpu_stat: CpuStat,
    pub disk_stat: DiskStat,
    pub memory_stat: MemoryStat,
    pub mapped_ports: Vec<PortMapping>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunRequest {
    pub script: String,
    pub privileged: bool,
    pub env: Vec<EnvironmentVariable>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tty: Option<TtySpec>,
    pub rlimits: ResourceLimits,
}

/// Query of a run or attach hijack: output streams the client will collect
/// over auxiliary connections, comma separated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessQuery {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streams: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamInQuery {
    pub destination: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamOutQuery {
    pub source: String,
}
