//! Conversions between wire bodies and backend domain types.
//!
//! Limit requests decode to `None` when no limiting field is present; the
//! server then only reads the current limits.

use std::time::Duration;

use crate::backend::{
    BandwidthLimits, ContainerInfo, ContainerSpec, CpuLimits, DiskLimits, MemoryLimits,
    ProcessSpec, Properties,
};
use crate::protocol::{
    CreateRequest, InfoResponse, LimitBandwidthRequest, LimitBandwidthResponse, LimitCpuRequest,
    LimitCpuResponse, LimitDiskRequest, LimitDiskResponse, LimitMemoryRequest,
    LimitMemoryResponse, Property, RunRequest,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TranslateError {
    #[error("process id {0} does not fit in 32 bits")]
    ProcessIdOutOfRange(u64),
}

pub fn bandwidth_limits(request: &LimitBandwidthRequest) -> Option<BandwidthLimits> {
    if request.rate.is_none() && request.burst.is_none() {
        return None;
    }
    Some(BandwidthLimits {
        rate_in_bytes_per_second: request.rate.unwrap_or_default(),
        burst_rate_in_bytes_per_second: request.burst.unwrap_or_default(),
    })
}

pub fn cpu_limits(request: &LimitCpuRequest) -> Option<CpuLimits> {
    request.limit_in_shares.map(|limit_in_shares| CpuLimits { limit_in_shares })
}

pub fn memory_limits(request: &LimitMemoryRequest) -> Option<MemoryLimits> {
    request
        .limit_in_bytes
        .map(|limit_in_bytes| MemoryLimits { limit_in_bytes })
}

/// Resolve a disk limit request, honouring the legacy hard-limit aliases.
///
/// Aliases are applied in the order `*_hard`, bare name, `*_limit`; the last
/// one present wins.
pub fn disk_limits(request: &LimitDiskRequest) -> Option<DiskLimits> {
    let mut limits = DiskLimits::default();
    let mut setting_limit = false;

    let mut apply = |target: &mut u64, value: Option<u64>| {
        if let Some(value) = value {
            *target = value;
            setting_limit = true;
        }
    };

    apply(&mut limits.block_soft, request.block_soft);
    apply(&mut limits.block_hard, request.block_hard);
    apply(&mut limits.block_hard, request.block);
    apply(&mut limits.block_hard, request.block_limit);

    apply(&mut limits.inode_soft, request.inode_soft);
    apply(&mut limits.inode_hard, request.inode_hard);
    apply(&mut limits.inode_hard, request.inode);
    apply(&mut limits.inode_hard, request.inode_limit);

    apply(&mut limits.byte_soft, request.byte_soft);
    apply(&mut limits.byte_hard, request.byte_hard);
    apply(&mut limits.byte_hard, request.byte);
    apply(&mut limits.byte_hard, request.byte_limit);

    setting_limit.then_some(limits)
}

impl From<BandwidthLimits> for LimitBandwidthResponse {
    fn from(limits: BandwidthLimits) -> Self {
        Self {
            rate: limits.rate_in_bytes_per_second,
            burst: limits.burst_rate_in_bytes_per_second,
        }
    }
}

impl From<LimitBandwidthResponse> for BandwidthLimits {
    fn from(response: LimitBandwidthResponse) -> Self {
        Self {
            rate_in_bytes_per_second: response.rate,
            burst_rate_in_bytes_per_second: response.burst,
        }
    }
}

impl From<BandwidthLimits> for LimitBandwidthRequest {
    fn from(limits: BandwidthLimits) -> Self {
        Self {
            rate: Some(limits.rate_in_bytes_per_second),
            burst: Some(limits.burst_rate_in_bytes_per_second),
        }
    }
}

impl From<CpuLimits> for LimitCpuResponse {
    fn from(limits: CpuLimits) -> Self {
        Self {
            limit_in_shares: limits.limit_in_shares,
        }
    }
}

impl From<LimitCpuResponse> for CpuLimits {
    fn from(response: LimitCpuResponse) -> Self {
        Self {
            limit_in_shares: response.limit_in_shares,
        }
    }
}

impl From<CpuLimits> for LimitCpuRequest {
    fn from(limits: CpuLimits) -> Self {
        Self {
            limit_in_shares: Some(limits.limit_in_shares),
        }
    }
}

impl From<DiskLimits> for LimitDiskResponse {
    fn from(limits: DiskLimits) -> Self {
        Self {
            block_soft: limits.block_soft,
            block_hard: limits.block_hard,
            inode_soft: limits.inode_soft,
            inode_hard: limits.inode_hard,
            byte_soft: limits.byte_soft,
            byte_hard: limits.byte_hard,
        }
    }
}

impl From<LimitDiskResponse> for DiskLimits {
    fn from(response: LimitDiskResponse) -> Self {
        Self {
            block_soft: response.block_soft,
            block_hard: response.block_hard,
            inode_soft: response.inode_soft,
            inode_hard: response.inode_hard,
            byte_soft: response.byte_soft,
            byte_hard: response.byte_hard,
        }
    }
}

impl From<DiskLimits> for LimitDiskRequest {
    fn from(limits: DiskLimits) -> Self {
        Self {
            block_soft: Some(limits.block_soft),
            block_hard: Some(limits.block_hard),
            inode_soft: Some(limits.inode_soft),
            inode_hard: Some(limits.inode_hard),
            byte_soft: Some(limits.byte_soft),
            byte_hard: Some(limits.byte_hard),
            ..Default::default()
        }
    }
}

impl From<MemoryLimits> for LimitMemoryResponse {
    fn from(limits: MemoryLimits) -> Self {
        Self {
            limit_in_bytes: limits.limit_in_bytes,
        }
    }
}

impl From<LimitMemoryResponse> for MemoryLimits {
    fn from(response: LimitMemoryResponse) -> Self {
        Self {
            limit_in_bytes: response.limit_in_bytes,
        }
    }
}

impl From<MemoryLimits> for LimitMemoryRequest {
    fn from(limits: MemoryLimits) -> Self {
        Self {
            limit_in_bytes: Some(limits.limit_in_bytes),
        }
    }
}

/// Flatten a property list into a map; later duplicates overwrite earlier ones.
pub fn properties_from_list(list: Vec<Property>) -> Properties {
    list.into_iter().map(|p| (p.key, p.value)).collect()
}

/// Property map as a list sorted by key.
pub fn properties_to_list(properties: Properties) -> Vec<Property> {
    let mut list: Vec<Property> = properties
        .into_iter()
        .map(|(key, value)| Property { key, value })
        .collect();
    list.sort_by(|a, b| a.key.cmp(&b.key));
    list
}

impl From<ContainerInfo> for InfoResponse {
    fn from(info: ContainerInfo) -> Self {
        Self {
            state: info.state,
            events: info.events,
            host_ip: info.host_ip,
            container_ip: info.container_ip,
            external_ip: info.external_ip,
            container_path: info.container_path,
            process_ids: info.process_ids.into_iter().map(u64::from).collect(),
            properties: properties_to_list(info.properties),
            bandwidth_stat: info.bandwidth_stat,
            cpu_stat: info.cpu_stat,
            disk_stat: info.disk_stat,
            memory_stat: info.memory_stat,
            mapped_ports: info.mapped_ports,
        }
    }
}

impl TryFrom<InfoResponse> for ContainerInfo {
    type Error = TranslateError;

    fn try_from(response: InfoResponse) -> Result<Self, Self::Error> {
        let process_ids = response
            .process_ids
            .into_iter()
            .map(|pid| u32::try_from(pid).map_err(|_| TranslateError::ProcessIdOutOfRange(pid)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            state: response.state,
            events: response.events,
            host_ip: response.host_ip,
            container_ip: response.container_ip,
            external_ip: response.external_ip,
            container_path: response.container_path,
            process_ids,
            properties: properties_from_list(response.properties),
            bandwidth_stat: response.bandwidth_stat,
            cpu_stat: response.cpu_stat,
            disk_stat: response.disk_stat,
            memory_stat: response.memory_stat,
            mapped_ports: response.mapped_ports,
        })
    }
}

/// Build a container spec, falling back to `default_grace_time` when the
/// request carries none.
pub fn container_spec(request: CreateRequest, default_grace_time: Duration) -> ContainerSpec {
    ContainerSpec {
        handle: request.handle.unwrap_or_default(),
        grace_time: request
            .grace_time
            .map(Duration::from_secs)
            .unwrap_or(default_grace_time),
        rootfs_path: request.rootfs.unwrap_or_default(),
        network: request.network.unwrap_or_default(),
        bind_mounts: request.bind_mounts,
        properties: properties_from_list(request.properties),
        env: request.env,
    }
}

/// Whole seconds on the wire; a zero there would mean "never expire".
fn seconds_rounded_up(duration: Duration) -> u64 {
    duration.as_secs() + u64::from(duration.subsec_nanos() > 0)
}

impl From<ContainerSpec> for CreateRequest {
    fn from(spec: ContainerSpec) -> Self {
        let non_empty = |s: String| (!s.is_empty()).then_some(s);
        Self {
            handle: non_empty(spec.handle),
            grace_time: (!spec.grace_time.is_zero()).then(|| seconds_rounded_up(spec.grace_time)),
            rootfs: non_empty(spec.rootfs_path),
            network: non_empty(spec.network),
            bind_mounts: spec.bind_mounts,
            properties: properties_to_list(spec.properties),
            env: spec.env,
        }
    }
}

impl From<RunRequest> for ProcessSpec {
    fn from(request: RunRequest) -> Self {
        Self {
            script: request.script,
            privileged: request.privileged,
            env: request.env,
            tty: request.tty,
            limits: request.rlimits,
        }
    }
}

impl From<ProcessSpec> for RunRequest {
    fn from(spec: ProcessSpec) -> Self {
        Self {
            script: spec.script,
            privileged: spec.privileged,
            env: spec.env,
            tty: spec.tty,
            rlimits: spec.limits,
        }
    }
}
